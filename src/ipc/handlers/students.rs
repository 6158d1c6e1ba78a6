use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_err, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const BULK_CREATE_MAX: usize = 1000;

fn class_exists(conn: &Connection, class_id: &str) -> rusqlite::Result<bool> {
    conn.query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
}

fn next_sort_order(conn: &Connection, class_id: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students WHERE class_id = ?",
        [class_id],
        |r| r.get(0),
    )
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let mut stmt = match conn.prepare(
        "SELECT id, name, avatar_url, sort_order
         FROM students
         WHERE class_id = ?
         ORDER BY sort_order, name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&class_id], |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            let avatar_url: Option<String> = r.get(2)?;
            let sort_order: i64 = r.get(3)?;
            Ok(json!({
                "id": id,
                "name": name,
                "avatarUrl": avatar_url,
                "sortOrder": sort_order
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let avatar_url = optional_str(req, "avatarUrl");

    match class_exists(conn, &class_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    let sort_order = match next_sort_order(conn, &class_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, class_id, name, avatar_url, sort_order, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &class_id,
            &name,
            &avatar_url,
            sort_order,
            chrono::Utc::now().to_rfc3339(),
        ),
    ) {
        return db_err(&req.id, "db_insert_failed", e, "students");
    }

    ok(
        &req.id,
        json!({ "studentId": student_id, "name": name, "sortOrder": sort_order }),
    )
}

/// Bulk import from a pasted roster. Blank lines are skipped, order is kept.
fn handle_students_bulk_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(raw_names) = req.params.get("names").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "names must be an array", None);
    };
    if raw_names.len() > BULK_CREATE_MAX {
        return err(
            &req.id,
            "bad_params",
            "too many names in one import",
            Some(json!({ "count": raw_names.len(), "max": BULK_CREATE_MAX })),
        );
    }
    let names: Vec<String> = raw_names
        .iter()
        .filter_map(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    match class_exists(conn, &class_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let mut sort_order = match next_sort_order(&tx, &class_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let now = chrono::Utc::now().to_rfc3339();
    let mut created: Vec<serde_json::Value> = Vec::with_capacity(names.len());
    for name in &names {
        let student_id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO students(id, class_id, name, sort_order, created_at)
             VALUES(?, ?, ?, ?, ?)",
            (&student_id, &class_id, name, sort_order, &now),
        ) {
            let _ = tx.rollback();
            return db_err(&req.id, "db_insert_failed", e, "students");
        }
        created.push(json!({ "studentId": student_id, "name": name, "sortOrder": sort_order }));
        sort_order += 1;
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    tracing::info!(class = %class_id, count = created.len(), "students imported");
    ok(
        &req.id,
        json!({
            "created": created,
            "skipped": raw_names.len() - names.len()
        }),
    )
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let name = optional_str(req, "name");
    // `avatarUrl: null` clears the avatar; an absent key leaves it alone.
    let avatar = req.params.get("avatarUrl").map(|v| {
        v.as_str()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    });
    if name.is_none() && avatar.is_none() {
        return err(&req.id, "bad_params", "nothing to update", None);
    }

    let changed = conn.execute(
        "UPDATE students SET
           name = COALESCE(?1, name),
           avatar_url = CASE WHEN ?2 THEN ?3 ELSE avatar_url END
         WHERE id = ?4",
        (
            &name,
            avatar.is_some(),
            avatar.clone().flatten(),
            &student_id,
        ),
    );
    match changed {
        Ok(0) => err(&req.id, "not_found", "student not found", None),
        Ok(_) => ok(&req.id, json!({ "studentId": student_id })),
        Err(e) => db_err(&req.id, "db_update_failed", e, "students"),
    }
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    for (table, sql) in [
        ("grades", "DELETE FROM grades WHERE student_id = ?"),
        ("behavior_notes", "DELETE FROM behavior_notes WHERE student_id = ?"),
    ] {
        if let Err(e) = tx.execute(sql, [&student_id]) {
            let _ = tx.rollback();
            return db_err(&req.id, "db_delete_failed", e, table);
        }
    }
    let removed = match tx.execute("DELETE FROM students WHERE id = ?", [&student_id]) {
        Ok(n) => n,
        Err(e) => {
            let _ = tx.rollback();
            return db_err(&req.id, "db_delete_failed", e, "students");
        }
    };
    if removed == 0 {
        let _ = tx.rollback();
        return err(&req.id, "not_found", "student not found", None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.bulkCreate" => Some(handle_students_bulk_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
