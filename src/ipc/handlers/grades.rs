use crate::calc::load_grades;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{calc_err, db_err, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const BULK_UPSERT_MAX_ENTRIES: usize = 5000;

#[derive(Debug, Clone)]
struct GradeEdit {
    student_id: String,
    title: String,
    score: f64,
    date: String,
}

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn bad_params(message: impl Into<String>, details: Option<serde_json::Value>) -> Self {
        Self {
            code: "bad_params",
            message: message.into(),
            details,
        }
    }

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn parse_grade_edit(raw: &serde_json::Value) -> Result<GradeEdit, HandlerErr> {
    let text = |key: &str| {
        raw.get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };
    let Some(student_id) = text("studentId") else {
        return Err(HandlerErr::bad_params("missing studentId", None));
    };
    let Some(title) = text("title") else {
        return Err(HandlerErr::bad_params("missing title", None));
    };
    let Some(score) = raw.get("score").and_then(|v| v.as_f64()) else {
        return Err(HandlerErr::bad_params("score must be a number", None));
    };
    if !score.is_finite() || score < 0.0 {
        return Err(HandlerErr::bad_params(
            "score must be a non-negative number",
            Some(json!({ "score": score })),
        ));
    }
    let date = match text("date") {
        Some(d) => match NaiveDate::parse_from_str(&d, "%Y-%m-%d") {
            Ok(parsed) => parsed,
            Err(_) => {
                return Err(HandlerErr::bad_params(
                    "date must be YYYY-MM-DD",
                    Some(json!({ "date": d })),
                ))
            }
        },
        None => chrono::Local::now().date_naive(),
    };
    Ok(GradeEdit {
        student_id,
        title,
        score,
        date: date.format("%Y-%m-%d").to_string(),
    })
}

fn ensure_student_in_class(
    conn: &Connection,
    class_id: &str,
    student_id: &str,
) -> Result<(), HandlerErr> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM students WHERE id = ? AND class_id = ?",
            (student_id, class_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    if found.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found in class".to_string(),
            details: Some(json!({ "studentId": student_id, "classId": class_id })),
        });
    }
    Ok(())
}

fn upsert_grade(conn: &Connection, class_id: &str, edit: &GradeEdit) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO grades(id, class_id, student_id, title, score, date)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(class_id, student_id, title) DO UPDATE SET
           score = excluded.score,
           date = excluded.date",
        (
            Uuid::new_v4().to_string(),
            class_id,
            &edit.student_id,
            &edit.title,
            edit.score,
            &edit.date,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "grades" })),
    })?;
    Ok(())
}

fn handle_grades_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_id = optional_str(req, "studentId");
    match load_grades(conn, &class_id, student_id.as_deref()) {
        Ok(grades) => ok(&req.id, json!({ "grades": grades })),
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_grades_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let edit = match parse_grade_edit(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = ensure_student_in_class(conn, &class_id, &edit.student_id) {
        return e.response(&req.id);
    }
    if let Err(e) = upsert_grade(conn, &class_id, &edit) {
        return e.response(&req.id);
    }
    ok(
        &req.id,
        json!({
            "studentId": edit.student_id,
            "title": edit.title,
            "score": edit.score,
            "date": edit.date
        }),
    )
}

/// All-or-nothing: one bad entry rejects the whole batch.
fn handle_grades_bulk_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(entries) = req.params.get("entries").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "entries must be an array", None);
    };
    if entries.len() > BULK_UPSERT_MAX_ENTRIES {
        return err(
            &req.id,
            "bad_params",
            "too many entries in one batch",
            Some(json!({ "count": entries.len(), "max": BULK_UPSERT_MAX_ENTRIES })),
        );
    }

    let mut edits = Vec::with_capacity(entries.len());
    for (i, raw) in entries.iter().enumerate() {
        match parse_grade_edit(raw) {
            Ok(e) => edits.push(e),
            Err(mut e) => {
                e.details = Some(json!({ "index": i, "reason": e.details }));
                return e.response(&req.id);
            }
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    for (i, edit) in edits.iter().enumerate() {
        let res = ensure_student_in_class(&tx, &class_id, &edit.student_id)
            .and_then(|_| upsert_grade(&tx, &class_id, edit));
        if let Err(mut e) = res {
            let _ = tx.rollback();
            e.details = Some(json!({ "index": i, "reason": e.details }));
            return e.response(&req.id);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    tracing::debug!(class = %class_id, count = edits.len(), "grades upserted");
    ok(&req.id, json!({ "updated": edits.len() }))
}

fn handle_grades_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match conn.execute(
        "DELETE FROM grades WHERE class_id = ? AND student_id = ? AND title = ?",
        (&class_id, &student_id, &title),
    ) {
        // Deleting a grade that was never entered is not an error: the
        // cell already reads as 0.
        Ok(n) => ok(&req.id, json!({ "deleted": n })),
        Err(e) => db_err(&req.id, "db_delete_failed", e, "grades"),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.list" => Some(handle_grades_list(state, req)),
        "grades.upsert" => Some(handle_grades_upsert(state, req)),
        "grades.bulkUpsert" => Some(handle_grades_bulk_upsert(state, req)),
        "grades.delete" => Some(handle_grades_delete(state, req)),
        _ => None,
    }
}
