use crate::behavior::{leaderboard, BehaviorNote};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_err, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const LEADERBOARD_SIZE_KEY: &str = "behavior.leaderboardSize";
const DEFAULT_LEADERBOARD_SIZE: usize = 10;
const MAX_NOTE_POINTS: i64 = 1000;

fn load_notes(
    conn: &Connection,
    class_id: &str,
    student_id: Option<&str>,
) -> rusqlite::Result<Vec<BehaviorNote>> {
    let mut stmt = conn.prepare(
        "SELECT id, student_id, points, note, created_at
         FROM behavior_notes
         WHERE class_id = ?1 AND (?2 IS NULL OR student_id = ?2)
         ORDER BY created_at DESC, id",
    )?;
    let rows = stmt.query_map((class_id, student_id), |r| {
        Ok(BehaviorNote {
            id: r.get(0)?,
            student_id: r.get(1)?,
            points: r.get(2)?,
            note: r.get(3)?,
            created_at: r.get(4)?,
        })
    })?;
    rows.collect()
}

fn handle_behavior_add(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let points = match req.params.get("points").and_then(|v| v.as_i64()) {
        Some(p) if p != 0 && p.abs() <= MAX_NOTE_POINTS => p,
        _ => {
            return err(
                &req.id,
                "bad_params",
                "points must be a non-zero integer",
                Some(json!({ "maxAbs": MAX_NOTE_POINTS })),
            )
        }
    };
    let note = optional_str(req, "note").unwrap_or_default();

    let in_class: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM students WHERE id = ? AND class_id = ?",
            (&student_id, &class_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if in_class.is_none() {
        return err(&req.id, "not_found", "student not found in class", None);
    }

    let note_id = Uuid::new_v4().to_string();
    let created_at = chrono::Utc::now().to_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO behavior_notes(id, class_id, student_id, points, note, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&note_id, &class_id, &student_id, points, &note, &created_at),
    ) {
        return db_err(&req.id, "db_insert_failed", e, "behavior_notes");
    }

    let created = BehaviorNote {
        id: note_id,
        student_id,
        points,
        note,
        created_at,
    };
    ok(&req.id, json!({ "note": created }))
}

fn handle_behavior_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_id = optional_str(req, "studentId");
    match load_notes(conn, &class_id, student_id.as_deref()) {
        Ok(notes) => ok(&req.id, json!({ "notes": notes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_behavior_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let note_id = match required_str(req, "noteId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match conn.execute("DELETE FROM behavior_notes WHERE id = ?", [&note_id]) {
        Ok(0) => err(&req.id, "not_found", "behavior note not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => db_err(&req.id, "db_delete_failed", e, "behavior_notes"),
    }
}

fn leaderboard_limit(conn: &Connection, req: &Request) -> Result<usize, serde_json::Value> {
    if let Some(v) = req.params.get("limit").filter(|v| !v.is_null()) {
        return match v.as_u64() {
            Some(n) if n > 0 => Ok(n as usize),
            _ => Err(err(
                &req.id,
                "bad_params",
                "limit must be a positive integer",
                None,
            )),
        };
    }
    // A missing or malformed setting falls back to the default.
    let configured = db::settings_get_json(conn, LEADERBOARD_SIZE_KEY)
        .ok()
        .flatten()
        .and_then(|v| v.as_u64())
        .filter(|n| *n > 0);
    Ok(configured
        .map(|n| n as usize)
        .unwrap_or(DEFAULT_LEADERBOARD_SIZE))
}

fn handle_behavior_leaderboard(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let limit = match leaderboard_limit(conn, req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let mut stmt =
        match conn.prepare("SELECT id, name FROM students WHERE class_id = ? ORDER BY sort_order") {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
    let students: Vec<(String, String)> = match stmt
        .query_map([&class_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let notes = match load_notes(conn, &class_id, None) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let entries = leaderboard(&students, &notes, Some(limit));
    ok(&req.id, json!({ "limit": limit, "entries": entries }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "behavior.add" => Some(handle_behavior_add(state, req)),
        "behavior.list" => Some(handle_behavior_list(state, req)),
        "behavior.delete" => Some(handle_behavior_delete(state, req)),
        "behavior.leaderboard" => Some(handle_behavior_leaderboard(state, req)),
        _ => None,
    }
}
