use crate::calc::load_structure;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{calc_err, db_err, required_str};
use crate::ipc::types::{AppState, Request};
use crate::structure::{parse_and_check, parse_structure, validate, StructureError};
use serde_json::json;

fn structure_err(id: &str, e: StructureError) -> serde_json::Value {
    let details = match &e {
        StructureError::Invalid(issues) => Some(json!({ "issues": issues })),
        _ => None,
    };
    err(id, "bad_structure", e.to_string(), details)
}

fn handle_structures_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let mut stmt = match conn.prepare(
        "SELECT id, name, updated_at FROM grading_structures ORDER BY name, id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            let updated_at: Option<String> = r.get(2)?;
            Ok(json!({ "id": id, "name": name, "updatedAt": updated_at }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(structures) => ok(&req.id, json!({ "structures": structures })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_structures_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let structure_id = match required_str(req, "structureId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match load_structure(conn, &structure_id) {
        Ok(structure) => ok(&req.id, json!({ "structure": structure })),
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_structures_validate(_state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(raw) = req.params.get("structure") else {
        return err(&req.id, "bad_params", "missing structure", None);
    };
    match parse_structure(raw) {
        Ok(structure) => {
            let issues = validate(&structure);
            let blocking = issues.iter().any(|i| i.is_blocking());
            ok(
                &req.id,
                json!({ "valid": !blocking, "issues": issues }),
            )
        }
        Err(e) => structure_err(&req.id, e),
    }
}

fn handle_structures_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(raw) = req.params.get("structure") else {
        return err(&req.id, "bad_params", "missing structure", None);
    };
    let (structure, warnings) = match parse_and_check(raw) {
        Ok(v) => v,
        Err(e) => return structure_err(&req.id, e),
    };
    let body = match serde_json::to_string(&structure) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "bad_structure", e.to_string(), None),
    };

    if let Err(e) = conn.execute(
        "INSERT INTO grading_structures(id, name, body_json, updated_at)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           name = excluded.name,
           body_json = excluded.body_json,
           updated_at = excluded.updated_at",
        (
            &structure.id,
            &structure.name,
            &body,
            chrono::Utc::now().to_rfc3339(),
        ),
    ) {
        return db_err(&req.id, "db_insert_failed", e, "grading_structures");
    }

    if !warnings.is_empty() {
        tracing::warn!(
            structure = %structure.id,
            warnings = warnings.len(),
            "grading structure saved with warnings"
        );
    }
    ok(
        &req.id,
        json!({ "structureId": structure.id, "warnings": warnings }),
    )
}

fn handle_structures_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let structure_id = match required_str(req, "structureId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match conn.execute(
        "DELETE FROM grading_structures WHERE id = ?",
        [&structure_id],
    ) {
        Ok(0) => err(&req.id, "not_found", "grading structure not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => db_err(&req.id, "db_delete_failed", e, "grading_structures"),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "structures.list" => Some(handle_structures_list(state, req)),
        "structures.get" => Some(handle_structures_get(state, req)),
        "structures.validate" => Some(handle_structures_validate(state, req)),
        "structures.save" => Some(handle_structures_save(state, req)),
        "structures.delete" => Some(handle_structures_delete(state, req)),
        _ => None,
    }
}
