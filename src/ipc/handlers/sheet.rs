use crate::calc::{self, CalcContext};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{calc_err, required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_sheet_resolve(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let structure_id = match required_str(req, "structureId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let group_id = match required_str(req, "groupId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let column_id = match required_str(req, "columnId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let ctx = CalcContext {
        conn,
        class_id: &class_id,
        structure_id: &structure_id,
    };
    match calc::compute_cell(&ctx, &student_id, &group_id, &column_id) {
        Ok(value) => ok(
            &req.id,
            json!({
                "studentId": student_id,
                "groupId": group_id,
                "columnId": column_id,
                "value": value
            }),
        ),
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_sheet_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let structure_id = match required_str(req, "structureId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let ctx = CalcContext {
        conn,
        class_id: &class_id,
        structure_id: &structure_id,
    };
    match calc::compute_student_sheet(&ctx, &student_id) {
        Ok(sheet) => ok(&req.id, json!({ "sheet": sheet })),
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_sheet_class(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let structure_id = match required_str(req, "structureId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let ctx = CalcContext {
        conn,
        class_id: &class_id,
        structure_id: &structure_id,
    };
    match calc::compute_class_sheet(&ctx) {
        Ok(sheet) => ok(&req.id, json!({ "sheet": sheet })),
        Err(e) => calc_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sheet.resolve" => Some(handle_sheet_resolve(state, req)),
        "sheet.student" => Some(handle_sheet_student(state, req)),
        "sheet.class" => Some(handle_sheet_class(state, req)),
        _ => None,
    }
}
