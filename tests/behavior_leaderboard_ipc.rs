use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_teacherhubd");
    let mut child = Command::new(exe)
        .env_remove("TEACHERHUBD_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn teacherhubd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn leaderboard_ranks_by_points_and_honours_limit_setting() {
    let workspace = temp_dir("teacherhub-behavior");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class_id = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "5C" }),
    )["classId"]
        .as_str()
        .expect("classId")
        .to_string();
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.bulkCreate",
        json!({ "classId": class_id, "names": ["Zed", "Amy", "Lou"] }),
    );
    let ids: Vec<String> = created["created"]
        .as_array()
        .expect("created")
        .iter()
        .map(|s| s["studentId"].as_str().expect("id").to_string())
        .collect();
    let (zed, amy, lou) = (&ids[0], &ids[1], &ids[2]);

    let mut n = 0;
    for (student, points) in [(zed, 3), (zed, -1), (amy, 2), (lou, -2)] {
        n += 1;
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("add{}", n),
            "behavior.add",
            json!({ "classId": class_id, "studentId": student, "points": points, "note": "class work" }),
        );
    }

    let zero = request(
        &mut stdin,
        &mut reader,
        "4",
        "behavior.add",
        json!({ "classId": class_id, "studentId": zed, "points": 0 }),
    );
    assert_eq!(zero["error"]["code"], json!("bad_params"));
    let huge = request(
        &mut stdin,
        &mut reader,
        "4b",
        "behavior.add",
        json!({ "classId": class_id, "studentId": zed, "points": i64::MAX }),
    );
    assert_eq!(huge["error"]["code"], json!("bad_params"));
    assert_eq!(huge["error"]["details"]["maxAbs"], json!(1000));

    let board = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "behavior.leaderboard",
        json!({ "classId": class_id }),
    );
    assert_eq!(board["limit"], json!(10));
    let entries = board["entries"].as_array().expect("entries");
    let summary: Vec<(u64, &str, i64)> = entries
        .iter()
        .map(|e| {
            (
                e["rank"].as_u64().expect("rank"),
                e["displayName"].as_str().expect("name"),
                e["points"].as_i64().expect("points"),
            )
        })
        .collect();
    // Amy and Zed tie on 2; the tie is broken by name.
    assert_eq!(summary, vec![(1, "Amy", 2), (1, "Zed", 2), (3, "Lou", -2)]);
    assert_eq!(entries[1]["positiveCount"], json!(1));
    assert_eq!(entries[1]["negativeCount"], json!(1));

    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "settings.set",
        json!({ "key": "behavior.leaderboardSize", "value": 2 }),
    );
    let limited = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "behavior.leaderboard",
        json!({ "classId": class_id }),
    );
    assert_eq!(limited["limit"], json!(2));
    assert_eq!(limited["entries"].as_array().expect("entries").len(), 2);

    let explicit = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "behavior.leaderboard",
        json!({ "classId": class_id, "limit": 1 }),
    );
    assert_eq!(explicit["entries"].as_array().expect("entries").len(), 1);

    let notes = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "behavior.list",
        json!({ "classId": class_id, "studentId": zed }),
    );
    let notes = notes["notes"].as_array().expect("notes");
    assert_eq!(notes.len(), 2);
    let note_id = notes[0]["id"].as_str().expect("note id").to_string();

    request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "behavior.delete",
        json!({ "noteId": note_id }),
    );
    let missing = request(
        &mut stdin,
        &mut reader,
        "11",
        "behavior.delete",
        json!({ "noteId": note_id }),
    );
    assert_eq!(missing["error"]["code"], json!("not_found"));

    drop(stdin);
    let _ = child.wait();
}
