use crate::structure::{dependencies, ColumnKey, ColumnType, GradingStructure};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRecord {
    pub student_id: String,
    /// Column id the grade belongs to.
    pub title: String,
    pub score: f64,
    pub date: Option<String>,
}

/// Lookup table for leaf scores keyed by `(student_id, column_id)`.
#[derive(Debug, Clone, Default)]
pub struct GradeIndex {
    scores: HashMap<(String, String), f64>,
}

impl GradeIndex {
    /// When several records share a pair the first one wins.
    pub fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a GradeRecord>,
    {
        let mut scores = HashMap::new();
        for r in records {
            scores
                .entry((r.student_id.clone(), r.title.clone()))
                .or_insert(r.score);
        }
        Self { scores }
    }

    pub fn get(&self, student_id: &str, column_id: &str) -> Option<f64> {
        self.scores
            .get(&(student_id.to_string(), column_id.to_string()))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }
}

/// Value of `column` (which sits in `group`) for one student.
///
/// Score columns read the persisted grade; every other type sums the columns
/// it depends on. A column id the structure does not know is treated as a
/// score lookup. Anything missing counts as 0 and nothing is rounded.
/// A column reached again while it is still being evaluated contributes 0,
/// so cyclic structures still terminate.
pub fn resolve(
    student_id: &str,
    column_id: &str,
    group_id: &str,
    structure: &GradingStructure,
    grades: &GradeIndex,
) -> f64 {
    match structure.locate(group_id, column_id) {
        Some(key) => resolve_key(student_id, key, structure, grades),
        // Not part of the structure: only a bare score lookup is meaningful.
        None => grades.get(student_id, column_id).unwrap_or(0.0),
    }
}

pub fn resolve_key(
    student_id: &str,
    key: ColumnKey,
    structure: &GradingStructure,
    grades: &GradeIndex,
) -> f64 {
    Evaluation::new(student_id, structure, grades).value(key)
}

/// Resolution state for one student. Values are memoized per column so a
/// column shared by many paths is summed once. A value whose evaluation cut
/// a cycle depends on the path that reached it and is not memoized.
struct Evaluation<'a> {
    student_id: &'a str,
    structure: &'a GradingStructure,
    grades: &'a GradeIndex,
    on_path: HashSet<ColumnKey>,
    memo: HashMap<ColumnKey, f64>,
    cycle_cuts: usize,
}

impl<'a> Evaluation<'a> {
    fn new(student_id: &'a str, structure: &'a GradingStructure, grades: &'a GradeIndex) -> Self {
        Self {
            student_id,
            structure,
            grades,
            on_path: HashSet::new(),
            memo: HashMap::new(),
            cycle_cuts: 0,
        }
    }

    fn value(&mut self, key: ColumnKey) -> f64 {
        let Some(column) = self.structure.column_at(key) else {
            return 0.0;
        };
        if column.column_type == ColumnType::Score {
            return self.grades.get(self.student_id, &column.id).unwrap_or(0.0);
        }
        if let Some(v) = self.memo.get(&key) {
            return *v;
        }
        if !self.on_path.insert(key) {
            tracing::debug!(
                column = %self.structure.label(key),
                structure = %self.structure.id,
                "cyclic column reference, contributing 0"
            );
            self.cycle_cuts += 1;
            return 0.0;
        }

        let cuts_before = self.cycle_cuts;
        let mut sum = 0.0;
        for dep in dependencies(self.structure, key).resolved {
            sum += self.value(dep);
        }

        self.on_path.remove(&key);
        if self.cycle_cuts == cuts_before {
            self.memo.insert(key, sum);
        }
        sum
    }
}

pub fn percent_of(value: f64, max_score: f64) -> Option<f64> {
    if max_score > 0.0 {
        Some(100.0 * value / max_score)
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnValue {
    pub column_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    pub max_score: f64,
    pub value: f64,
    pub percent: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupValues {
    pub group_id: String,
    pub name: String,
    pub color: Option<String>,
    pub columns: Vec<ColumnValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentSheet {
    pub student_id: String,
    pub display_name: String,
    pub groups: Vec<GroupValues>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnAverage {
    pub group_id: String,
    pub column_id: String,
    pub average: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassSheet {
    pub structure_id: String,
    pub structure_name: String,
    pub students: Vec<StudentSheet>,
    pub column_averages: Vec<ColumnAverage>,
}

#[derive(Debug, Clone)]
pub struct SheetStudent {
    pub id: String,
    pub display_name: String,
}

pub fn resolve_student(
    student: &SheetStudent,
    structure: &GradingStructure,
    grades: &GradeIndex,
) -> StudentSheet {
    let mut eval = Evaluation::new(&student.id, structure, grades);
    let groups = structure
        .groups
        .iter()
        .enumerate()
        .map(|(group_idx, g)| GroupValues {
            group_id: g.id.clone(),
            name: g.name.clone(),
            color: g.color.clone(),
            columns: g
                .columns
                .iter()
                .enumerate()
                .map(|(column_idx, c)| {
                    let value = eval.value(ColumnKey {
                        group_idx,
                        column_idx,
                    });
                    ColumnValue {
                        column_id: c.id.clone(),
                        name: c.name.clone(),
                        column_type: c.column_type,
                        max_score: c.max_score,
                        value,
                        percent: percent_of(value, c.max_score),
                    }
                })
                .collect(),
        })
        .collect();

    StudentSheet {
        student_id: student.id.clone(),
        display_name: student.display_name.clone(),
        groups,
    }
}

pub fn resolve_class(
    students: &[SheetStudent],
    structure: &GradingStructure,
    grades: &GradeIndex,
) -> ClassSheet {
    let sheets: Vec<StudentSheet> = students
        .iter()
        .map(|s| resolve_student(s, structure, grades))
        .collect();

    let mut column_averages = Vec::new();
    for (group_idx, g) in structure.groups.iter().enumerate() {
        for (column_idx, c) in g.columns.iter().enumerate() {
            let total: f64 = sheets
                .iter()
                .map(|s| s.groups[group_idx].columns[column_idx].value)
                .sum();
            let average = if sheets.is_empty() {
                0.0
            } else {
                total / (sheets.len() as f64)
            };
            column_averages.push(ColumnAverage {
                group_id: g.id.clone(),
                column_id: c.id.clone(),
                average,
            });
        }
    }

    ClassSheet {
        structure_id: structure.id.clone(),
        structure_name: structure.name.clone(),
        students: sheets,
        column_averages,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

fn db_err(e: rusqlite::Error) -> CalcError {
    CalcError::new("db_query_failed", e.to_string())
}

/// Everything a sheet request needs to load its inputs from the workspace.
#[derive(Debug, Clone)]
pub struct CalcContext<'a> {
    pub conn: &'a Connection,
    pub class_id: &'a str,
    pub structure_id: &'a str,
}

pub fn load_structure(conn: &Connection, structure_id: &str) -> Result<GradingStructure, CalcError> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body_json FROM grading_structures WHERE id = ?",
            [structure_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    let Some(body) = body else {
        return Err(CalcError::new("not_found", "grading structure not found"));
    };
    serde_json::from_str(&body).map_err(|e| {
        let mut ce = CalcError::new("bad_structure", "stored grading structure is unreadable");
        ce.details = Some(serde_json::json!({ "structureId": structure_id, "error": e.to_string() }));
        ce
    })
}

pub fn load_students(
    conn: &Connection,
    class_id: &str,
    only_student: Option<&str>,
) -> Result<Vec<SheetStudent>, CalcError> {
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| r.get(0))
        .optional()
        .map_err(db_err)?;
    if exists.is_none() {
        return Err(CalcError::new("not_found", "class not found"));
    }

    let mut stmt = conn
        .prepare(
            "SELECT id, name
             FROM students
             WHERE class_id = ?1 AND (?2 IS NULL OR id = ?2)
             ORDER BY sort_order, name",
        )
        .map_err(db_err)?;
    let students = stmt
        .query_map((class_id, only_student), |r| {
            Ok(SheetStudent {
                id: r.get(0)?,
                display_name: r.get(1)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    if let Some(sid) = only_student {
        if students.is_empty() {
            let mut ce = CalcError::new("not_found", "student not found");
            ce.details = Some(serde_json::json!({ "studentId": sid }));
            return Err(ce);
        }
    }
    Ok(students)
}

pub fn load_grades(
    conn: &Connection,
    class_id: &str,
    only_student: Option<&str>,
) -> Result<Vec<GradeRecord>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT student_id, title, score, date
             FROM grades
             WHERE class_id = ?1 AND (?2 IS NULL OR student_id = ?2)
             ORDER BY student_id, title",
        )
        .map_err(db_err)?;
    stmt.query_map((class_id, only_student), |r| {
        Ok(GradeRecord {
            student_id: r.get(0)?,
            title: r.get(1)?,
            score: r.get(2)?,
            date: r.get(3)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(db_err)
}

pub fn compute_class_sheet(ctx: &CalcContext<'_>) -> Result<ClassSheet, CalcError> {
    let structure = load_structure(ctx.conn, ctx.structure_id)?;
    let students = load_students(ctx.conn, ctx.class_id, None)?;
    let grades = load_grades(ctx.conn, ctx.class_id, None)?;
    let index = GradeIndex::from_records(&grades);
    tracing::debug!(
        class = ctx.class_id,
        structure = ctx.structure_id,
        students = students.len(),
        grades = index.len(),
        "computing class sheet"
    );
    Ok(resolve_class(&students, &structure, &index))
}

pub fn compute_student_sheet(
    ctx: &CalcContext<'_>,
    student_id: &str,
) -> Result<StudentSheet, CalcError> {
    let structure = load_structure(ctx.conn, ctx.structure_id)?;
    let students = load_students(ctx.conn, ctx.class_id, Some(student_id))?;
    let grades = load_grades(ctx.conn, ctx.class_id, Some(student_id))?;
    let index = GradeIndex::from_records(&grades);
    let Some(student) = students.first() else {
        return Err(CalcError::new("not_found", "student not found"));
    };
    Ok(resolve_student(student, &structure, &index))
}

pub fn compute_cell(
    ctx: &CalcContext<'_>,
    student_id: &str,
    group_id: &str,
    column_id: &str,
) -> Result<f64, CalcError> {
    let structure = load_structure(ctx.conn, ctx.structure_id)?;
    load_students(ctx.conn, ctx.class_id, Some(student_id))?;
    if structure.locate(group_id, column_id).is_none() {
        let mut ce = CalcError::new("not_found", "column not found in grading structure");
        ce.details = Some(serde_json::json!({ "groupId": group_id, "columnId": column_id }));
        return Err(ce);
    }
    let grades = load_grades(ctx.conn, ctx.class_id, Some(student_id))?;
    let index = GradeIndex::from_records(&grades);
    Ok(resolve(student_id, column_id, group_id, &structure, &index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::parse_structure;
    use serde_json::json;

    fn grade(student: &str, title: &str, score: f64) -> GradeRecord {
        GradeRecord {
            student_id: student.to_string(),
            title: title.to_string(),
            score,
            date: None,
        }
    }

    fn structure() -> GradingStructure {
        parse_structure(&json!({
            "id": "science",
            "name": "Science",
            "groups": [
                {
                    "id": "hw",
                    "name": "Homework",
                    "columns": [
                        { "id": "hw1", "maxScore": 5, "type": "score" },
                        { "id": "hw2", "maxScore": 5, "type": "score" },
                        { "id": "hw_pair", "type": "internal_sum", "sourceColumns": ["hw1", "hw2", "ghost"] },
                        { "id": "hw_total", "maxScore": 10, "type": "total" }
                    ]
                },
                {
                    "id": "exam",
                    "name": "Exams",
                    "columns": [
                        { "id": "mid", "maxScore": 50, "type": "score" },
                        { "id": "fin", "maxScore": 50, "type": "score" },
                        { "id": "exam_total", "type": "total", "sourceColumns": ["fin"] }
                    ]
                },
                {
                    "id": "summary",
                    "columns": [
                        { "id": "grand", "type": "grand_total", "sourceGroupIds": ["hw", "exam"] },
                        { "id": "mixed", "type": "group_sum", "sourceGroupIds": ["hw", "exam:mid", "missing"] },
                        { "id": "ext", "type": "external_sum", "externalSourceColumns": ["hw:hw2", "exam:fin", "hw"] }
                    ]
                }
            ]
        }))
        .expect("structure")
    }

    fn grades() -> GradeIndex {
        GradeIndex::from_records(&vec![
            grade("s1", "hw1", 3.0),
            grade("s1", "hw2", 4.0),
            grade("s1", "mid", 40.0),
            grade("s1", "fin", 45.5),
            grade("s2", "hw1", 5.0),
        ])
    }

    #[test]
    fn score_column_reads_grade_or_zero() {
        let s = structure();
        let g = grades();
        assert_eq!(resolve("s1", "hw1", "hw", &s, &g), 3.0);
        assert_eq!(resolve("s2", "hw2", "hw", &s, &g), 0.0);
        assert_eq!(resolve("nobody", "hw1", "hw", &s, &g), 0.0);
    }

    #[test]
    fn total_without_sources_sums_group_scores() {
        // Homework 3 + 4 -> 7.
        assert_eq!(resolve("s1", "hw_total", "hw", &structure(), &grades()), 7.0);
    }

    #[test]
    fn total_with_sources_only_uses_listed_columns() {
        assert_eq!(resolve("s1", "exam_total", "exam", &structure(), &grades()), 45.5);
    }

    #[test]
    fn internal_sum_skips_unknown_ids() {
        assert_eq!(resolve("s1", "hw_pair", "hw", &structure(), &grades()), 7.0);
    }

    #[test]
    fn grand_total_sums_group_totals() {
        let s = structure();
        let g = grades();
        let expected = resolve("s1", "hw_total", "hw", &s, &g)
            + resolve("s1", "exam_total", "exam", &s, &g);
        assert_eq!(resolve("s1", "grand", "summary", &s, &g), expected);
        assert_eq!(expected, 52.5);
    }

    #[test]
    fn group_sum_accepts_composite_keys() {
        // hw total 7 + exam:mid 40, "missing" contributes 0.
        assert_eq!(resolve("s1", "mixed", "summary", &structure(), &grades()), 47.0);
    }

    #[test]
    fn external_sum_ignores_bare_group_ids() {
        assert_eq!(resolve("s1", "ext", "summary", &structure(), &grades()), 49.5);
    }

    #[test]
    fn unknown_column_resolves_as_score_lookup() {
        let s = structure();
        let g = grades();
        assert_eq!(resolve("s1", "mid", "nowhere", &s, &g), 40.0);
        assert_eq!(resolve("s1", "nothing", "hw", &s, &g), 0.0);
    }

    #[test]
    fn resolving_twice_gives_same_value() {
        let s = structure();
        let g = grades();
        let a = resolve("s1", "grand", "summary", &s, &g);
        let b = resolve("s1", "grand", "summary", &s, &g);
        assert_eq!(a, b);
    }

    #[test]
    fn first_duplicate_grade_wins() {
        let idx = GradeIndex::from_records(&vec![grade("s", "c", 1.0), grade("s", "c", 9.0)]);
        assert_eq!(idx.get("s", "c"), Some(1.0));
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn cyclic_references_terminate() {
        let s = parse_structure(&json!({
            "id": "loop",
            "groups": [
                { "id": "a", "columns": [
                    { "id": "x", "type": "score" },
                    { "id": "self", "type": "internal_sum", "sourceColumns": ["self", "x"] },
                    { "id": "t", "type": "total", "sourceColumns": ["x"] },
                    { "id": "to_b", "type": "external_sum", "externalSourceColumns": ["b:to_a", "a:x"] }
                ]},
                { "id": "b", "columns": [
                    { "id": "to_a", "type": "external_sum", "externalSourceColumns": ["a:to_b"] }
                ]}
            ]
        }))
        .expect("structure");
        let g = GradeIndex::from_records(&vec![grade("s", "x", 2.0)]);
        assert_eq!(resolve("s", "self", "a", &s, &g), 2.0);
        assert_eq!(resolve("s", "to_b", "a", &s, &g), 2.0);
        assert_eq!(resolve("s", "to_a", "b", &s, &g), 2.0);
    }

    #[test]
    fn student_sheet_matches_single_cells_on_cyclic_structure() {
        let s = parse_structure(&json!({
            "id": "loop",
            "groups": [
                { "id": "a", "columns": [
                    { "id": "x", "type": "score" },
                    { "id": "to_b", "type": "external_sum", "externalSourceColumns": ["b:to_a", "a:x"] }
                ]},
                { "id": "b", "columns": [
                    { "id": "to_a", "type": "external_sum", "externalSourceColumns": ["a:to_b"] }
                ]}
            ]
        }))
        .expect("structure");
        let g = GradeIndex::from_records(&vec![grade("s", "x", 2.0)]);
        let student = SheetStudent {
            id: "s".to_string(),
            display_name: "S".to_string(),
        };
        let sheet = resolve_student(&student, &s, &g);
        assert_eq!(sheet.groups[0].columns[1].value, resolve("s", "to_b", "a", &s, &g));
        assert_eq!(sheet.groups[1].columns[0].value, resolve("s", "to_a", "b", &s, &g));
    }

    #[test]
    fn layered_shared_columns_resolve_in_bounded_time() {
        // Each layer reads the previous layer's total twice, so the value
        // doubles per layer while every column is only summed once.
        let layers = 40;
        let mut groups = vec![json!({ "id": "g0", "columns": [
            { "id": "q", "type": "score" },
            { "id": "t", "type": "total" }
        ]})];
        for i in 1..layers {
            let prev = format!("g{}:t", i - 1);
            groups.push(json!({ "id": format!("g{}", i), "columns": [
                { "id": "t", "type": "group_sum", "sourceGroupIds": [prev.clone(), prev] }
            ]}));
        }
        let s = parse_structure(&json!({ "id": "layers", "groups": groups })).expect("structure");
        assert!(crate::structure::validate(&s).iter().all(|i| !i.is_blocking()));
        let g = GradeIndex::from_records(&vec![grade("s", "q", 1.0)]);

        let started = std::time::Instant::now();
        let value = resolve("s", "t", &format!("g{}", layers - 1), &s, &g);
        assert_eq!(value, 2f64.powi(layers - 1));
        let student = SheetStudent {
            id: "s".to_string(),
            display_name: "S".to_string(),
        };
        let sheet = resolve_student(&student, &s, &g);
        assert_eq!(sheet.groups[layers as usize - 1].columns[0].value, value);
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
    }

    #[test]
    fn shared_dependency_is_counted_on_each_branch() {
        // A diamond is not a cycle: both branches read hw_total.
        let s = parse_structure(&json!({
            "id": "diamond",
            "groups": [
                { "id": "hw", "columns": [
                    { "id": "q", "type": "score" },
                    { "id": "t", "type": "total" }
                ]},
                { "id": "sum", "columns": [
                    { "id": "twice", "type": "group_sum", "sourceGroupIds": ["hw", "hw:t"] }
                ]}
            ]
        }))
        .expect("structure");
        let g = GradeIndex::from_records(&vec![grade("s", "q", 4.0)]);
        assert_eq!(resolve("s", "twice", "sum", &s, &g), 8.0);
    }

    #[test]
    fn class_sheet_averages_per_column() {
        let students = vec![
            SheetStudent {
                id: "s1".into(),
                display_name: "Ada".into(),
            },
            SheetStudent {
                id: "s2".into(),
                display_name: "Bo".into(),
            },
        ];
        let sheet = resolve_class(&students, &structure(), &grades());
        assert_eq!(sheet.students.len(), 2);
        let hw_total = sheet
            .column_averages
            .iter()
            .find(|c| c.column_id == "hw_total")
            .expect("hw_total avg");
        assert_eq!(hw_total.average, 6.0);
        let first = &sheet.students[0].groups[0].columns[3];
        assert_eq!(first.value, 7.0);
        assert_eq!(first.percent, Some(70.0));
    }

    #[test]
    fn percent_needs_positive_max() {
        assert_eq!(percent_of(3.0, 0.0), None);
        assert_eq!(percent_of(3.0, 6.0), Some(50.0));
    }
}
