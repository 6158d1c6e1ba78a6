use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Score,
    InternalSum,
    Total,
    GroupSum,
    GrandTotal,
    ExternalSum,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub max_score: f64,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_group_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_source_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default)]
    pub columns: Vec<Column>,
}

impl Group {
    pub fn column_index(&self, column_id: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.id == column_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingStructure {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub groups: Vec<Group>,
}

/// Position of a column inside a structure: `groups[group_idx].columns[column_idx]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColumnKey {
    pub group_idx: usize,
    pub column_idx: usize,
}

impl GradingStructure {
    pub fn group_index(&self, group_id: &str) -> Option<usize> {
        self.groups.iter().position(|g| g.id == group_id)
    }

    pub fn locate(&self, group_id: &str, column_id: &str) -> Option<ColumnKey> {
        let group_idx = self.group_index(group_id)?;
        let column_idx = self.groups[group_idx].column_index(column_id)?;
        Some(ColumnKey {
            group_idx,
            column_idx,
        })
    }

    pub fn column_at(&self, key: ColumnKey) -> Option<&Column> {
        self.groups
            .get(key.group_idx)
            .and_then(|g| g.columns.get(key.column_idx))
    }

    /// `group:column` label used in diagnostics and logs.
    pub fn label(&self, key: ColumnKey) -> String {
        match (self.groups.get(key.group_idx), self.column_at(key)) {
            (Some(g), Some(c)) => format!("{}:{}", g.id, c.id),
            _ => format!("#{}:#{}", key.group_idx, key.column_idx),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = ColumnKey> + '_ {
        self.groups.iter().enumerate().flat_map(|(group_idx, g)| {
            (0..g.columns.len()).map(move |column_idx| ColumnKey {
                group_idx,
                column_idx,
            })
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRef<'a> {
    Group(&'a str),
    Column { group_id: &'a str, column_id: &'a str },
}

/// Splits at the first `:`. Returns `None` when either half is empty.
pub fn parse_source_ref(raw: &str) -> Option<SourceRef<'_>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.split_once(':') {
        None => Some(SourceRef::Group(raw)),
        Some((g, c)) => {
            let (g, c) = (g.trim(), c.trim());
            if g.is_empty() || c.is_empty() {
                None
            } else {
                Some(SourceRef::Column {
                    group_id: g,
                    column_id: c,
                })
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dependencies {
    pub resolved: Vec<ColumnKey>,
    pub dangling: Vec<String>,
}

/// Columns that feed `key`. Both the resolver and `validate` go through this,
/// so the two can never disagree about what a sum column reads.
pub fn dependencies(structure: &GradingStructure, key: ColumnKey) -> Dependencies {
    let mut deps = Dependencies::default();
    let (Some(group), Some(column)) = (structure.groups.get(key.group_idx), structure.column_at(key))
    else {
        return deps;
    };

    let same_group = |deps: &mut Dependencies, id: &str| match group.column_index(id) {
        Some(column_idx) => deps.resolved.push(ColumnKey {
            group_idx: key.group_idx,
            column_idx,
        }),
        None => deps.dangling.push(id.to_string()),
    };

    match column.column_type {
        ColumnType::Score => {}
        ColumnType::InternalSum => {
            for id in &column.source_columns {
                same_group(&mut deps, id);
            }
        }
        ColumnType::Total => {
            if column.source_columns.is_empty() {
                for (column_idx, c) in group.columns.iter().enumerate() {
                    if c.column_type == ColumnType::Score {
                        deps.resolved.push(ColumnKey {
                            group_idx: key.group_idx,
                            column_idx,
                        });
                    }
                }
            } else {
                for id in &column.source_columns {
                    same_group(&mut deps, id);
                }
            }
        }
        ColumnType::GroupSum | ColumnType::GrandTotal => {
            for raw in &column.source_group_ids {
                let found = match parse_source_ref(raw) {
                    Some(SourceRef::Group(group_id)) => group_total_key(structure, group_id),
                    Some(SourceRef::Column {
                        group_id,
                        column_id,
                    }) => structure.locate(group_id, column_id),
                    None => None,
                };
                match found {
                    Some(k) => deps.resolved.push(k),
                    None => deps.dangling.push(raw.clone()),
                }
            }
        }
        ColumnType::ExternalSum => {
            for raw in &column.external_source_columns {
                let found = match parse_source_ref(raw) {
                    Some(SourceRef::Column {
                        group_id,
                        column_id,
                    }) => structure.locate(group_id, column_id),
                    _ => None,
                };
                match found {
                    Some(k) => deps.resolved.push(k),
                    None => deps.dangling.push(raw.clone()),
                }
            }
        }
    }

    deps
}

/// First `total` column of the group, which is what a bare group reference means.
pub fn group_total_key(structure: &GradingStructure, group_id: &str) -> Option<ColumnKey> {
    let group_idx = structure.group_index(group_id)?;
    let column_idx = structure.groups[group_idx]
        .columns
        .iter()
        .position(|c| c.column_type == ColumnType::Total)?;
    Some(ColumnKey {
        group_idx,
        column_idx,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum StructureIssue {
    DuplicateGroupId { group_id: String },
    DuplicateColumnId { group_id: String, column_id: String },
    NegativeMaxScore { column: String, max_score: f64 },
    SourcesOnScoreColumn { column: String },
    DanglingSource { column: String, reference: String },
    Cycle { path: Vec<String> },
}

impl StructureIssue {
    /// Blocking issues make a structure unsaveable; the rest are warnings.
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            StructureIssue::DuplicateGroupId { .. }
                | StructureIssue::DuplicateColumnId { .. }
                | StructureIssue::Cycle { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum StructureError {
    #[error("invalid grading structure json: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("grading structure id must not be empty")]
    MissingId,

    #[error("grading structure has {} blocking issue(s)", .0.len())]
    Invalid(Vec<StructureIssue>),
}

pub fn parse_structure(raw: &serde_json::Value) -> Result<GradingStructure, StructureError> {
    let structure: GradingStructure = serde_json::from_value(raw.clone())?;
    if structure.id.trim().is_empty() {
        return Err(StructureError::MissingId);
    }
    Ok(structure)
}

/// Parses and rejects structures with blocking issues. Returns the warnings.
pub fn parse_and_check(
    raw: &serde_json::Value,
) -> Result<(GradingStructure, Vec<StructureIssue>), StructureError> {
    let structure = parse_structure(raw)?;
    let issues = validate(&structure);
    let blocking: Vec<StructureIssue> = issues.iter().filter(|i| i.is_blocking()).cloned().collect();
    if !blocking.is_empty() {
        return Err(StructureError::Invalid(blocking));
    }
    Ok((structure, issues))
}

pub fn validate(structure: &GradingStructure) -> Vec<StructureIssue> {
    let mut issues = Vec::new();

    let mut seen_groups: HashSet<&str> = HashSet::new();
    for g in &structure.groups {
        if !seen_groups.insert(g.id.as_str()) {
            issues.push(StructureIssue::DuplicateGroupId {
                group_id: g.id.clone(),
            });
        }
        let mut seen_cols: HashSet<&str> = HashSet::new();
        for c in &g.columns {
            if !seen_cols.insert(c.id.as_str()) {
                issues.push(StructureIssue::DuplicateColumnId {
                    group_id: g.id.clone(),
                    column_id: c.id.clone(),
                });
            }
        }
    }

    for key in structure.keys() {
        let Some(column) = structure.column_at(key) else {
            continue;
        };
        let label = structure.label(key);
        if column.max_score < 0.0 {
            issues.push(StructureIssue::NegativeMaxScore {
                column: label.clone(),
                max_score: column.max_score,
            });
        }
        if column.column_type == ColumnType::Score
            && (!column.source_columns.is_empty()
                || !column.source_group_ids.is_empty()
                || !column.external_source_columns.is_empty())
        {
            issues.push(StructureIssue::SourcesOnScoreColumn {
                column: label.clone(),
            });
        }
        for reference in dependencies(structure, key).dangling {
            issues.push(StructureIssue::DanglingSource {
                column: label.clone(),
                reference,
            });
        }
    }

    for path in find_cycles(structure) {
        issues.push(StructureIssue::Cycle {
            path: path.into_iter().map(|k| structure.label(k)).collect(),
        });
    }

    issues
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Every back edge found by a DFS over the dependency graph, reported as the
/// stack slice from the re-entered column back to itself.
fn find_cycles(structure: &GradingStructure) -> Vec<Vec<ColumnKey>> {
    let keys: Vec<ColumnKey> = structure.keys().collect();
    let index_of = |k: ColumnKey| keys.iter().position(|x| *x == k);
    let mut marks = vec![Mark::Unvisited; keys.len()];
    let mut cycles = Vec::new();

    for start in 0..keys.len() {
        if marks[start] != Mark::Unvisited {
            continue;
        }
        // Iterative DFS: (node, next dependency to look at).
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
        let mut deps_cache: Vec<Option<Vec<ColumnKey>>> = vec![None; keys.len()];
        marks[start] = Mark::OnStack;

        while let Some(&(node, next)) = stack.last() {
            let deps = deps_cache[node]
                .get_or_insert_with(|| dependencies(structure, keys[node]).resolved)
                .clone();
            if next >= deps.len() {
                marks[node] = Mark::Done;
                stack.pop();
                continue;
            }
            if let Some(top) = stack.last_mut() {
                top.1 += 1;
            }
            let Some(child) = index_of(deps[next]) else {
                continue;
            };
            match marks[child] {
                Mark::Unvisited => {
                    marks[child] = Mark::OnStack;
                    stack.push((child, 0));
                }
                Mark::OnStack => {
                    let from = stack.iter().position(|(n, _)| *n == child).unwrap_or(0);
                    let mut path: Vec<ColumnKey> =
                        stack[from..].iter().map(|(n, _)| keys[*n]).collect();
                    path.push(keys[child]);
                    cycles.push(path);
                }
                Mark::Done => {}
            }
        }
    }

    cycles
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> GradingStructure {
        parse_structure(&json!({
            "id": "math",
            "name": "Math",
            "groups": [
                {
                    "id": "hw",
                    "name": "Homework",
                    "color": "#ffcc00",
                    "columns": [
                        { "id": "hw1", "name": "HW 1", "maxScore": 5, "type": "score" },
                        { "id": "hw2", "name": "HW 2", "maxScore": 5, "type": "score" },
                        { "id": "hwt", "name": "Total", "maxScore": 10, "type": "total" }
                    ]
                },
                {
                    "id": "final",
                    "columns": [
                        { "id": "gt", "type": "grand_total", "sourceGroupIds": ["hw", "hw:hw1", "nope"] }
                    ]
                }
            ]
        }))
        .expect("parse structure")
    }

    #[test]
    fn source_refs_split_at_first_colon() {
        assert_eq!(parse_source_ref("hw"), Some(SourceRef::Group("hw")));
        assert_eq!(
            parse_source_ref("hw:q:1"),
            Some(SourceRef::Column {
                group_id: "hw",
                column_id: "q:1"
            })
        );
        assert_eq!(parse_source_ref(":x"), None);
        assert_eq!(parse_source_ref("  "), None);
    }

    #[test]
    fn total_without_sources_depends_on_score_columns() {
        let s = sample();
        let key = s.locate("hw", "hwt").expect("hwt");
        let deps = dependencies(&s, key);
        assert_eq!(deps.resolved.len(), 2);
        assert!(deps.dangling.is_empty());
    }

    #[test]
    fn grand_total_mixes_bare_and_composite_refs() {
        let s = sample();
        let key = s.locate("final", "gt").expect("gt");
        let deps = dependencies(&s, key);
        assert_eq!(
            deps.resolved,
            vec![
                s.locate("hw", "hwt").expect("hwt"),
                s.locate("hw", "hw1").expect("hw1")
            ]
        );
        assert_eq!(deps.dangling, vec!["nope".to_string()]);
    }

    #[test]
    fn validate_reports_dangling_as_warning() {
        let issues = validate(&sample());
        assert_eq!(issues.len(), 1);
        assert!(!issues[0].is_blocking());
    }

    #[test]
    fn validate_finds_self_reference_and_two_column_cycle() {
        let s = parse_structure(&json!({
            "id": "loop",
            "groups": [{
                "id": "g",
                "columns": [
                    { "id": "a", "type": "internal_sum", "sourceColumns": ["a"] },
                    { "id": "b", "type": "internal_sum", "sourceColumns": ["c"] },
                    { "id": "c", "type": "internal_sum", "sourceColumns": ["b"] }
                ]
            }]
        }))
        .expect("parse");
        let cycles: Vec<Vec<String>> = validate(&s)
            .into_iter()
            .filter_map(|i| match i {
                StructureIssue::Cycle { path } => Some(path),
                _ => None,
            })
            .collect();
        assert_eq!(
            cycles,
            vec![
                vec!["g:a".to_string(), "g:a".to_string()],
                vec!["g:b".to_string(), "g:c".to_string(), "g:b".to_string()],
            ]
        );
    }

    #[test]
    fn parse_and_check_rejects_duplicate_columns() {
        let raw = json!({
            "id": "dup",
            "groups": [{ "id": "g", "columns": [
                { "id": "x", "type": "score" },
                { "id": "x", "type": "score" }
            ]}]
        });
        match parse_and_check(&raw) {
            Err(StructureError::Invalid(issues)) => assert_eq!(issues.len(), 1),
            other => panic!("expected Invalid, got {:?}", other.map(|(s, _)| s.id)),
        }
    }

    #[test]
    fn unknown_column_type_is_a_parse_error() {
        let raw = json!({ "id": "x", "groups": [{ "id": "g", "columns": [
            { "id": "c", "type": "average" }
        ]}]});
        assert!(matches!(parse_structure(&raw), Err(StructureError::Parse(_))));
    }
}
