use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BehaviorNote {
    pub id: String,
    pub student_id: String,
    pub points: i64,
    pub note: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BehaviorTotal {
    pub student_id: String,
    pub points: i64,
    pub positive_count: usize,
    pub negative_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub student_id: String,
    pub display_name: String,
    pub points: i64,
    pub positive_count: usize,
    pub negative_count: usize,
}

/// Per-student sums, in order of first appearance.
pub fn student_totals(notes: &[BehaviorNote]) -> Vec<BehaviorTotal> {
    let mut order: Vec<String> = Vec::new();
    let mut by_student: HashMap<&str, BehaviorTotal> = HashMap::new();
    for n in notes {
        let entry = by_student.entry(n.student_id.as_str()).or_insert_with(|| {
            order.push(n.student_id.clone());
            BehaviorTotal {
                student_id: n.student_id.clone(),
                ..Default::default()
            }
        });
        entry.points = entry.points.saturating_add(n.points);
        match n.points.cmp(&0) {
            Ordering::Greater => entry.positive_count += 1,
            Ordering::Less => entry.negative_count += 1,
            Ordering::Equal => {}
        }
    }
    order
        .iter()
        .filter_map(|sid| by_student.remove(sid.as_str()))
        .collect()
}

/// Points descending, then name. Ties share a rank and the next rank skips
/// (1, 1, 3). Students without notes appear with 0 points.
pub fn leaderboard(
    students: &[(String, String)],
    notes: &[BehaviorNote],
    limit: Option<usize>,
) -> Vec<LeaderboardEntry> {
    let totals: HashMap<String, BehaviorTotal> = student_totals(notes)
        .into_iter()
        .map(|t| (t.student_id.clone(), t))
        .collect();

    let mut rows: Vec<LeaderboardEntry> = students
        .iter()
        .map(|(id, name)| {
            let t = totals.get(id);
            LeaderboardEntry {
                rank: 0,
                student_id: id.clone(),
                display_name: name.clone(),
                points: t.map(|t| t.points).unwrap_or(0),
                positive_count: t.map(|t| t.positive_count).unwrap_or(0),
                negative_count: t.map(|t| t.negative_count).unwrap_or(0),
            }
        })
        .collect();

    rows.sort_by(|a, b| {
        b.points
            .cmp(&a.points)
            .then_with(|| a.display_name.to_lowercase().cmp(&b.display_name.to_lowercase()))
            .then_with(|| a.student_id.cmp(&b.student_id))
    });

    let mut prev_points: Option<i64> = None;
    let mut rank = 0;
    for (i, row) in rows.iter_mut().enumerate() {
        if prev_points != Some(row.points) {
            rank = i + 1;
            prev_points = Some(row.points);
        }
        row.rank = rank;
    }

    if let Some(limit) = limit {
        rows.truncate(limit);
    }
    rows
}
