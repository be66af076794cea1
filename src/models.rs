use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One decoded JSON object as returned by the remote API.
pub type Record = serde_json::Map<String, Value>;

/// A fully materialized entity collection, rows kept in fetch order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityTable {
    pub name: String,
    pub fetched_at: DateTime<Utc>,
    pub rows: Vec<Record>,
}

impl EntityTable {
    pub fn new(name: impl Into<String>, rows: Vec<Record>) -> Self {
        Self {
            name: name.into(),
            fetched_at: Utc::now(),
            rows,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Union of the keys seen across all rows, in first-seen order.
    pub fn columns(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut columns = Vec::new();
        for row in &self.rows {
            for key in row.keys() {
                if seen.insert(key.as_str()) {
                    columns.push(key.clone());
                }
            }
        }
        columns
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceRecord {
    pub user_id: i64,
    pub lesson_id: Option<i64>,
    pub class_id: i64,
    pub date: NaiveDate,
    pub attended: bool,
}

/// Visits of one user inside one class group.
#[derive(Debug, Clone, PartialEq)]
pub struct UserVisitHistory {
    pub user_id: i64,
    pub class_id: i64,
    pub visits: Vec<(NaiveDate, bool)>,
}

impl UserVisitHistory {
    pub fn new(user_id: i64, class_id: i64) -> Self {
        Self {
            user_id,
            class_id,
            visits: Vec::new(),
        }
    }

    pub fn sort(&mut self) {
        self.visits.sort_by_key(|(date, _)| *date);
    }

    /// Good when either of the two most recent visits was attended.
    /// Expects `visits` sorted ascending by date.
    pub fn is_good(&self) -> bool {
        self.visits
            .iter()
            .rev()
            .take(2)
            .any(|(_, attended)| *attended)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserProfile {
    pub display_name: String,
    pub status_id: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationResult {
    pub user_id: i64,
    pub display_name: String,
    pub is_struggling: bool,
    pub evaluated_groups: BTreeSet<i64>,
}

/// Reads an integer id that may arrive as a JSON number or a numeric string.
pub fn id_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}
