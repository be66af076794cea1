use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{Duration, NaiveDate, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::attendance::flatten_lessons;
use crate::models::{id_value, ClassificationResult, EntityTable, UserProfile, UserVisitHistory};

/// `userId -> classIds` the user is actively enrolled in.
pub type Enrollments = HashMap<i64, HashSet<i64>>;

/// Client state id the CRM uses for "currently studying".
pub const STUDYING_STATUS_ID: i64 = 98582;

pub fn cutoff_date(window_days: i64) -> NaiveDate {
    cutoff_from(Utc::now().date_naive(), window_days)
}

fn cutoff_from(today: NaiveDate, window_days: i64) -> NaiveDate {
    today - Duration::days(window_days.max(1))
}

/// Builds the eligibility table from loaded `users` rows.
pub fn profiles_from_users(users: &EntityTable) -> HashMap<i64, UserProfile> {
    users
        .rows
        .iter()
        .filter_map(|row| {
            let id = row.get("id").and_then(id_value)?;
            let display_name = row
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let status_id = row.get("clientStateId").filter(|v| !v.is_null()).cloned();
            Some((
                id,
                UserProfile {
                    display_name,
                    status_id,
                },
            ))
        })
        .collect()
}

/// Groups join rows whose `status_field` equals `status` into per-user class sets.
pub fn enrollments_from_joins(joins: &EntityTable, status_field: &str, status: &Value) -> Enrollments {
    let mut enrollments = Enrollments::new();

    for row in &joins.rows {
        if !row.get(status_field).is_some_and(|value| same_value(value, status)) {
            continue;
        }
        let (Some(user_id), Some(class_id)) = (
            row.get("userId").and_then(id_value),
            row.get("classId").and_then(id_value),
        ) else {
            continue;
        };
        enrollments.entry(user_id).or_default().insert(class_id);
    }

    enrollments
}

fn same_value(left: &Value, right: &Value) -> bool {
    match (id_value(left), id_value(right)) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

/// Eligibility predicate matching a client state id.
pub fn status_is(expected: i64) -> impl Fn(&UserProfile) -> bool {
    move |profile| profile.status_id.as_ref().and_then(id_value) == Some(expected)
}

pub fn classify<P>(
    lessons: &EntityTable,
    profiles: &HashMap<i64, UserProfile>,
    enrollments: Option<&Enrollments>,
    window_days: i64,
    is_eligible: P,
) -> Vec<ClassificationResult>
where
    P: Fn(&UserProfile) -> bool,
{
    classify_as_of(
        lessons,
        profiles,
        enrollments,
        window_days,
        Utc::now().date_naive(),
        is_eligible,
    )
}

/// Classifies every eligible user with attendance inside
/// `[today - window_days, today]`. A user is struggling when, in every class
/// group, neither of the two most recent visits was attended.
pub fn classify_as_of<P>(
    lessons: &EntityTable,
    profiles: &HashMap<i64, UserProfile>,
    enrollments: Option<&Enrollments>,
    window_days: i64,
    today: NaiveDate,
    is_eligible: P,
) -> Vec<ClassificationResult>
where
    P: Fn(&UserProfile) -> bool,
{
    let cutoff = cutoff_from(today, window_days);
    let flattened = flatten_lessons(lessons);
    if !flattened.rejected.is_empty() {
        warn!(
            skipped = flattened.rejected.len(),
            "lesson rows with malformed attendance were skipped"
        );
    }

    let mut histories: BTreeMap<(i64, i64), UserVisitHistory> = BTreeMap::new();
    for record in flattened.records {
        if record.date < cutoff || record.date > today {
            continue;
        }
        if let Some(enrollments) = enrollments {
            let enrolled = enrollments
                .get(&record.user_id)
                .is_some_and(|classes| classes.contains(&record.class_id));
            if !enrolled {
                continue;
            }
        }
        histories
            .entry((record.user_id, record.class_id))
            .or_insert_with(|| UserVisitHistory::new(record.user_id, record.class_id))
            .visits
            .push((record.date, record.attended));
    }

    let mut by_user: BTreeMap<i64, Vec<UserVisitHistory>> = BTreeMap::new();
    for (_, mut history) in histories {
        history.sort();
        by_user.entry(history.user_id).or_default().push(history);
    }

    let mut results = Vec::new();
    for (user_id, groups) in by_user {
        let Some(profile) = profiles.get(&user_id) else {
            debug!(user_id, "attendance for unknown user ignored");
            continue;
        };
        if !is_eligible(profile) {
            continue;
        }

        results.push(ClassificationResult {
            user_id,
            display_name: profile.display_name.clone(),
            is_struggling: !groups.iter().any(UserVisitHistory::is_good),
            evaluated_groups: groups.iter().map(|group| group.class_id).collect(),
        });
    }

    results
}

pub fn struggling(results: &[ClassificationResult]) -> impl Iterator<Item = &ClassificationResult> {
    results.iter().filter(|result| result.is_struggling)
}
