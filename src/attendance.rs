//! Turns lesson rows with embedded visit records into flat attendance events.
//!
//! Nested records arrive either as structured JSON or, from older exports, as
//! a string holding a Python literal dump (`[{'userId': 1, 'visit': True}]`).
//! Both are normalized here so the classifier only ever sees
//! `AttendanceRecord`s.

use chrono::NaiveDate;
use serde_json::Value;
use tracing::warn;

use crate::error::MalformedAttendanceError;
use crate::models::{id_value, AttendanceRecord, EntityTable, Record};

#[derive(Debug, Default)]
pub struct Flattened {
    pub records: Vec<AttendanceRecord>,
    pub rejected: Vec<RejectedRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRow {
    pub index: usize,
    pub lesson_id: Option<i64>,
    pub error: MalformedAttendanceError,
}

/// Flattens every lesson row. A row whose nested data cannot be decoded is
/// skipped whole and reported in `rejected`; the remaining rows still count.
pub fn flatten_lessons(lessons: &EntityTable) -> Flattened {
    let mut flattened = Flattened::default();

    for (index, row) in lessons.rows.iter().enumerate() {
        match lesson_records(row) {
            Ok(records) => flattened.records.extend(records),
            Err(error) => {
                let lesson_id = row.get("id").and_then(id_value);
                warn!(index, ?lesson_id, %error, "skipping lesson row");
                flattened.rejected.push(RejectedRow {
                    index,
                    lesson_id,
                    error,
                });
            }
        }
    }

    flattened
}

fn lesson_records(row: &Record) -> Result<Vec<AttendanceRecord>, MalformedAttendanceError> {
    let nested = decode_nested(row.get("records"))?;
    if nested.is_empty() {
        return Ok(Vec::new());
    }

    let class_id = row
        .get("classId")
        .and_then(id_value)
        .ok_or_else(|| MalformedAttendanceError("lesson has no classId".to_string()))?;
    let date = row
        .get("date")
        .and_then(Value::as_str)
        .and_then(parse_date)
        .ok_or_else(|| MalformedAttendanceError("lesson has no valid date".to_string()))?;
    let row_lesson_id = row.get("id").and_then(id_value);

    nested
        .iter()
        .map(|record| {
            let user_id = record
                .get("userId")
                .and_then(id_value)
                .ok_or_else(|| MalformedAttendanceError("visit record has no userId".to_string()))?;
            Ok(AttendanceRecord {
                user_id,
                lesson_id: record.get("lessonId").and_then(id_value).or(row_lesson_id),
                class_id,
                date,
                attended: record.get("visit").map(is_visit).unwrap_or(false),
            })
        })
        .collect()
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    let day = text.get(..10).unwrap_or(text);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

/// Visit flags are `true` in current payloads and `"True"` in legacy dumps.
pub fn is_visit(value: &Value) -> bool {
    matches!(value, Value::Bool(true)) || value.as_str() == Some("True")
}

/// Decodes the `records` field of a lesson row into visit records.
/// Missing, null and empty-string values mean "no records".
pub fn decode_nested(value: Option<&Value>) -> Result<Vec<Record>, MalformedAttendanceError> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => objects(items.clone()),
        Some(Value::String(text)) if text.trim().is_empty() => Ok(Vec::new()),
        Some(Value::String(text)) => {
            let json = python_literal_to_json(text)?;
            match serde_json::from_str::<Value>(&json) {
                Ok(Value::Array(items)) => objects(items),
                Ok(other) => Err(MalformedAttendanceError(format!(
                    "expected a list of records, got {other}"
                ))),
                Err(err) => Err(MalformedAttendanceError(err.to_string())),
            }
        }
        Some(other) => Err(MalformedAttendanceError(format!(
            "unsupported records value: {other}"
        ))),
    }
}

fn objects(items: Vec<Value>) -> Result<Vec<Record>, MalformedAttendanceError> {
    items
        .into_iter()
        .map(|item| match item {
            Value::Object(record) => Ok(record),
            other => Err(MalformedAttendanceError(format!(
                "record is not an object: {other}"
            ))),
        })
        .collect()
}

/// Re-encodes a Python literal (dicts, lists, str, int, float, bool, None)
/// as JSON text. Quote aware, so names containing `True` or apostrophes
/// survive intact.
pub fn python_literal_to_json(input: &str) -> Result<String, MalformedAttendanceError> {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                out.push('"');
                let mut closed = false;
                while let Some(s) = chars.next() {
                    match s {
                        '\\' => match chars.next() {
                            Some('\'') => out.push('\''),
                            Some(escaped) => {
                                out.push('\\');
                                out.push(escaped);
                            }
                            None => break,
                        },
                        '"' if c == '\'' => out.push_str("\\\""),
                        s if s == c => {
                            closed = true;
                            break;
                        }
                        s => out.push(s),
                    }
                }
                if !closed {
                    return Err(MalformedAttendanceError(
                        "unterminated string literal".to_string(),
                    ));
                }
                out.push('"');
            }
            // exponent of a float such as 1e-05
            'e' | 'E' if out.ends_with(|p: char| p.is_ascii_digit() || p == '.') => out.push(c),
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut word = String::from(c);
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        word.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match word.as_str() {
                    "True" => out.push_str("true"),
                    "False" => out.push_str("false"),
                    "None" => out.push_str("null"),
                    other => {
                        return Err(MalformedAttendanceError(format!(
                            "unsupported literal '{other}'"
                        )))
                    }
                }
            }
            c => out.push(c),
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lesson(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn converts_python_dump() {
        let json = python_literal_to_json(
            "[{'userId': 5, 'visit': True, 'comment': None, 'free': False}]",
        )
        .unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(
            value,
            json!([{"userId": 5, "visit": true, "comment": null, "free": false}])
        );
    }

    #[test]
    fn keeps_quotes_and_keywords_inside_strings() {
        let json =
            python_literal_to_json(r#"[{'name': "O'Neil", 'note': 'said "True"'}]"#).unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value, json!([{"name": "O'Neil", "note": "said \"True\""}]));
    }

    #[test]
    fn keeps_float_exponents() {
        let json = python_literal_to_json("[{'price': 1e-05, 'paid': 2.5E3}]").unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value[0]["paid"], json!(2500.0));
    }

    #[test]
    fn rejects_unknown_literals() {
        assert!(python_literal_to_json("[{'d': datetime.date(2024, 1, 1)}]").is_err());
        assert!(python_literal_to_json("[{'a': 'open").is_err());
    }

    #[test]
    fn missing_or_empty_records_yield_nothing() {
        assert!(decode_nested(None).unwrap().is_empty());
        assert!(decode_nested(Some(&json!(null))).unwrap().is_empty());
        assert!(decode_nested(Some(&json!(""))).unwrap().is_empty());
        assert!(decode_nested(Some(&json!([]))).unwrap().is_empty());
    }

    #[test]
    fn visit_flag_accepts_both_encodings() {
        assert!(is_visit(&json!(true)));
        assert!(is_visit(&json!("True")));
        assert!(!is_visit(&json!(false)));
        assert!(!is_visit(&json!("False")));
        assert!(!is_visit(&json!(1)));
    }

    #[test]
    fn flattens_structured_and_legacy_rows_alike() {
        let table = EntityTable::new(
            "lessons",
            vec![
                lesson(json!({
                    "id": 100,
                    "classId": 7,
                    "date": "2024-01-08",
                    "records": [
                        {"userId": 1, "lessonId": 100, "visit": true},
                        {"userId": 2, "lessonId": 100, "visit": false}
                    ]
                })),
                lesson(json!({
                    "id": 101,
                    "classId": 7,
                    "date": "2024-01-15",
                    "records": "[{'userId': 1, 'lessonId': 101, 'visit': False}]"
                })),
                lesson(json!({"id": 102, "classId": 8, "date": "2024-01-15", "records": []})),
            ],
        );

        let flattened = flatten_lessons(&table);

        assert!(flattened.rejected.is_empty());
        assert_eq!(flattened.records.len(), 3);
        assert_eq!(
            flattened.records[2],
            AttendanceRecord {
                user_id: 1,
                lesson_id: Some(101),
                class_id: 7,
                date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
                attended: false,
            }
        );
        assert!(flattened.records[0].attended);
    }

    #[test]
    fn bad_row_is_skipped_and_reported() {
        let table = EntityTable::new(
            "lessons",
            vec![
                lesson(json!({"id": 1, "classId": 7, "date": "2024-01-01",
                    "records": [{"userId": 1, "visit": true}]})),
                lesson(json!({"id": 2, "classId": 7, "date": "2024-01-08",
                    "records": "[{'userId': 1, 'visit': Tru"})),
                lesson(json!({"id": 3, "classId": 7, "date": "not a date",
                    "records": [{"userId": 1, "visit": true}]})),
                lesson(json!({"id": 4, "classId": 7, "date": "2024-01-22",
                    "records": [{"userId": 2, "visit": "True"}]})),
            ],
        );

        let flattened = flatten_lessons(&table);

        assert_eq!(flattened.records.len(), 2);
        assert_eq!(flattened.rejected.len(), 2);
        assert_eq!(flattened.rejected[0].index, 1);
        assert_eq!(flattened.rejected[1].lesson_id, Some(3));
        assert!(flattened.records[1].attended);
    }
}
