use std::fmt::Write;
use std::path::Path;

use chrono::NaiveDate;
use serde_json::Value;

use crate::models::{ClassificationResult, EntityTable};
use crate::risk;

fn group_list(result: &ClassificationResult) -> String {
    result
        .evaluated_groups
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn build_report(
    results: &[ClassificationResult],
    window_days: i64,
    cutoff: NaiveDate,
) -> String {
    let struggling: Vec<&ClassificationResult> = risk::struggling(results).collect();
    let on_track = results.len() - struggling.len();

    let mut output = String::new();

    let _ = writeln!(output, "# Attendance Watch Report");
    let _ = writeln!(
        output,
        "Generated for the last {} days (lessons since {})",
        window_days, cutoff
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Summary");
    let _ = writeln!(output, "- {} students evaluated", results.len());
    let _ = writeln!(output, "- {} struggling", struggling.len());
    let _ = writeln!(output, "- {} on track", on_track);

    let _ = writeln!(output);
    let _ = writeln!(output, "## Struggling Students");

    if struggling.is_empty() {
        let _ = writeln!(output, "No struggling students in this window.");
    } else {
        for result in struggling {
            let _ = writeln!(
                output,
                "- {}: {} (groups {})",
                result.user_id,
                result.display_name,
                group_list(result)
            );
        }
    }

    output
}

/// Writes a table as CSV with the inferred column set as header. Nested
/// values are written as JSON text.
pub fn write_table_csv(table: &EntityTable, path: &Path) -> anyhow::Result<usize> {
    let columns = table.columns();
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(&columns)?;

    for row in &table.rows {
        let cells: Vec<String> = columns
            .iter()
            .map(|column| row.get(column).map(cell).unwrap_or_default())
            .collect();
        writer.write_record(&cells)?;
    }

    writer.flush()?;
    Ok(table.len())
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

pub fn write_results_csv(results: &[ClassificationResult], path: &Path) -> anyhow::Result<()> {
    #[derive(serde::Serialize)]
    struct CsvRow<'a> {
        user_id: i64,
        display_name: &'a str,
        is_struggling: bool,
        evaluated_groups: String,
    }

    let mut writer = csv::Writer::from_path(path)?;
    for result in results {
        writer.serialize(CsvRow {
            user_id: result.user_id,
            display_name: &result.display_name,
            is_struggling: result.is_struggling,
            evaluated_groups: group_list(result).replace(", ", " "),
        })?;
    }
    writer.flush()?;
    Ok(())
}
