//! CSV export of collection snapshots.
//!
//! The target file is written to a temp file beside it, fsynced, then renamed
//! into place, so a reader never sees a partial export.

use crate::{CarbsEntry, Error, Result, TempTarget};
use serde::Serialize;
use std::path::Path;
use tempfile::NamedTempFile;

/// A row in the temp target export
#[derive(Debug, Serialize)]
struct TempTargetRow {
    id: String,
    created_at: String,
    name: String,
    target_bottom: Option<f64>,
    target_top: Option<f64>,
    duration_minutes: f64,
    entered_by: Option<String>,
}

impl From<&TempTarget> for TempTargetRow {
    fn from(target: &TempTarget) -> Self {
        TempTargetRow {
            id: target.id.clone(),
            created_at: target.created_at.to_rfc3339(),
            name: target.display_name().to_string(),
            target_bottom: target.target_bottom,
            target_top: target.target_top,
            duration_minutes: target.duration,
            entered_by: target.entered_by.clone(),
        }
    }
}

/// A row in the carbs export
#[derive(Debug, Serialize)]
struct CarbsRow {
    id: String,
    created_at: String,
    carbs_grams: f64,
    entered_by: Option<String>,
}

impl From<&CarbsEntry> for CarbsRow {
    fn from(entry: &CarbsEntry) -> Self {
        CarbsRow {
            id: entry.id.clone(),
            created_at: entry.created_at.to_rfc3339(),
            carbs_grams: entry.carbs,
            entered_by: entry.entered_by.clone(),
        }
    }
}

/// Export temp targets in the order given; returns the number of rows
pub fn export_temp_targets(targets: &[TempTarget], path: &Path) -> Result<usize> {
    write_rows(targets.iter().map(TempTargetRow::from), path)
}

/// Export carb entries in the order given; returns the number of rows
pub fn export_carbs(entries: &[CarbsEntry], path: &Path) -> Result<usize> {
    write_rows(entries.iter().map(CarbsRow::from), path)
}

fn write_rows<R, I>(rows: I, path: &Path) -> Result<usize>
where
    R: Serialize,
    I: IntoIterator<Item = R>,
{
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let temp = NamedTempFile::new_in(parent)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(true)
        .from_writer(temp);

    let mut count = 0;
    for row in rows {
        writer.serialize(row)?;
        count += 1;
    }

    writer.flush()?;
    let temp = writer
        .into_inner()
        .map_err(|e| Error::Other(format!("Failed to finish CSV export: {}", e)))?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| Error::Io(e.error))?;

    tracing::info!("Exported {} rows to {:?}", count, path);
    Ok(count)
}
