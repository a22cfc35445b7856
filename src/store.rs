//! On-disk archive: bucket file layout, the completeness check the sweep
//! consults before fetching, and the all-or-nothing writers.

use std::{
    collections::{BTreeMap, btree_map::Entry},
    fs,
    path::{Path, PathBuf},
};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use itertools::Itertools;

use crate::{
    error::DownloadError,
    prelude::*,
    schema::{EnergyRow, PowerRow, SchemaVersion, TIMESTAMP_FORMAT},
};

pub struct Store {
    root: PathBuf,
    schema: SchemaVersion,
}

impl Store {
    #[must_use]
    pub const fn new(root: PathBuf, schema: SchemaVersion) -> Self {
        Self { root, schema }
    }

    #[must_use]
    pub const fn schema(&self) -> SchemaVersion {
        self.schema
    }

    fn site_dir(&self, site_id: u64) -> PathBuf {
        self.root.join(site_id.to_string())
    }

    #[must_use]
    pub fn power_path(&self, site_id: u64, date: NaiveDate) -> PathBuf {
        let file_name = format!("{date}.csv");
        if self.schema.power_in_subdir() {
            self.site_dir(site_id).join("power").join(file_name)
        } else {
            self.site_dir(site_id).join(file_name)
        }
    }

    #[must_use]
    pub fn energy_month_path(&self, site_id: u64, month: NaiveDate) -> PathBuf {
        self.site_dir(site_id).join("energy").join(format!("{}.csv", month.format("%Y-%m")))
    }

    #[must_use]
    pub fn cumulative_energy_path(&self, site_id: u64) -> PathBuf {
        self.site_dir(site_id).join("energy.csv")
    }

    /// A day bucket is complete when its file closes with the final 5-minute
    /// slot of that very date. Anything else — missing, empty, or cut short
    /// by a crashed run — gets re-fetched and overwritten.
    #[must_use]
    pub fn is_power_day_complete(&self, site_id: u64, date: NaiveDate) -> bool {
        let last_slot = NaiveTime::from_hms_opt(23, 55, 0).unwrap_or(NaiveTime::MIN);
        last_timestamp(&self.power_path(site_id, date))
            .is_some_and(|last| last.date() == date && last.time() == last_slot)
    }

    /// A month bucket of daily totals is complete when its file closes on
    /// the month's last day.
    #[must_use]
    pub fn is_energy_month_complete(&self, site_id: u64, month: NaiveDate, last_day: NaiveDate) -> bool {
        last_timestamp(&self.energy_month_path(site_id, month))
            .is_some_and(|last| last.date() == last_day)
    }

    pub fn write_power_day(
        &self,
        site_id: u64,
        date: NaiveDate,
        rows: Vec<PowerRow>,
    ) -> Result<(), DownloadError> {
        let path = self.power_path(site_id, date);
        let fields = rows
            .into_iter()
            .sorted_by_key(|row| row.timestamp)
            .map(|row| self.schema.power_fields(&row));
        write_atomically(&path, self.schema.power_header(), fields)
    }

    pub fn write_energy_month(
        &self,
        site_id: u64,
        month: NaiveDate,
        rows: Vec<EnergyRow>,
    ) -> Result<(), DownloadError> {
        let path = self.energy_month_path(site_id, month);
        let fields = rows
            .into_iter()
            .sorted_by_key(|row| row.timestamp)
            .map(|row| self.schema.energy_fields(&row));
        write_atomically(&path, self.schema.energy_header(), fields)
    }

    /// Merges freshly fetched rows into the cumulative energy file, keyed by
    /// timestamp. Rows already present stay untouched; returns how many were
    /// actually added. Rendered timestamps sort lexicographically in
    /// chronological order, so a string-keyed map keeps the file ordered.
    pub fn merge_energy_rows(
        &self,
        site_id: u64,
        rows: &[EnergyRow],
    ) -> Result<usize, DownloadError> {
        let path = self.cumulative_energy_path(site_id);
        let mut merged: BTreeMap<String, Vec<String>> = BTreeMap::new();
        if path.is_file() {
            let mut reader = csv::Reader::from_path(&path)?;
            for record in reader.records() {
                let record = record?;
                let Some(timestamp) = record.get(0) else { continue };
                merged.insert(timestamp.to_string(), record.iter().map(str::to_string).collect());
            }
        }

        let mut added = 0;
        for row in rows {
            let fields = self.schema.energy_fields(row);
            let Some(timestamp) = fields.first() else { continue };
            if let Entry::Vacant(entry) = merged.entry(timestamp.clone()) {
                entry.insert(fields);
                added += 1;
            }
        }

        write_atomically(&path, self.schema.energy_header(), merged.into_values())?;
        Ok(added)
    }

    /// Drops `*.partial.csv` leftovers that pre-v2 runs used to mark the
    /// still-accumulating current day.
    pub fn remove_partial_files(&self, site_id: u64) -> Result<(), DownloadError> {
        for dir in [self.site_dir(site_id), self.site_dir(site_id).join("power")] {
            let Ok(entries) = fs::read_dir(&dir) else { continue };
            for entry in entries {
                let entry = entry?;
                if entry.file_name().to_string_lossy().ends_with(".partial.csv") {
                    debug!(path = %entry.path().display(), "removing stale partial file");
                    fs::remove_file(entry.path())?;
                }
            }
        }
        Ok(())
    }
}

/// Serializes the full row set to a sibling temporary file and renames it
/// into place, so a crash mid-write can never leave a file that passes the
/// completeness check.
fn write_atomically<I>(path: &Path, header: &[&str], rows: I) -> Result<(), DownloadError>
where
    I: IntoIterator<Item = Vec<String>>,
{
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension("csv.tmp");
    {
        let mut writer = csv::Writer::from_path(&temp_path)?;
        writer.write_record(header)?;
        for row in rows {
            writer.write_record(&row)?;
        }
        writer.flush()?;
    }
    fs::rename(&temp_path, path)?;
    Ok(())
}

fn last_timestamp(path: &Path) -> Option<NaiveDateTime> {
    let contents = fs::read_to_string(path).ok()?;
    let line = contents.lines().rev().find(|line| !line.trim().is_empty())?;
    let field = line.split(',').next()?;
    NaiveDateTime::parse_from_str(field, TIMESTAMP_FORMAT).ok()
}
