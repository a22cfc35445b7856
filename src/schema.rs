//! Canonical row schema and the on-disk layout versions it went through.
//!
//! The version is a site-wide configuration constant. It is never inferred
//! from file contents: mixing layouts under one download root is not
//! supported.

use chrono::NaiveDateTime;
use clap::ValueEnum;

use crate::tesla::models::{EnergyRecord, PowerRecord};

/// Wall-clock format used in every CSV column 0. Lexicographic order of the
/// rendered strings matches chronological order, which the merge code relies
/// on.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const POWER_HEADER_V1: &[&str] = &[
    "timestamp",
    "solar_power",
    "battery_power",
    "grid_power",
    "generator_power",
    "load_power",
];

const POWER_HEADER: &[&str] = &[
    "timestamp",
    "solar_power",
    "battery_power",
    "grid_power",
    "grid_services_power",
    "generator_power",
    "load_power",
];

const ENERGY_HEADER_V1: &[&str] = &[
    "timestamp",
    "solar_energy_exported",
    "grid_energy_imported",
    "battery_energy_exported",
    "battery_energy_imported_from_grid",
];

const ENERGY_HEADER: &[&str] = &[
    "timestamp",
    "solar_energy_exported",
    "generator_energy_exported",
    "grid_energy_imported",
    "grid_energy_exported_from_solar",
    "grid_energy_exported_from_battery",
    "battery_energy_exported",
    "battery_energy_imported_from_grid",
    "battery_energy_imported_from_solar",
    "consumer_energy_imported_from_grid",
    "consumer_energy_imported_from_solar",
    "consumer_energy_imported_from_battery",
];

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum SchemaVersion {
    /// Flat per-day power files and one cumulative `energy.csv` of monthly
    /// totals.
    V1,

    /// Power files under `power/`, `grid_services_power` column added.
    V2,

    /// Per-month energy files of daily totals under `energy/`.
    V3,
}

impl SchemaVersion {
    #[must_use]
    pub const fn power_in_subdir(self) -> bool {
        !matches!(self, Self::V1)
    }

    /// One growing `energy.csv` merged across runs, as opposed to discrete
    /// per-month bucket files.
    #[must_use]
    pub const fn cumulative_energy(self) -> bool {
        matches!(self, Self::V1 | Self::V2)
    }

    /// `period` query parameter for energy-kind history calls: monthly totals
    /// for the cumulative file, daily totals for per-month bucket files.
    #[must_use]
    pub const fn energy_period(self) -> &'static str {
        if self.cumulative_energy() { "month" } else { "day" }
    }

    #[must_use]
    pub const fn power_header(self) -> &'static [&'static str] {
        match self {
            Self::V1 => POWER_HEADER_V1,
            Self::V2 | Self::V3 => POWER_HEADER,
        }
    }

    #[must_use]
    pub const fn energy_header(self) -> &'static [&'static str] {
        match self {
            Self::V1 => ENERGY_HEADER_V1,
            Self::V2 | Self::V3 => ENERGY_HEADER,
        }
    }

    #[must_use]
    pub fn power_fields(self, row: &PowerRow) -> Vec<String> {
        let mut fields = vec![
            row.timestamp.format(TIMESTAMP_FORMAT).to_string(),
            row.solar_power.to_string(),
            row.battery_power.to_string(),
            row.grid_power.to_string(),
        ];
        if !matches!(self, Self::V1) {
            fields.push(row.grid_services_power.to_string());
        }
        fields.push(row.generator_power.to_string());
        fields.push(row.load_power.to_string());
        fields
    }

    #[must_use]
    pub fn energy_fields(self, row: &EnergyRow) -> Vec<String> {
        let timestamp = row.timestamp.format(TIMESTAMP_FORMAT).to_string();
        match self {
            Self::V1 => vec![
                timestamp,
                row.solar_energy_exported.to_string(),
                row.grid_energy_imported.to_string(),
                row.battery_energy_exported.to_string(),
                row.battery_energy_imported_from_grid.to_string(),
            ],
            Self::V2 | Self::V3 => vec![
                timestamp,
                row.solar_energy_exported.to_string(),
                row.generator_energy_exported.to_string(),
                row.grid_energy_imported.to_string(),
                row.grid_energy_exported_from_solar.to_string(),
                row.grid_energy_exported_from_battery.to_string(),
                row.battery_energy_exported.to_string(),
                row.battery_energy_imported_from_grid.to_string(),
                row.battery_energy_imported_from_solar.to_string(),
                row.consumer_energy_imported_from_grid.to_string(),
                row.consumer_energy_imported_from_solar.to_string(),
                row.consumer_energy_imported_from_battery.to_string(),
            ],
        }
    }
}

/// One 5-minute power sample in site-local wall time, watts.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PowerRow {
    pub timestamp: NaiveDateTime,
    pub solar_power: f64,
    pub battery_power: f64,
    pub grid_power: f64,
    pub grid_services_power: f64,
    pub generator_power: f64,

    /// Derived locally as the sum of the reported channels. The API reports
    /// its own load figure too, but that one is never trusted.
    pub load_power: f64,
}

impl From<&PowerRecord> for PowerRow {
    fn from(record: &PowerRecord) -> Self {
        Self {
            timestamp: record.timestamp.naive_local(),
            solar_power: record.solar_power,
            battery_power: record.battery_power,
            grid_power: record.grid_power,
            grid_services_power: record.grid_services_power,
            generator_power: record.generator_power,
            load_power: record.solar_power
                + record.battery_power
                + record.grid_power
                + record.grid_services_power
                + record.generator_power,
        }
    }
}

/// One energy total (watt-hours) for a calendar bucket, site-local wall time.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EnergyRow {
    pub timestamp: NaiveDateTime,
    pub solar_energy_exported: f64,
    pub generator_energy_exported: f64,
    pub grid_energy_imported: f64,
    pub grid_energy_exported_from_solar: f64,
    pub grid_energy_exported_from_battery: f64,
    pub battery_energy_exported: f64,
    pub battery_energy_imported_from_grid: f64,
    pub battery_energy_imported_from_solar: f64,
    pub consumer_energy_imported_from_grid: f64,
    pub consumer_energy_imported_from_solar: f64,
    pub consumer_energy_imported_from_battery: f64,
}

impl From<&EnergyRecord> for EnergyRow {
    fn from(record: &EnergyRecord) -> Self {
        Self {
            timestamp: record.timestamp.naive_local(),
            solar_energy_exported: record.solar_energy_exported,
            generator_energy_exported: record.generator_energy_exported,
            grid_energy_imported: record.grid_energy_imported,
            grid_energy_exported_from_solar: record.grid_energy_exported_from_solar,
            grid_energy_exported_from_battery: record.grid_energy_exported_from_battery,
            battery_energy_exported: record.battery_energy_exported,
            battery_energy_imported_from_grid: record.battery_energy_imported_from_grid,
            battery_energy_imported_from_solar: record.battery_energy_imported_from_solar,
            consumer_energy_imported_from_grid: record.consumer_energy_imported_from_grid,
            consumer_energy_imported_from_solar: record.consumer_energy_imported_from_solar,
            consumer_energy_imported_from_battery: record.consumer_energy_imported_from_battery,
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use chrono::{DateTime, FixedOffset};

    use super::*;
    use crate::prelude::*;

    fn sample_record() -> Result<PowerRecord> {
        Ok(PowerRecord {
            timestamp: "2023-05-23T12:05:00-07:00".parse::<DateTime<FixedOffset>>()?,
            solar_power: 4_120.0,
            battery_power: -1_500.0,
            grid_power: 230.5,
            grid_services_power: -15.0,
            generator_power: 0.0,
        })
    }

    #[test]
    fn test_load_power_is_recomputed() -> Result {
        let row = PowerRow::from(&sample_record()?);
        assert_abs_diff_eq!(
            row.load_power,
            row.solar_power
                + row.battery_power
                + row.grid_power
                + row.grid_services_power
                + row.generator_power,
        );
        assert_abs_diff_eq!(row.load_power, 2_835.5);
        Ok(())
    }

    #[test]
    fn test_timestamp_is_site_local() -> Result {
        let row = PowerRow::from(&sample_record()?);
        assert_eq!(row.timestamp.format(TIMESTAMP_FORMAT).to_string(), "2023-05-23 12:05:00");
        Ok(())
    }

    #[test]
    fn test_v1_power_header_omits_grid_services() {
        assert!(!SchemaVersion::V1.power_header().contains(&"grid_services_power"));
        assert!(SchemaVersion::V3.power_header().contains(&"grid_services_power"));
    }

    #[test]
    fn test_field_counts_match_headers() -> Result {
        let row = PowerRow::from(&sample_record()?);
        for version in [SchemaVersion::V1, SchemaVersion::V2, SchemaVersion::V3] {
            assert_eq!(version.power_fields(&row).len(), version.power_header().len());
        }
        Ok(())
    }
}
