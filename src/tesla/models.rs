//! Owner API payloads, narrowed to the fields the downloader consumes.

use chrono::{DateTime, FixedOffset};
use serde::Deserialize;

/// Every Owner API payload is wrapped into a `response` object.
#[derive(Deserialize)]
pub struct Envelope<T> {
    pub response: Option<T>,
}

#[derive(Deserialize)]
pub struct Region {
    #[serde(default)]
    pub region: String,

    pub fleet_api_base_url: String,
}

#[derive(Debug, Deserialize)]
pub struct Product {
    #[serde(default)]
    pub energy_site_id: Option<u64>,

    #[serde(default)]
    pub resource_type: Option<String>,
}

impl Product {
    /// Vehicles and other products on the same account are not energy sites.
    #[must_use]
    pub fn site_id(&self) -> Option<u64> {
        match self.resource_type.as_deref() {
            Some("battery" | "solar") => self.energy_site_id,
            Some(_) | None => None,
        }
    }
}

#[derive(Deserialize)]
pub struct SiteInfo {
    pub installation_date: DateTime<FixedOffset>,

    #[serde(rename = "installation_time_zone")]
    pub timezone: String,
}

#[derive(Deserialize)]
pub struct CalendarHistory<T> {
    #[serde(default = "Vec::new")]
    pub time_series: Vec<T>,
}

impl<T> Default for CalendarHistory<T> {
    fn default() -> Self {
        Self { time_series: Vec::new() }
    }
}

/// One 5-minute power sample as reported by the API, watts.
///
/// `load_power` is also present in the payload but deliberately not mapped:
/// the writer recomputes it from the independent channels.
#[derive(Deserialize)]
pub struct PowerRecord {
    pub timestamp: DateTime<FixedOffset>,
    pub solar_power: f64,
    pub battery_power: f64,
    pub grid_power: f64,

    #[serde(default)]
    pub grid_services_power: f64,

    #[serde(default)]
    pub generator_power: f64,
}

/// One energy total for a calendar bucket, watt-hours. Sites without a
/// generator or grid-services enrollment simply omit those fields.
#[derive(Deserialize)]
pub struct EnergyRecord {
    pub timestamp: DateTime<FixedOffset>,

    #[serde(default)]
    pub solar_energy_exported: f64,

    #[serde(default)]
    pub generator_energy_exported: f64,

    #[serde(default)]
    pub grid_energy_imported: f64,

    #[serde(default)]
    pub grid_energy_exported_from_solar: f64,

    #[serde(default)]
    pub grid_energy_exported_from_battery: f64,

    #[serde(default)]
    pub battery_energy_exported: f64,

    #[serde(default)]
    pub battery_energy_imported_from_grid: f64,

    #[serde(default)]
    pub battery_energy_imported_from_solar: f64,

    #[serde(default)]
    pub consumer_energy_imported_from_grid: f64,

    #[serde(default)]
    pub consumer_energy_imported_from_solar: f64,

    #[serde(default)]
    pub consumer_energy_imported_from_battery: f64,
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::prelude::*;

    #[test]
    fn test_deserialize_products_ok() -> Result {
        // language=JSON
        const RESPONSE: &str = r#"
            {
                "response": [
                    {"id": 12345, "vehicle_id": 67890, "vin": "5YJ3E1EA7JF000000"},
                    {"energy_site_id": 2252019910371704, "resource_type": "battery", "site_name": "Home"},
                    {"energy_site_id": 1112019910371999, "resource_type": "wall_connector"}
                ],
                "count": 3
            }
        "#;
        let envelope = serde_json::from_str::<Envelope<Vec<Product>>>(RESPONSE)?;
        let sites: Vec<u64> = envelope
            .response
            .context("missing response")?
            .iter()
            .filter_map(Product::site_id)
            .collect();
        assert_eq!(sites, [2_252_019_910_371_704]);
        Ok(())
    }

    #[test]
    fn test_deserialize_site_info_ok() -> Result {
        // language=JSON
        const RESPONSE: &str = r#"
            {
                "response": {
                    "id": "2252019910371704",
                    "site_name": "Home",
                    "installation_date": "2022-01-01T10:10:00-08:00",
                    "installation_time_zone": "America/Los_Angeles"
                }
            }
        "#;
        let info = serde_json::from_str::<Envelope<SiteInfo>>(RESPONSE)?
            .response
            .context("missing response")?;
        assert_eq!(info.timezone, "America/Los_Angeles");
        assert_eq!(
            info.installation_date.date_naive(),
            NaiveDate::from_ymd_opt(2022, 1, 1).context("bad date")?,
        );
        Ok(())
    }

    #[test]
    fn test_deserialize_power_history_ok() -> Result {
        // language=JSON
        const RESPONSE: &str = r#"
            {
                "response": {
                    "serial_number": "XXX",
                    "period": "day",
                    "time_series": [
                        {
                            "timestamp": "2023-05-23T00:00:00-07:00",
                            "solar_power": 0,
                            "battery_power": 250,
                            "grid_power": 113.5,
                            "grid_services_power": 0,
                            "generator_power": 0,
                            "load_power": 363.5
                        },
                        {
                            "timestamp": "2023-05-23T00:05:00-07:00",
                            "solar_power": 0,
                            "battery_power": 240,
                            "grid_power": 118,
                            "load_power": 358
                        }
                    ]
                }
            }
        "#;
        let history = serde_json::from_str::<Envelope<CalendarHistory<PowerRecord>>>(RESPONSE)?
            .response
            .unwrap_or_default();
        assert_eq!(history.time_series.len(), 2);
        // The second sample omits the optional channels.
        assert_eq!(history.time_series[1].grid_services_power, 0.0);
        Ok(())
    }

    #[test]
    fn test_missing_required_channel_is_an_error() {
        // language=JSON
        const RESPONSE: &str = r#"
            {"time_series": [{"timestamp": "2023-05-23T00:00:00-07:00", "battery_power": 1}]}
        "#;
        assert!(serde_json::from_str::<CalendarHistory<PowerRecord>>(RESPONSE).is_err());
    }

    #[test]
    fn test_empty_history_is_not_an_error() -> Result {
        // language=JSON
        const RESPONSE: &str = r#"{"response": {"serial_number": "XXX"}}"#;
        let history = serde_json::from_str::<Envelope<CalendarHistory<EnergyRecord>>>(RESPONSE)?
            .response
            .unwrap_or_default();
        assert!(history.time_series.is_empty());
        Ok(())
    }
}
