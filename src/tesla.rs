//! Owner API client: region discovery, site enumeration, and the
//! calendar-history endpoint the backfill feeds on.

pub mod models;

use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, TimeZone};
use chrono_tz::Tz;
use reqwest::{Client, StatusCode, Url};
use serde::{Serialize, de::DeserializeOwned};
use tokio::{
    sync::Mutex,
    time::{Instant, sleep},
};

use self::models::{CalendarHistory, EnergyRecord, Envelope, PowerRecord, Product, Region, SiteInfo};
use crate::{auth::Authenticator, error::DownloadError, prelude::*, retry::RetryPolicy};

const DEFAULT_BASE_URL: &str = "https://fleet-api.prd.na.vn.cloud.tesla.com";

/// For endpoints taking no query parameters (a unit would not serialize).
const NO_QUERY: [(&str, &str); 0] = [];

/// Minimum spacing between consecutive outbound requests. The vendor
/// throttles aggressively and answers bursts with 429s.
#[derive(Copy, Clone)]
pub struct Pacing {
    pub power: Duration,
    pub energy: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self { power: Duration::from_millis(1500), energy: Duration::from_secs(5) }
    }
}

impl Pacing {
    /// No spacing at all, for tests.
    #[must_use]
    pub const fn none() -> Self {
        Self { power: Duration::ZERO, energy: Duration::ZERO }
    }
}

pub struct Api {
    client: Client,
    base_url: Url,
    authenticator: Authenticator,
    retry_policy: RetryPolicy,
    pacing: Pacing,
    last_request_at: Mutex<Option<Instant>>,
}

impl Api {
    /// Client against the production API: resolves the region-specific base
    /// URL with a dedicated lookup call before anything else.
    pub async fn try_new(authenticator: Authenticator, retry_policy: RetryPolicy) -> Result<Self> {
        let mut api = Self::with_base_url(
            Url::parse(DEFAULT_BASE_URL)?,
            authenticator,
            retry_policy,
            Pacing::default(),
        )?;
        let region: Region = api
            .get("api/1/users/region", &NO_QUERY, api.pacing.power)
            .await?
            .context("the region lookup returned no body")?;
        api.base_url =
            Url::parse(&region.fleet_api_base_url).context("invalid region base URL")?;
        info!(region = region.region, base_url = %api.base_url, "region resolved");
        Ok(api)
    }

    /// Client pinned to a known base URL, skipping region discovery.
    pub fn with_base_url(
        base_url: Url,
        authenticator: Authenticator,
        retry_policy: RetryPolicy,
        pacing: Pacing,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent("squirrel")
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url,
            authenticator,
            retry_policy,
            pacing,
            last_request_at: Mutex::new(None),
        })
    }

    /// Energy sites on the account (vehicles and wall connectors filtered
    /// out by the caller via [`Product::site_id`]).
    #[instrument(skip_all)]
    pub async fn products(&self) -> Result<Vec<Product>, DownloadError> {
        self.get("api/1/products", &NO_QUERY, self.pacing.power)
            .await?
            .ok_or_else(|| DownloadError::Schema("`products` response is empty".to_string()))
    }

    #[instrument(skip_all, fields(site_id = masked(site_id)))]
    pub async fn site_info(&self, site_id: u64) -> Result<SiteInfo, DownloadError> {
        self.get(&format!("api/1/energy_sites/{site_id}/site_info"), &NO_QUERY, self.pacing.power)
            .await?
            .ok_or_else(|| DownloadError::Schema("`site_info` response is empty".to_string()))
    }

    /// 5-minute power samples for one site-local calendar day. An empty list
    /// is a valid terminal answer: the site had no activity that day.
    #[instrument(skip_all, fields(site_id = masked(site_id), date = %date))]
    pub async fn power_history(
        &self,
        site_id: u64,
        timezone: Tz,
        date: NaiveDate,
    ) -> Result<Vec<PowerRecord>, DownloadError> {
        let start = date.and_time(NaiveTime::MIN);
        let end = start + TimeDelta::seconds(86_399);
        self.calendar_history(site_id, "power", "day", timezone, start, end, self.pacing.power)
            .await
    }

    /// Energy totals for one site-local calendar-month chunk: monthly totals
    /// for the cumulative file, daily totals for per-month bucket files.
    #[instrument(skip_all, fields(site_id = masked(site_id), month = %first_day.format("%Y-%m")))]
    pub async fn energy_history(
        &self,
        site_id: u64,
        timezone: Tz,
        period: &str,
        first_day: NaiveDate,
        last_day: NaiveDate,
    ) -> Result<Vec<EnergyRecord>, DownloadError> {
        let start = first_day.and_time(NaiveTime::MIN);
        let end = last_day.and_time(NaiveTime::MIN) + TimeDelta::seconds(86_399);
        self.calendar_history(site_id, "energy", period, timezone, start, end, self.pacing.energy)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn calendar_history<T: DeserializeOwned>(
        &self,
        site_id: u64,
        kind: &str,
        period: &str,
        timezone: Tz,
        start: NaiveDateTime,
        end: NaiveDateTime,
        min_delay: Duration,
    ) -> Result<Vec<T>, DownloadError> {
        #[derive(Serialize)]
        struct CalendarHistoryQuery<'a> {
            kind: &'a str,
            period: &'a str,
            start_date: String,
            end_date: String,
            time_zone: &'a str,
            fill_telemetry: u8,
        }

        let query = CalendarHistoryQuery {
            kind,
            period,
            start_date: localize(timezone, start).to_rfc3339(),
            end_date: localize(timezone, end).to_rfc3339(),
            time_zone: timezone.name(),
            fill_telemetry: 0,
        };
        let history: Option<CalendarHistory<T>> = self
            .get(&format!("api/1/energy_sites/{site_id}/calendar_history"), &query, min_delay)
            .await?;
        Ok(history.unwrap_or_default().time_series)
    }

    /// One paced, retried, authenticated GET. `None` means the envelope held
    /// a `null` response.
    async fn get<T, Q>(
        &self,
        path: &str,
        query: &Q,
        min_delay: Duration,
    ) -> Result<Option<T>, DownloadError>
    where
        T: DeserializeOwned,
        Q: Serialize,
    {
        self.retry_policy.run(|| self.get_once(path, query, min_delay)).await
    }

    async fn get_once<T, Q>(
        &self,
        path: &str,
        query: &Q,
        min_delay: Duration,
    ) -> Result<Option<T>, DownloadError>
    where
        T: DeserializeOwned,
        Q: Serialize,
    {
        self.pace(min_delay).await;
        let url = format!("{}/{}", self.base_url.as_str().trim_end_matches('/'), path);
        let mut response = self
            .client
            .get(&url)
            .query(query)
            .bearer_auth(self.authenticator.bearer().await?)
            .send()
            .await?;

        // An auth-rejected answer triggers exactly one refresh-and-retry.
        if matches!(response.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            debug!("access token rejected, refreshing once");
            self.authenticator.refresh().await?;
            response = self
                .client
                .get(&url)
                .query(query)
                .bearer_auth(self.authenticator.bearer().await?)
                .send()
                .await?;
            if matches!(response.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
                return Err(DownloadError::Auth(format!(
                    "the API still answers {} after a token refresh",
                    response.status(),
                )));
            }
        }

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status(status));
        }
        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|error| DownloadError::Schema(format!("failed to decode `{path}`: {error}")))?;
        Ok(envelope.response)
    }

    async fn pace(&self, min_delay: Duration) {
        let mut last_request_at = self.last_request_at.lock().await;
        if let Some(last) = *last_request_at {
            let ready_at = last + min_delay;
            let now = Instant::now();
            if ready_at > now {
                sleep(ready_at - now).await;
            }
        }
        *last_request_at = Some(Instant::now());
    }
}

/// Only the last four digits of a site identifier make it into the logs.
#[must_use]
pub fn masked(site_id: u64) -> String {
    let digits = site_id.to_string();
    let tail = digits.len().saturating_sub(4);
    format!("***{}", digits.get(tail..).unwrap_or_default())
}

/// Anchors naive site-local wall time in the site's timezone; ambiguous
/// DST-fold times resolve to the earlier instant.
fn localize(timezone: Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    timezone
        .from_local_datetime(&naive)
        .earliest()
        .unwrap_or_else(|| timezone.from_utc_datetime(&naive))
}
