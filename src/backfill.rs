//! The sweep driver: walks calendar buckets, skips what the archive already
//! holds, and survives individual bucket failures.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use chrono::{Datelike, Months, NaiveDate, Utc};
use chrono_tz::Tz;

use crate::{
    error::DownloadError,
    prelude::*,
    schema::{EnergyRow, PowerRow},
    store::Store,
    tesla::{Api, masked},
};

/// One energy installation on the account.
pub struct Site {
    pub id: u64,
    pub installed_on: NaiveDate,
    pub timezone: Tz,
}

impl Site {
    /// The current calendar date at the installation, which is what the
    /// bucket arithmetic runs on.
    #[must_use]
    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.timezone).date_naive()
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SweepSummary {
    pub fetched: usize,
    pub skipped: usize,
    pub empty: usize,
    pub failed: usize,
}

pub struct Backfiller<'a> {
    api: &'a Api,
    store: &'a Store,
    earliest_date: Option<NaiveDate>,
    interrupted: Arc<AtomicBool>,
}

impl<'a> Backfiller<'a> {
    pub fn new(
        api: &'a Api,
        store: &'a Store,
        earliest_date: Option<NaiveDate>,
        interrupted: Arc<AtomicBool>,
    ) -> Self {
        Self { api, store, earliest_date, interrupted }
    }

    fn oldest_day(&self, site: &Site) -> NaiveDate {
        oldest_bucket(site.installed_on, self.earliest_date)
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Relaxed)
    }

    /// Newest-first day sweep: recent data becomes useful immediately, and
    /// the install-date lower bound is where the sweep bottoms out. A failed
    /// bucket is logged and left for the next run — it must never block the
    /// years behind it.
    #[instrument(skip_all, fields(site_id = masked(site.id)))]
    pub async fn power_sweep(
        &self,
        site: &Site,
        today: NaiveDate,
    ) -> Result<SweepSummary, DownloadError> {
        self.store.remove_partial_files(site.id)?;
        let mut summary = SweepSummary::default();
        for date in day_buckets(today, self.oldest_day(site)) {
            if self.is_interrupted() {
                info!("interrupted, stopping the sweep");
                break;
            }
            // The still-accumulating current day is never trusted from disk.
            if date != today && self.store.is_power_day_complete(site.id, date) {
                summary.skipped += 1;
                continue;
            }
            match self.download_power_day(site, date).await {
                Ok(0) => summary.empty += 1,
                Ok(_) => summary.fetched += 1,
                Err(error) if error.is_fatal() => return Err(error),
                Err(error) => {
                    warn!(%date, %error, "bucket failed, moving on");
                    summary.failed += 1;
                }
            }
        }
        info!(
            summary.fetched,
            summary.skipped,
            summary.empty,
            summary.failed,
            "power sweep finished"
        );
        Ok(summary)
    }

    async fn download_power_day(
        &self,
        site: &Site,
        date: NaiveDate,
    ) -> Result<usize, DownloadError> {
        let records = self.api.power_history(site.id, site.timezone, date).await?;
        if records.is_empty() {
            debug!(%date, "no samples reported");
            return Ok(0);
        }
        // The API occasionally stamps the closing slot onto the next
        // midnight; rows outside the bucket date are dropped.
        let rows: Vec<PowerRow> = records
            .iter()
            .map(PowerRow::from)
            .filter(|row| row.timestamp.date() == date)
            .collect();
        if rows.is_empty() {
            return Ok(0);
        }
        let count = rows.len();
        self.store.write_power_day(site.id, date, rows)?;
        Ok(count)
    }

    pub async fn energy_sweep(
        &self,
        site: &Site,
        today: NaiveDate,
    ) -> Result<SweepSummary, DownloadError> {
        if self.store.schema().cumulative_energy() {
            self.cumulative_energy_sweep(site, today).await
        } else {
            self.monthly_energy_sweep(site, today).await
        }
    }

    /// The cumulative file grows forward, oldest month first; per-row dedup
    /// in the store makes the direction irrelevant for idempotence.
    #[instrument(skip_all, fields(site_id = masked(site.id)))]
    async fn cumulative_energy_sweep(
        &self,
        site: &Site,
        today: NaiveDate,
    ) -> Result<SweepSummary, DownloadError> {
        let mut summary = SweepSummary::default();
        for month in months_forward(month_start(self.oldest_day(site)), month_start(today)) {
            if self.is_interrupted() {
                info!("interrupted, stopping the sweep");
                break;
            }
            match self.fetch_energy_month(site, month, today).await {
                Ok(rows) if rows.is_empty() => summary.empty += 1,
                Ok(rows) => {
                    let added = self.store.merge_energy_rows(site.id, &rows)?;
                    debug!(month = %month.format("%Y-%m"), added, "merged");
                    summary.fetched += 1;
                }
                Err(error) if error.is_fatal() => return Err(error),
                Err(error) => {
                    warn!(month = %month.format("%Y-%m"), %error, "chunk failed, moving on");
                    summary.failed += 1;
                }
            }
        }
        info!(
            summary.fetched,
            summary.skipped,
            summary.empty,
            summary.failed,
            "energy sweep finished"
        );
        Ok(summary)
    }

    /// Discrete per-month files sweep newest-first, exactly like power days.
    #[instrument(skip_all, fields(site_id = masked(site.id)))]
    async fn monthly_energy_sweep(
        &self,
        site: &Site,
        today: NaiveDate,
    ) -> Result<SweepSummary, DownloadError> {
        let current_month = month_start(today);
        let mut summary = SweepSummary::default();
        for month in months_backward(current_month, month_start(self.oldest_day(site))) {
            if self.is_interrupted() {
                info!("interrupted, stopping the sweep");
                break;
            }
            if month != current_month
                && self.store.is_energy_month_complete(site.id, month, month_end(month))
            {
                summary.skipped += 1;
                continue;
            }
            match self.fetch_energy_month(site, month, today).await {
                Ok(rows) if rows.is_empty() => summary.empty += 1,
                Ok(rows) => {
                    self.store.write_energy_month(site.id, month, rows)?;
                    summary.fetched += 1;
                }
                Err(error) if error.is_fatal() => return Err(error),
                Err(error) => {
                    warn!(month = %month.format("%Y-%m"), %error, "bucket failed, moving on");
                    summary.failed += 1;
                }
            }
        }
        info!(
            summary.fetched,
            summary.skipped,
            summary.empty,
            summary.failed,
            "energy sweep finished"
        );
        Ok(summary)
    }

    async fn fetch_energy_month(
        &self,
        site: &Site,
        month: NaiveDate,
        today: NaiveDate,
    ) -> Result<Vec<EnergyRow>, DownloadError> {
        // The current month is still open; don't ask beyond today.
        let last_day = month_end(month).min(today);
        let records = self
            .api
            .energy_history(
                site.id,
                site.timezone,
                self.store.schema().energy_period(),
                month,
                last_day,
            )
            .await?;
        Ok(records
            .iter()
            .map(EnergyRow::from)
            .filter(|row| (month..=last_day).contains(&row.timestamp.date()))
            .collect())
    }
}

/// The sweep bottoms out at the install date unless an explicit floor cuts
/// it off earlier.
fn oldest_bucket(installed_on: NaiveDate, floor: Option<NaiveDate>) -> NaiveDate {
    floor.map_or(installed_on, |floor| floor.max(installed_on))
}

/// Day buckets from `today` back to `oldest`, both inclusive.
fn day_buckets(today: NaiveDate, oldest: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    std::iter::successors(Some(today), |date| date.pred_opt())
        .take_while(move |date| *date >= oldest)
}

fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

fn month_end(month: NaiveDate) -> NaiveDate {
    month
        .checked_add_months(Months::new(1))
        .and_then(|next_month| next_month.pred_opt())
        .unwrap_or(month)
}

fn months_backward(current: NaiveDate, oldest: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    std::iter::successors(Some(current), |month| month.checked_sub_months(Months::new(1)))
        .take_while(move |month| *month >= oldest)
}

fn months_forward(oldest: NaiveDate, current: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    std::iter::successors(Some(oldest), |month| month.checked_add_months(Months::new(1)))
        .take_while(move |month| *month <= current)
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use chrono_tz::America::Los_Angeles;
    use mockito::Matcher;
    use reqwest::Url;

    use super::*;
    use crate::{
        auth::{Authenticator, Credentials},
        retry::RetryPolicy,
        schema::SchemaVersion,
        tesla::Pacing,
    };

    const SITE_ID: u64 = 777_123;

    fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
    }

    fn site(installed_on: NaiveDate) -> Site {
        Site { id: SITE_ID, installed_on, timezone: Los_Angeles }
    }

    fn api_against(server: &mockito::ServerGuard) -> Result<Api> {
        let credentials = Credentials {
            access_token: "token".to_string(),
            refresh_token: "refresh".to_string(),
            expires_at: Some(Utc::now() + TimeDelta::hours(8)),
        };
        let store_path =
            std::env::temp_dir().join(format!("squirrel-backfill-test-{}.json", std::process::id()));
        let authenticator =
            Authenticator::with_credentials(credentials, store_path, Url::parse(&server.url())?)?;
        Api::with_base_url(
            Url::parse(&server.url())?,
            authenticator,
            RetryPolicy::no_delay(2),
            Pacing::none(),
        )
    }

    fn power_body(timestamp: &str) -> String {
        format!(
            r#"{{"response": {{"time_series": [
                {{"timestamp": "{timestamp}", "solar_power": 1200,
                  "battery_power": -400, "grid_power": 55}}
            ]}}}}"#,
        )
    }

    fn start_date_matcher(start_date: &str) -> Matcher {
        Matcher::UrlEncoded("start_date".into(), start_date.into())
    }

    #[test]
    fn test_day_buckets_stop_at_the_install_date() {
        let buckets: Vec<NaiveDate> =
            day_buckets(date(2023, 5, 23), date(2022, 1, 1)).collect();
        assert_eq!(buckets.len(), 508);
        assert_eq!(buckets.first(), Some(&date(2023, 5, 23)));
        assert_eq!(buckets.last(), Some(&date(2022, 1, 1)));
        assert!(!buckets.contains(&date(2021, 12, 31)));
    }

    #[test]
    fn test_earliest_date_floor_wins_over_the_install_date() {
        assert_eq!(oldest_bucket(date(2022, 1, 1), Some(date(2023, 1, 1))), date(2023, 1, 1));
        assert_eq!(oldest_bucket(date(2023, 3, 1), Some(date(2023, 1, 1))), date(2023, 3, 1));
        assert_eq!(oldest_bucket(date(2022, 1, 1), None), date(2022, 1, 1));
    }

    #[test]
    fn test_month_arithmetic() {
        assert_eq!(month_start(date(2023, 5, 23)), date(2023, 5, 1));
        assert_eq!(month_end(date(2023, 2, 1)), date(2023, 2, 28));
        assert_eq!(month_end(date(2024, 2, 1)), date(2024, 2, 29));

        let forward: Vec<NaiveDate> =
            months_forward(date(2022, 1, 1), date(2023, 5, 1)).collect();
        assert_eq!(forward.len(), 17);
        assert_eq!(forward.first(), Some(&date(2022, 1, 1)));
        assert_eq!(forward.last(), Some(&date(2023, 5, 1)));

        let backward: Vec<NaiveDate> =
            months_backward(date(2023, 5, 1), date(2022, 1, 1)).collect();
        assert_eq!(backward.len(), 17);
        assert_eq!(backward.first(), Some(&date(2023, 5, 1)));
    }

    #[tokio::test]
    async fn test_power_sweep_skips_complete_buckets_and_refetches_today() -> Result {
        let mut server = mockito::Server::new_async().await;
        let today_mock = server
            .mock("GET", "/api/1/energy_sites/777123/calendar_history")
            .match_query(start_date_matcher("2023-05-23T00:00:00-07:00"))
            .with_body(power_body("2023-05-23T10:00:00-07:00"))
            .expect(1)
            .create_async()
            .await;

        let root = tempfile::tempdir()?;
        let store = Store::new(root.path().to_path_buf(), SchemaVersion::V3);
        let today = date(2023, 5, 23);
        let site = site(date(2023, 5, 21));

        // Two fully downloaded days from a previous run.
        for done in [date(2023, 5, 21), date(2023, 5, 22)] {
            let timestamp = done.and_hms_opt(23, 55, 0).context("bad time")?;
            store.write_power_day(
                SITE_ID,
                done,
                vec![PowerRow { timestamp, ..PowerRow::default() }],
            )?;
        }
        let before_21 = std::fs::read(store.power_path(SITE_ID, date(2023, 5, 21)))?;

        let api = api_against(&server)?;
        let backfiller =
            Backfiller::new(&api, &store, None, Arc::new(AtomicBool::new(false)));
        let summary = backfiller.power_sweep(&site, today).await?;

        assert_eq!(summary, SweepSummary { fetched: 1, skipped: 2, empty: 0, failed: 0 });
        assert!(store.power_path(SITE_ID, today).is_file());
        // The already-complete buckets were left byte-identical.
        assert_eq!(std::fs::read(store.power_path(SITE_ID, date(2023, 5, 21)))?, before_21);
        today_mock.assert_async().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_one_failing_bucket_does_not_abort_the_sweep() -> Result {
        let mut server = mockito::Server::new_async().await;
        // The middle day consistently answers 500, its neighbours succeed.
        let failing_mock = server
            .mock("GET", "/api/1/energy_sites/777123/calendar_history")
            .match_query(start_date_matcher("2023-05-22T00:00:00-07:00"))
            .with_status(500)
            .expect(2)
            .create_async()
            .await;
        for (start, timestamp) in [
            ("2023-05-23T00:00:00-07:00", "2023-05-23T10:00:00-07:00"),
            ("2023-05-21T00:00:00-07:00", "2023-05-21T10:00:00-07:00"),
        ] {
            server
                .mock("GET", "/api/1/energy_sites/777123/calendar_history")
                .match_query(start_date_matcher(start))
                .with_body(power_body(timestamp))
                .create_async()
                .await;
        }

        let root = tempfile::tempdir()?;
        let store = Store::new(root.path().to_path_buf(), SchemaVersion::V3);
        let api = api_against(&server)?;
        let backfiller =
            Backfiller::new(&api, &store, None, Arc::new(AtomicBool::new(false)));
        let summary = backfiller.power_sweep(&site(date(2023, 5, 21)), date(2023, 5, 23)).await?;

        assert_eq!(summary, SweepSummary { fetched: 2, skipped: 0, empty: 0, failed: 1 });
        assert!(store.power_path(SITE_ID, date(2023, 5, 21)).is_file());
        assert!(!store.power_path(SITE_ID, date(2023, 5, 22)).exists());
        assert!(store.power_path(SITE_ID, date(2023, 5, 23)).is_file());
        failing_mock.assert_async().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_auth_failure_halts_the_sweep() -> Result {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/1/energy_sites/777123/calendar_history")
            .match_query(Matcher::Any)
            .with_status(401)
            .create_async()
            .await;
        let token_mock = server
            .mock("POST", "/oauth2/v3/token")
            .with_status(400)
            .expect(1)
            .create_async()
            .await;

        let root = tempfile::tempdir()?;
        let store = Store::new(root.path().to_path_buf(), SchemaVersion::V3);
        let api = api_against(&server)?;
        let backfiller =
            Backfiller::new(&api, &store, None, Arc::new(AtomicBool::new(false)));
        let result = backfiller.power_sweep(&site(date(2023, 5, 21)), date(2023, 5, 23)).await;

        assert!(result.is_err_and(|error| error.is_fatal()));
        // Nothing half-written: the not-yet-fetched buckets stay virgin.
        assert!(!store.power_path(SITE_ID, date(2023, 5, 23)).exists());
        token_mock.assert_async().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_cumulative_energy_sweep_merges_forward() -> Result {
        let mut server = mockito::Server::new_async().await;
        for (start, timestamp, exported) in [
            // March opens in PST, the later months in PDT.
            ("2023-03-01T00:00:00-08:00", "2023-03-31T01:00:00-07:00", "410000"),
            ("2023-04-01T00:00:00-07:00", "2023-04-30T01:00:00-07:00", "520000"),
            ("2023-05-01T00:00:00-07:00", "2023-05-23T01:00:00-07:00", "610000"),
        ] {
            server
                .mock("GET", "/api/1/energy_sites/777123/calendar_history")
                .match_query(Matcher::AllOf(vec![
                    Matcher::UrlEncoded("kind".into(), "energy".into()),
                    Matcher::UrlEncoded("period".into(), "month".into()),
                    start_date_matcher(start),
                ]))
                .with_body(format!(
                    r#"{{"response": {{"time_series": [
                        {{"timestamp": "{timestamp}", "solar_energy_exported": {exported}}}
                    ]}}}}"#,
                ))
                .expect(1)
                .create_async()
                .await;
        }

        let root = tempfile::tempdir()?;
        let store = Store::new(root.path().to_path_buf(), SchemaVersion::V2);
        let api = api_against(&server)?;
        let backfiller =
            Backfiller::new(&api, &store, None, Arc::new(AtomicBool::new(false)));
        let summary =
            backfiller.energy_sweep(&site(date(2023, 3, 15)), date(2023, 5, 23)).await?;

        assert_eq!(summary, SweepSummary { fetched: 3, skipped: 0, empty: 0, failed: 0 });
        let contents = std::fs::read_to_string(store.cumulative_energy_path(SITE_ID))?;
        assert_eq!(contents.lines().count(), 4); // header + one row per month
        Ok(())
    }

    #[tokio::test]
    async fn test_monthly_energy_sweep_skips_complete_months() -> Result {
        let mut server = mockito::Server::new_async().await;
        let may_mock = server
            .mock("GET", "/api/1/energy_sites/777123/calendar_history")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("kind".into(), "energy".into()),
                Matcher::UrlEncoded("period".into(), "day".into()),
                start_date_matcher("2023-05-01T00:00:00-07:00"),
                Matcher::UrlEncoded("end_date".into(), "2023-05-23T23:59:59-07:00".into()),
            ]))
            .with_body(
                r#"{"response": {"time_series": [
                    {"timestamp": "2023-05-01T01:00:00-07:00", "solar_energy_exported": 21000}
                ]}}"#,
            )
            .expect(1)
            .create_async()
            .await;

        let root = tempfile::tempdir()?;
        let store = Store::new(root.path().to_path_buf(), SchemaVersion::V3);
        // April is already fully on disk: its file closes on April 30.
        store.write_energy_month(
            SITE_ID,
            date(2023, 4, 1),
            vec![EnergyRow {
                timestamp: date(2023, 4, 30).and_hms_opt(1, 0, 0).context("bad time")?,
                ..EnergyRow::default()
            }],
        )?;

        let api = api_against(&server)?;
        let backfiller =
            Backfiller::new(&api, &store, None, Arc::new(AtomicBool::new(false)));
        let summary =
            backfiller.energy_sweep(&site(date(2023, 4, 1)), date(2023, 5, 23)).await?;

        assert_eq!(summary, SweepSummary { fetched: 1, skipped: 1, empty: 0, failed: 0 });
        assert!(store.energy_month_path(SITE_ID, date(2023, 5, 1)).is_file());
        may_mock.assert_async().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_interrupt_stops_between_buckets() -> Result {
        let server = mockito::Server::new_async().await;
        let root = tempfile::tempdir()?;
        let store = Store::new(root.path().to_path_buf(), SchemaVersion::V3);
        let api = api_against(&server)?;
        let interrupted = Arc::new(AtomicBool::new(true));
        let backfiller = Backfiller::new(&api, &store, None, interrupted);
        let summary = backfiller.power_sweep(&site(date(2022, 1, 1)), date(2023, 5, 23)).await?;
        assert_eq!(summary, SweepSummary::default());
        Ok(())
    }
}
