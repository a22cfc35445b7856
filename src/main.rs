mod auth;
mod backfill;
mod cli;
mod error;
mod prelude;
mod retry;
mod schema;
mod store;
mod tesla;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use chrono_tz::Tz;
use clap::{Parser, crate_version};

use crate::{
    auth::Authenticator,
    backfill::{Backfiller, Site},
    cli::Args,
    prelude::*,
    retry::RetryPolicy,
    store::Store,
    tesla::{Api, masked},
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt().without_time().compact().init();
    info!(version = crate_version!(), "starting…");

    let args = Args::parse();

    // An interrupt lets the in-flight bucket finish; the next run resumes
    // because completed buckets are skipped.
    let interrupted = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&interrupted))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&interrupted))?;

    let authenticator = Authenticator::log_in_or_load(&args.email).await?;
    let api = Api::try_new(authenticator, RetryPolicy::default()).await?;
    let store = Store::new(args.download_root.clone(), args.schema);
    let backfiller = Backfiller::new(&api, &store, args.earliest_date, Arc::clone(&interrupted));

    for product in api.products().await? {
        let Some(site_id) = product.site_id() else { continue };
        if let Some(only) = args.site
            && only != site_id
        {
            continue;
        }

        let info = api.site_info(site_id).await?;
        let timezone: Tz = info
            .timezone
            .parse()
            .map_err(|_| anyhow!("unknown site timezone `{}`", info.timezone))?;
        let site =
            Site { id: site_id, installed_on: info.installation_date.date_naive(), timezone };
        info!(
            site_id = masked(site.id),
            timezone = %site.timezone,
            installed_on = %site.installed_on,
            "backfilling site"
        );

        let today = site.today();
        backfiller.power_sweep(&site, today).await?;
        if interrupted.load(Ordering::Relaxed) {
            break;
        }
        backfiller.energy_sweep(&site, today).await?;
        if interrupted.load(Ordering::Relaxed) {
            break;
        }
    }

    info!("done!");
    Ok(())
}
