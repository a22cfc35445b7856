use std::path::PathBuf;

use chrono::NaiveDate;
use clap::Parser;

use crate::schema::SchemaVersion;

#[derive(Parser)]
#[command(author, version, about, propagate_version = true)]
pub struct Args {
    /// Tesla account email address; selects the credential store entry.
    #[clap(long, env = "SQUIRREL_EMAIL")]
    pub email: String,

    /// Directory the per-site archives are written under.
    #[clap(long = "download-root", env = "SQUIRREL_DOWNLOAD_ROOT", default_value = "download")]
    pub download_root: PathBuf,

    /// On-disk layout and CSV header variant. Pick once per download root:
    /// the version is never inferred from existing files.
    #[clap(long, env = "SQUIRREL_SCHEMA", value_enum, default_value = "v3")]
    pub schema: SchemaVersion,

    /// Hard floor for the backward sweep, e.g. `2020-01-01`. Useful to cap
    /// very old installs.
    #[clap(long = "earliest-date", env = "SQUIRREL_EARLIEST_DATE")]
    pub earliest_date: Option<NaiveDate>,

    /// Back up only this energy site instead of every site on the account.
    #[clap(long, env = "SQUIRREL_SITE")]
    pub site: Option<u64>,
}
