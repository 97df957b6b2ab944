use anyhow::{Context, Result, anyhow};
use clap::{Arg, ArgMatches, Command};

use crate::storage::StoreBackend;

pub const ARG_DSN: &str = "dsn";
pub const ARG_STORE: &str = "store";
pub const ARG_RECLAIM_INTERVAL: &str = "reclaim-interval-seconds";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_DSN)
                .short('d')
                .long(ARG_DSN)
                .help("Database connection string")
                .long_help(
                    "Database connection string. Admin users always live in Postgres; \
                     sessions, counters and CSRF tokens follow --store.",
                )
                .env("VESTIBULE_DSN")
                .required(true),
        )
        .arg(
            Arg::new(ARG_STORE)
                .long(ARG_STORE)
                .help("Backend for sessions, counters and CSRF tokens: postgres or memory (single instance only)")
                .env("VESTIBULE_STORE")
                .default_value("postgres"),
        )
        .arg(
            Arg::new(ARG_RECLAIM_INTERVAL)
                .long(ARG_RECLAIM_INTERVAL)
                .help("Seconds between purges of expired records, 0 disables")
                .env("VESTIBULE_RECLAIM_INTERVAL_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(u64)),
        )
}

#[derive(Debug)]
pub struct Options {
    pub dsn: String,
    pub backend: StoreBackend,
    pub reclaim_interval_seconds: u64,
}

impl Options {
    /// # Errors
    /// Returns an error if the DSN is missing or the backend is unknown.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let dsn = matches
            .get_one::<String>(ARG_DSN)
            .cloned()
            .context("missing required argument: --dsn")?;
        let backend = matches
            .get_one::<String>(ARG_STORE)
            .map_or(Ok(StoreBackend::default()), |value| value.parse())
            .map_err(|err: String| anyhow!("invalid --store: {err}"))?;
        let reclaim_interval_seconds = matches
            .get_one::<u64>(ARG_RECLAIM_INTERVAL)
            .copied()
            .unwrap_or(300);
        Ok(Self {
            dsn,
            backend,
            reclaim_interval_seconds,
        })
    }
}
