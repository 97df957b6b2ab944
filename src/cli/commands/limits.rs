use anyhow::{Context, Result, anyhow};
use chrono::Duration;
use clap::{Arg, ArgAction, ArgMatches, Command};

use crate::{
    access::{LockoutPolicy, LockoutScope, RateLimitTable, audit::DEFAULT_AUDIT_CAPACITY},
    api::TrustedProxies,
};

pub const ARG_LOCKOUT_THRESHOLD: &str = "lockout-threshold";
pub const ARG_LOCKOUT_WINDOW: &str = "lockout-window-seconds";
pub const ARG_LOCKOUT_DURATION: &str = "lockout-duration-seconds";
pub const ARG_LOCKOUT_SCOPE: &str = "lockout-scope";
pub const ARG_RATE_LIMIT: &str = "rate-limit";
pub const ARG_RATE_LIMIT_BYPASS: &str = "rate-limit-bypass";
pub const ARG_TRUSTED_PROXIES: &str = "trusted-proxies";
pub const ARG_AUDIT_CAPACITY: &str = "audit-capacity";

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_lockout_args(command);
    let command = with_rate_limit_args(command);
    command.arg(
        Arg::new(ARG_AUDIT_CAPACITY)
            .long(ARG_AUDIT_CAPACITY)
            .help("Audit events kept in memory for GET /audit/events")
            .env("VESTIBULE_AUDIT_CAPACITY")
            .default_value("1024")
            .value_parser(clap::value_parser!(usize)),
    )
}

fn with_lockout_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_LOCKOUT_THRESHOLD)
                .long(ARG_LOCKOUT_THRESHOLD)
                .help("Consecutive failed logins before the identifier is locked")
                .env("VESTIBULE_LOCKOUT_THRESHOLD")
                .default_value("5")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_LOCKOUT_WINDOW)
                .long(ARG_LOCKOUT_WINDOW)
                .help("Window in seconds in which failures are counted")
                .env("VESTIBULE_LOCKOUT_WINDOW_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_LOCKOUT_DURATION)
                .long(ARG_LOCKOUT_DURATION)
                .help("Lock duration in seconds")
                .env("VESTIBULE_LOCKOUT_DURATION_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_LOCKOUT_SCOPE)
                .long(ARG_LOCKOUT_SCOPE)
                .help("Lockout key: email, or email-ip to lock per email and client address")
                .env("VESTIBULE_LOCKOUT_SCOPE")
                .default_value("email"),
        )
}

fn with_rate_limit_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_RATE_LIMIT)
                .long(ARG_RATE_LIMIT)
                .help("Override a rate limit: class=strategy:max:window_seconds")
                .long_help(
                    "Override a rate limit. Classes: login, general_api, admin_api. \
                     Strategies: fixed, sliding. Example: login=sliding:10:900",
                )
                .env("VESTIBULE_RATE_LIMITS")
                .value_delimiter(',')
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new(ARG_RATE_LIMIT_BYPASS)
                .long(ARG_RATE_LIMIT_BYPASS)
                .help("Socket peer addresses exempt from rate limiting; never matched against headers")
                .env("VESTIBULE_RATE_LIMIT_BYPASS")
                .value_delimiter(',')
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new(ARG_TRUSTED_PROXIES)
                .long(ARG_TRUSTED_PROXIES)
                .help("Proxy networks (CIDR or address) whose X-Forwarded-For is honoured")
                .env("VESTIBULE_TRUSTED_PROXIES")
                .value_delimiter(',')
                .action(ArgAction::Append),
        )
}

#[derive(Debug)]
pub struct Options {
    pub lockout: LockoutPolicy,
    pub rate_limits: RateLimitTable,
    pub rate_limit_bypass: Vec<String>,
    pub trusted_proxies: TrustedProxies,
    pub audit_capacity: usize,
}

impl Options {
    /// # Errors
    /// Returns an error for an unknown lockout scope, a malformed rate limit override
    /// or an invalid trusted proxy network.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let defaults = LockoutPolicy::default();
        let scope = matches
            .get_one::<String>(ARG_LOCKOUT_SCOPE)
            .map_or(Ok(defaults.scope), |value| value.parse::<LockoutScope>())
            .map_err(|err| anyhow!("invalid --{ARG_LOCKOUT_SCOPE}: {err}"))?;
        let lockout = LockoutPolicy {
            threshold: matches
                .get_one::<u64>(ARG_LOCKOUT_THRESHOLD)
                .copied()
                .unwrap_or(defaults.threshold),
            window: matches
                .get_one::<i64>(ARG_LOCKOUT_WINDOW)
                .copied()
                .map_or(defaults.window, Duration::seconds),
            duration: matches
                .get_one::<i64>(ARG_LOCKOUT_DURATION)
                .copied()
                .map_or(defaults.duration, Duration::seconds),
            scope,
        };

        let mut rate_limits = RateLimitTable::new();
        for value in strings(matches, ARG_RATE_LIMIT) {
            let (route, rule) = RateLimitTable::parse_override(&value)
                .map_err(|err| anyhow!("invalid --{ARG_RATE_LIMIT}: {err}"))?;
            rate_limits = rate_limits.with_rule(route, rule);
        }

        Ok(Self {
            lockout,
            rate_limits,
            rate_limit_bypass: strings(matches, ARG_RATE_LIMIT_BYPASS),
            trusted_proxies: TrustedProxies::parse(strings(matches, ARG_TRUSTED_PROXIES))
                .with_context(|| format!("invalid --{ARG_TRUSTED_PROXIES}"))?,
            audit_capacity: matches
                .get_one::<usize>(ARG_AUDIT_CAPACITY)
                .copied()
                .unwrap_or(DEFAULT_AUDIT_CAPACITY)
                .max(1),
        })
    }
}

fn strings(matches: &ArgMatches, name: &str) -> Vec<String> {
    matches
        .get_many::<String>(name)
        .map(|values| {
            values
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
