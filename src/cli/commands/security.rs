use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_IDENTITY_URL: &str = "identity-url";
pub const ARG_IDENTITY_TIMEOUT: &str = "identity-timeout-seconds";
pub const ARG_FRONTEND_BASE_URL: &str = "frontend-base-url";
pub const ARG_SESSION_SECRET: &str = "session-secret";
pub const ARG_CSRF_SECRET: &str = "csrf-secret";
pub const ARG_SESSION_TTL: &str = "session-ttl-seconds";
pub const ARG_REMEMBER_ME_TTL: &str = "remember-me-ttl-seconds";
pub const ARG_INACTIVITY_TIMEOUT: &str = "inactivity-timeout-seconds";

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_identity_args(command);
    let command = with_secret_args(command);
    with_session_args(command)
}

fn with_identity_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_IDENTITY_URL)
                .long(ARG_IDENTITY_URL)
                .help("Identity provider base URL; credentials are posted to <url>/verify")
                .env("VESTIBULE_IDENTITY_URL")
                .required(true),
        )
        .arg(
            Arg::new(ARG_IDENTITY_TIMEOUT)
                .long(ARG_IDENTITY_TIMEOUT)
                .help("Identity provider request timeout in seconds")
                .env("VESTIBULE_IDENTITY_TIMEOUT_SECONDS")
                .default_value("5")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_FRONTEND_BASE_URL)
                .long(ARG_FRONTEND_BASE_URL)
                .help("Admin front-end URL; its origin is the only one CORS admits")
                .env("VESTIBULE_FRONTEND_BASE_URL")
                .default_value("https://admin.example.com"),
        )
}

fn with_secret_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SESSION_SECRET)
                .long(ARG_SESSION_SECRET)
                .help("HMAC key for session ids, at least 32 bytes")
                .env("VESTIBULE_SESSION_SECRET")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_CSRF_SECRET)
                .long(ARG_CSRF_SECRET)
                .help("HMAC key for CSRF tokens, at least 32 bytes and distinct from the session secret")
                .env("VESTIBULE_CSRF_SECRET")
                .hide_env_values(true)
                .required(true),
        )
}

fn with_session_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SESSION_TTL)
                .long(ARG_SESSION_TTL)
                .help("Absolute session lifetime in seconds")
                .env("VESTIBULE_SESSION_TTL_SECONDS")
                .default_value("86400")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_REMEMBER_ME_TTL)
                .long(ARG_REMEMBER_ME_TTL)
                .help("Absolute session lifetime with remember-me, in seconds")
                .env("VESTIBULE_REMEMBER_ME_TTL_SECONDS")
                .default_value("604800")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_INACTIVITY_TIMEOUT)
                .long(ARG_INACTIVITY_TIMEOUT)
                .help("Idle time in seconds after which a session ends")
                .env("VESTIBULE_INACTIVITY_TIMEOUT_SECONDS")
                .default_value("86400")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
}

pub struct Options {
    pub identity_url: String,
    pub identity_timeout_seconds: u64,
    pub frontend_base_url: String,
    pub session_secret: SecretString,
    pub csrf_secret: SecretString,
    pub session_ttl_seconds: i64,
    pub remember_me_ttl_seconds: i64,
    pub inactivity_timeout_seconds: i64,
}

impl Options {
    /// # Errors
    /// Returns an error if a required argument is missing.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let required = |name: &str| {
            matches
                .get_one::<String>(name)
                .cloned()
                .with_context(|| format!("missing required argument: --{name}"))
        };
        let seconds = |name: &str, default: i64| matches.get_one::<i64>(name).copied().unwrap_or(default);

        Ok(Self {
            identity_url: required(ARG_IDENTITY_URL)?,
            identity_timeout_seconds: matches
                .get_one::<u64>(ARG_IDENTITY_TIMEOUT)
                .copied()
                .unwrap_or(5),
            frontend_base_url: required(ARG_FRONTEND_BASE_URL)?,
            session_secret: SecretString::from(required(ARG_SESSION_SECRET)?),
            csrf_secret: SecretString::from(required(ARG_CSRF_SECRET)?),
            session_ttl_seconds: seconds(ARG_SESSION_TTL, 86_400),
            remember_me_ttl_seconds: seconds(ARG_REMEMBER_ME_TTL, 604_800),
            inactivity_timeout_seconds: seconds(ARG_INACTIVITY_TIMEOUT, 86_400),
        })
    }

    /// Cookies are `Secure` unless the front end is served over plain HTTP.
    #[must_use]
    pub fn secure_cookies(&self) -> bool {
        !self.frontend_base_url.trim().to_lowercase().starts_with("http://")
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("identity_url", &self.identity_url)
            .field("identity_timeout_seconds", &self.identity_timeout_seconds)
            .field("frontend_base_url", &self.frontend_base_url)
            .field("session_secret", &"[redacted]")
            .field("csrf_secret", &"[redacted]")
            .field("session_ttl_seconds", &self.session_ttl_seconds)
            .field("remember_me_ttl_seconds", &self.remember_me_ttl_seconds)
            .field("inactivity_timeout_seconds", &self.inactivity_timeout_seconds)
            .finish()
    }
}
