//! Per-identifier request quotas.
//!
//! Flow Overview:
//! 1) The route class selects a rule (strategy, max, window) from the static `RateLimitTable`.
//! 2) The counter for `identifier + route class` is incremented atomically, then compared.
//!    Increment-then-compare means two concurrent callers can never both see "below limit"
//!    once the combined count exceeds it.
//! 3) Denials and bypasses are audited; plain allowances are not.
//!
//! Strategies:
//! - **Fixed window:** the window opens on the first request and closes `window` later.
//! - **Sliding window:** two aligned buckets; the previous bucket is weighted by how much of
//!   it still overlaps the trailing window.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Duration;
use std::{collections::HashSet, fmt, str::FromStr, sync::Arc};

use super::{
    audit::{AuditAction, AuditEvent, AuditLogger, AuditOutcome, ClientContext},
    clock::{Clock, millis_until},
    counter::CounterStore,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RouteClass {
    Login,
    GeneralApi,
    AdminApi,
}

impl RouteClass {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::GeneralApi => "general_api",
            Self::AdminApi => "admin_api",
        }
    }
}

impl FromStr for RouteClass {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "login" => Ok(Self::Login),
            "general_api" | "general" => Ok(Self::GeneralApi),
            "admin_api" | "admin" => Ok(Self::AdminApi),
            other => Err(format!("unknown route class: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitStrategy {
    FixedWindow,
    SlidingWindow,
}

impl FromStr for RateLimitStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "fixed" | "fixed-window" | "fixed_window" => Ok(Self::FixedWindow),
            "sliding" | "sliding-window" | "sliding_window" => Ok(Self::SlidingWindow),
            other => Err(format!("unknown rate limit strategy: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitRule {
    pub strategy: RateLimitStrategy,
    pub max: u64,
    pub window: Duration,
}

impl RateLimitRule {
    #[must_use]
    pub const fn fixed(max: u64, window: Duration) -> Self {
        Self {
            strategy: RateLimitStrategy::FixedWindow,
            max,
            window,
        }
    }

    #[must_use]
    pub const fn sliding(max: u64, window: Duration) -> Self {
        Self {
            strategy: RateLimitStrategy::SlidingWindow,
            max,
            window,
        }
    }
}

/// One rule per route class; every class always has a rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitTable {
    login: RateLimitRule,
    general_api: RateLimitRule,
    admin_api: RateLimitRule,
}

impl RateLimitTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            login: RateLimitRule::sliding(10, Duration::minutes(15)),
            general_api: RateLimitRule::fixed(100, Duration::seconds(60)),
            admin_api: RateLimitRule::fixed(200, Duration::seconds(60)),
        }
    }

    #[must_use]
    pub fn with_rule(mut self, route: RouteClass, rule: RateLimitRule) -> Self {
        match route {
            RouteClass::Login => self.login = rule,
            RouteClass::GeneralApi => self.general_api = rule,
            RouteClass::AdminApi => self.admin_api = rule,
        }
        self
    }

    #[must_use]
    pub const fn rule(&self, route: RouteClass) -> RateLimitRule {
        match route {
            RouteClass::Login => self.login,
            RouteClass::GeneralApi => self.general_api,
            RouteClass::AdminApi => self.admin_api,
        }
    }

    /// Parse one override in the form `class=strategy:max:window_seconds`.
    ///
    /// # Errors
    /// Returns an error string when any part is missing or malformed.
    pub fn parse_override(value: &str) -> Result<(RouteClass, RateLimitRule), String> {
        let (class, rule) = value
            .split_once('=')
            .ok_or_else(|| format!("expected class=strategy:max:window_seconds, got: {value}"))?;
        let route = class.parse::<RouteClass>()?;
        let mut parts = rule.split(':');
        let strategy = parts
            .next()
            .ok_or_else(|| format!("missing strategy in: {value}"))?
            .parse::<RateLimitStrategy>()?;
        let max = parts
            .next()
            .and_then(|part| part.trim().parse::<u64>().ok())
            .filter(|max| *max > 0)
            .ok_or_else(|| format!("invalid max in: {value}"))?;
        let window_seconds = parts
            .next()
            .and_then(|part| part.trim().parse::<i64>().ok())
            .filter(|seconds| *seconds > 0)
            .ok_or_else(|| format!("invalid window in: {value}"))?;
        if parts.next().is_some() {
            return Err(format!("unexpected trailing fields in: {value}"));
        }
        Ok((
            route,
            RateLimitRule {
                strategy,
                max,
                window: Duration::seconds(window_seconds),
            },
        ))
    }
}

impl Default for RateLimitTable {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed { remaining: u64 },
    Denied { retry_after_ms: u64 },
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count a request for `identifier` on `route` and decide whether it may proceed.
    async fn check(
        &self,
        identifier: &str,
        route: RouteClass,
        client: &ClientContext,
    ) -> Result<RateLimitDecision>;
}

#[derive(Clone, Debug)]
pub struct NoopRateLimiter;

#[async_trait]
impl RateLimiter for NoopRateLimiter {
    async fn check(
        &self,
        _identifier: &str,
        _route: RouteClass,
        _client: &ClientContext,
    ) -> Result<RateLimitDecision> {
        Ok(RateLimitDecision::Allowed {
            remaining: u64::MAX,
        })
    }
}

/// Rate limiter backed by a `CounterStore`.
pub struct CounterRateLimiter {
    store: Arc<dyn CounterStore>,
    table: RateLimitTable,
    bypass: HashSet<String>,
    audit: Arc<AuditLogger>,
    clock: Arc<dyn Clock>,
}

impl CounterRateLimiter {
    #[must_use]
    pub fn new(
        store: Arc<dyn CounterStore>,
        table: RateLimitTable,
        audit: Arc<AuditLogger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            table,
            bypass: HashSet::new(),
            audit,
            clock,
        }
    }

    /// Socket peer addresses (trusted internal callers) that skip limiting. Each use is audited.
    #[must_use]
    pub fn with_bypass<I, S>(mut self, identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bypass.extend(identifiers.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn table(&self) -> &RateLimitTable {
        &self.table
    }

    async fn check_fixed(
        &self,
        identifier: &str,
        route: RouteClass,
        rule: RateLimitRule,
    ) -> Result<RateLimitDecision> {
        let key = format!("rl:{}:{identifier}", route.as_str());
        let value = self.store.increment_and_get(&key, rule.window).await?;
        if value.count <= rule.max {
            Ok(RateLimitDecision::Allowed {
                remaining: rule.max - value.count,
            })
        } else {
            Ok(RateLimitDecision::Denied {
                retry_after_ms: millis_until(self.clock.now(), value.expires_at),
            })
        }
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    async fn check_sliding(
        &self,
        identifier: &str,
        route: RouteClass,
        rule: RateLimitRule,
    ) -> Result<RateLimitDecision> {
        let window_ms = rule.window.num_milliseconds().max(1);
        let now_ms = self.clock.now().timestamp_millis();
        let bucket = now_ms.div_euclid(window_ms);
        let elapsed_ms = now_ms - bucket * window_ms;

        let current_key = format!("rl:{}:{identifier}:{bucket}", route.as_str());
        let previous_key = format!("rl:{}:{identifier}:{}", route.as_str(), bucket - 1);

        // The current bucket must outlive the next window, where it is read as "previous".
        let current = self
            .store
            .increment_and_get(&current_key, rule.window * 2)
            .await?
            .count;
        let previous = self
            .store
            .get(&previous_key)
            .await?
            .map_or(0, |value| value.count);

        let overlap = (window_ms - elapsed_ms) as f64 / window_ms as f64;
        let estimate = previous as f64 * overlap + current as f64;
        let max = rule.max as f64;
        if estimate <= max {
            Ok(RateLimitDecision::Allowed {
                remaining: (max - estimate).floor().max(0.0) as u64,
            })
        } else {
            Ok(RateLimitDecision::Denied {
                retry_after_ms: sliding_retry_after_ms(
                    rule.max, previous, current, elapsed_ms, window_ms,
                ),
            })
        }
    }
}

/// Time until one more request would fit under the sliding estimate.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn sliding_retry_after_ms(
    max: u64,
    previous: u64,
    current: u64,
    elapsed_ms: i64,
    window_ms: i64,
) -> u64 {
    let window = window_ms as f64;
    let wait = if current >= max {
        // Wait for the bucket to roll over; then `current` becomes the decaying previous bucket.
        let until_rollover = (window_ms - elapsed_ms) as f64;
        let room = max.saturating_sub(1) as f64;
        until_rollover + window * (1.0 - room / current as f64)
    } else {
        let room = (max - current - 1) as f64;
        window * (1.0 - room / previous.max(1) as f64) - elapsed_ms as f64
    };
    (wait.ceil().max(1.0)) as u64
}

#[async_trait]
impl RateLimiter for CounterRateLimiter {
    async fn check(
        &self,
        identifier: &str,
        route: RouteClass,
        client: &ClientContext,
    ) -> Result<RateLimitDecision> {
        let rule = self.table.rule(route);
        if let Some(peer) = client.peer.as_deref().filter(|peer| self.bypass.contains(*peer)) {
            self.audit.record(
                AuditEvent::new(AuditAction::RateLimitBypass, AuditOutcome::Success)
                    .client(client)
                    .detail(format!("route={} peer={peer}", route.as_str())),
            );
            return Ok(RateLimitDecision::Allowed {
                remaining: rule.max,
            });
        }
        if rule.max == 0 {
            return Err(anyhow!("rate limit for {} has max=0", route.as_str()));
        }

        let decision = match rule.strategy {
            RateLimitStrategy::FixedWindow => self.check_fixed(identifier, route, rule).await?,
            RateLimitStrategy::SlidingWindow => {
                self.check_sliding(identifier, route, rule).await?
            }
        };

        if let RateLimitDecision::Denied { retry_after_ms } = decision {
            self.audit.record(
                AuditEvent::new(AuditAction::RateLimit, AuditOutcome::Denied)
                    .client(client)
                    .detail(format!(
                        "route={} retry_after_ms={retry_after_ms}",
                        route.as_str()
                    )),
            );
        }
        Ok(decision)
    }
}

impl fmt::Debug for CounterRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterRateLimiter")
            .field("table", &self.table)
            .field("bypass", &self.bypass.len())
            .finish_non_exhaustive()
    }
}
