//! Who is on the other end of the connection.
//!
//! The peer address comes from the accepted socket (`ConnectInfo`). `X-Forwarded-For`
//! is read only when that peer is a configured trusted proxy, walking the list from
//! the right and stopping at the first hop that is not itself a trusted proxy.
//! Everything left of that hop was written by the client and is ignored.

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{HeaderMap, header::USER_AGENT, request::Parts},
};
use ipnetwork::IpNetwork;
use std::{convert::Infallible, net::IpAddr, net::SocketAddr};

use crate::access::ClientContext;

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Networks whose `X-Forwarded-For` header is believed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrustedProxies(Vec<IpNetwork>);

impl TrustedProxies {
    /// Parse CIDR blocks or bare addresses, e.g. `10.0.0.0/8` or `192.0.2.10`.
    ///
    /// # Errors
    /// Returns an error naming the first entry that is not a network or address.
    pub fn parse<I, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        entries
            .into_iter()
            .map(|entry| {
                let entry = entry.as_ref().trim();
                entry
                    .parse::<IpNetwork>()
                    .with_context(|| format!("invalid trusted proxy: {entry}"))
            })
            .collect::<Result<Vec<_>>>()
            .map(Self)
    }

    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.0.iter().any(|network| network.contains(ip))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Client address for rate limiting and auditing.
///
/// `None` only when the transport gave no peer address.
#[must_use]
pub fn resolve_client_ip(
    peer: Option<IpAddr>,
    headers: &HeaderMap,
    trusted: &TrustedProxies,
) -> Option<IpAddr> {
    let peer = peer.map(|ip| ip.to_canonical())?;
    if !trusted.contains(peer) {
        return Some(peer);
    }

    let hops = headers
        .get_all(FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|hop| !hop.is_empty())
        .collect::<Vec<_>>();

    let mut client = peer;
    for hop in hops.into_iter().rev() {
        let Ok(ip) = hop.parse::<IpAddr>() else {
            break;
        };
        client = ip.to_canonical();
        if !trusted.contains(client) {
            break;
        }
    }
    Some(client)
}

/// Request extractor producing the `ClientContext` of the caller.
#[derive(Clone, Debug)]
pub struct Client(pub ClientContext);

#[async_trait]
impl<S> FromRequestParts<S> for Client
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_canonical());
        let trusted = parts
            .extensions
            .get::<TrustedProxies>()
            .cloned()
            .unwrap_or_default();
        let ip = resolve_client_ip(peer, &parts.headers, &trusted);
        let user_agent = parts
            .headers
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        Ok(Self(
            ClientContext::new(ip.map(|ip| ip.to_string()), user_agent)
                .with_peer(peer.map(|ip| ip.to_string())),
        ))
    }
}
