//! Resolution of the caller's address from the request headers.
//!
//! Reverse proxies and CDNs each have their own header for the original client
//! address, so every known source is pooled into a single candidate list. IPv6
//! candidates win over IPv4 ones, as the Conversions API matches more events
//! when given the more specific address of a dual-stack client.

use std::net::SocketAddr;

use axum::http::HeaderMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// Header sources, in priority order. The transport address comes last.
pub const CLIENT_IP_HEADERS: [&str; 3] = ["cf-connecting-ip", "x-real-ip", "x-forwarded-for"];

pub const UNKNOWN_ADDRESS: &str = "unknown";

static IPV4_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]{1,3}(\.[0-9]{1,3}){3}$").expect("invalid ipv4 pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IpFamily {
    #[serde(rename = "IPv4")]
    V4,
    #[serde(rename = "IPv6")]
    V6,
    #[serde(rename = "unknown")]
    Unknown,
}

impl IpFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            IpFamily::V4 => "IPv4",
            IpFamily::V6 => "IPv6",
            IpFamily::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientContext {
    pub address: String,
    pub family: IpFamily,
}

pub fn resolve(headers: &HeaderMap, remote: Option<SocketAddr>) -> ClientContext {
    classify(&candidates(headers, remote))
}

/// Collects every candidate address, keeping the header priority order.
pub fn candidates(headers: &HeaderMap, remote: Option<SocketAddr>) -> Vec<String> {
    let mut candidates: Vec<String> = CLIENT_IP_HEADERS
        .iter()
        .flat_map(|name| headers.get_all(*name))
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|candidate| !candidate.is_empty())
        .map(String::from)
        .collect();

    if let Some(remote) = remote {
        candidates.push(remote.ip().to_canonical().to_string());
    }

    candidates
}

pub fn classify(candidates: &[String]) -> ClientContext {
    if let Some(address) = candidates.iter().find(|c| is_ipv6(c)) {
        return ClientContext {
            address: address.clone(),
            family: IpFamily::V6,
        };
    }

    if let Some(address) = candidates.iter().find(|c| is_ipv4(c)) {
        return ClientContext {
            address: address.clone(),
            family: IpFamily::V4,
        };
    }

    ClientContext {
        address: candidates
            .first()
            .cloned()
            .unwrap_or_else(|| UNKNOWN_ADDRESS.to_string()),
        family: IpFamily::Unknown,
    }
}

fn is_ipv6(candidate: &str) -> bool {
    candidate.contains(':')
}

fn is_ipv4(candidate: &str) -> bool {
    IPV4_PATTERN.is_match(candidate)
}
