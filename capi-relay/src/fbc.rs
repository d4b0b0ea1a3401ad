//! Canonicalization of the `fbc` click identifier.
//!
//! The Conversions API expects `fb.1.<creation unix seconds>.<fbclid>`. Browsers
//! and tag managers send either that form, the bare `fbclid` value, or the raw
//! `fbclid=<value>` query parameter.

use once_cell::sync::Lazy;
use regex::Regex;

static CANONICAL_FBC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^fb\.1\.[0-9]+\.[A-Za-z0-9_-]+$").expect("invalid fbc pattern"));
static BARE_FBCLID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("invalid fbclid pattern"));

const FBCLID_PARAM: &str = "fbclid=";

/// Returns the canonical form of `raw`, or None if it holds no usable click id.
/// `now` is the unix timestamp (seconds) used when the value must be wrapped.
pub fn normalize(raw: &str, now: i64) -> Option<String> {
    let trimmed = raw.trim();

    if CANONICAL_FBC.is_match(trimmed) {
        return Some(trimmed.to_string());
    }

    if BARE_FBCLID.is_match(trimmed) {
        return Some(wrap(trimmed, now));
    }

    trimmed
        .strip_prefix(FBCLID_PARAM)
        .filter(|fbclid| BARE_FBCLID.is_match(fbclid))
        .map(|fbclid| wrap(fbclid, now))
}

fn wrap(fbclid: &str, now: i64) -> String {
    format!("fb.1.{now}.{fbclid}")
}
