//! Signed relay links
//!
//! Relays authenticate requests by a signature over the current unix second.
//! Links are signed right before use and never cached: a reconnect needs a
//! fresh timestamp because relays reject stale ones.

use std::time::{SystemTime, UNIX_EPOCH};

use url::Url;

use crate::crypto::KeyPair;
use crate::error::{Error, Result};

pub const PUBKEY_PARAM: &str = "pubkey";
pub const TIMESTAMP_PARAM: &str = "timestamp";
pub const SIGNATURE_PARAM: &str = "signature";

/// Stamp `link` with `pubkey`, `timestamp` and `signature`
///
/// Existing query parameters are kept, the three signing parameters replace
/// any previous values and the fragment is dropped.
pub fn sign_url(link: &str, key: &KeyPair) -> Result<Url> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::Crypto(format!("system clock before unix epoch: {}", e)))?
        .as_secs();
    sign_url_at(link, key, timestamp)
}

pub(crate) fn sign_url_at(link: &str, key: &KeyPair, timestamp: u64) -> Result<Url> {
    let mut url = Url::parse(link)?;

    let timestamp = timestamp.to_string();
    let signature = key.sign(timestamp.as_bytes())?;

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != PUBKEY_PARAM && k != TIMESTAMP_PARAM && k != SIGNATURE_PARAM)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    url.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair(PUBKEY_PARAM, &key.public_hex())
        .append_pair(TIMESTAMP_PARAM, &timestamp)
        .append_pair(SIGNATURE_PARAM, &hex::encode(signature));
    url.set_fragment(None);

    Ok(url)
}
