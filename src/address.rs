//! Overlay Address Derivation
//!
//! Every peer owns exactly one IPv6 address inside `fdd9:f800::/24`, computed
//! from its public key. No registry is consulted: the same key always yields
//! the same address on every node.

use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;

use crate::crypto::KEY_LEN;
use crate::error::{Error, Result};

/// Reserved overlay network
pub const OVERLAY_NETWORK: Prefix = Prefix {
    addr: Ipv6Addr::new(0xfdd9, 0xf800, 0, 0, 0, 0, 0, 0),
    len: 24,
};

/// Number of digest bytes written into the low end of the address
const DIGEST_LEN: usize = 12;

/// BLAKE2s digest size, used for the XOF root and as expansion leaf length
const BLAKE2S_OUTBYTES: usize = 32;

/// An IPv6 address with a prefix length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Prefix {
    pub addr: Ipv6Addr,
    pub len: u8,
}

impl Prefix {
    pub fn new(addr: Ipv6Addr, len: u8) -> Result<Self> {
        if len > 128 {
            return Err(Error::Parse(format!("prefix length {} out of range", len)));
        }
        Ok(Self { addr, len })
    }

    /// Single host prefix
    pub fn host(addr: Ipv6Addr) -> Self {
        Self { addr, len: 128 }
    }

    /// Same address, different prefix length
    pub fn with_len(self, len: u8) -> Result<Self> {
        Self::new(self.addr, len)
    }

    /// Whether `addr` lies inside this prefix
    pub fn contains(&self, addr: &Ipv6Addr) -> bool {
        if self.len == 0 {
            return true;
        }
        let mask = u128::MAX << (128 - u32::from(self.len));
        (u128::from(self.addr) & mask) == (u128::from(*addr) & mask)
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

impl FromStr for Prefix {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| Error::Parse(format!("missing prefix length in {}", s)))?;
        let addr = addr
            .parse::<Ipv6Addr>()
            .map_err(|e| Error::Parse(format!("{}: {}", s, e)))?;
        let len = len
            .parse::<u8>()
            .map_err(|e| Error::Parse(format!("{}: {}", s, e)))?;
        Self::new(addr, len)
    }
}

/// Derive the overlay address owned by `pubkey`
///
/// The low 12 bytes are the BLAKE2Xs output (XOF length 12) of the key, the
/// high bytes come from [`OVERLAY_NETWORK`].
pub fn derive(pubkey: &[u8]) -> Result<Ipv6Addr> {
    if pubkey.len() != KEY_LEN {
        return Err(Error::InvalidPublicKey(format!(
            "invalid key length: {} (expected {})",
            pubkey.len(),
            KEY_LEN
        )));
    }

    let digest = blake2xs(pubkey);
    let mut octets = OVERLAY_NETWORK.addr.octets();
    octets[16 - DIGEST_LEN..].copy_from_slice(&digest);
    Ok(Ipv6Addr::from(octets))
}

/// Derive the `/128` prefix routed to the owner of `pubkey`
pub fn derive_prefix(pubkey: &[u8]) -> Result<Prefix> {
    derive(pubkey).map(Prefix::host)
}

/// BLAKE2Xs with a fixed 12 byte output and no key
///
/// The XOF length occupies the high bytes of the 48-bit node offset field.
/// A single expansion node (offset 0) covers all 12 bytes.
fn blake2xs(input: &[u8]) -> [u8; DIGEST_LEN] {
    let xof_len = (DIGEST_LEN as u64) << 32;

    let root = blake2s_simd::Params::new()
        .hash_length(BLAKE2S_OUTBYTES)
        .node_offset(xof_len)
        .hash(input);

    let block = blake2s_simd::Params::new()
        .hash_length(DIGEST_LEN)
        .fanout(0)
        .max_depth(0)
        .max_leaf_length(BLAKE2S_OUTBYTES as u32)
        .node_offset(xof_len)
        .inner_hash_length(BLAKE2S_OUTBYTES)
        .hash(root.as_bytes());

    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(block.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{parse_key, KeyPair};
    use std::collections::HashSet;

    #[test]
    fn test_known_address() {
        let pubkey = parse_key("yDEt6rccWlIfDTUTxUCDd7O5DjiONNwIonvcn94UDlI=").unwrap();
        let prefix = derive_prefix(&pubkey).unwrap();
        assert_eq!(prefix.to_string(), "fdd9:f800:b4e8:cb59:95e3:c464:9fff:b8c8/128");
    }

    #[test]
    fn test_derive_is_pure() {
        let kp = KeyPair::generate();
        let first = derive(&kp.public_bytes()).unwrap();
        for _ in 0..10 {
            assert_eq!(derive(&kp.public_bytes()).unwrap(), first);
        }
        assert!(OVERLAY_NETWORK.contains(&first));
    }

    #[test]
    fn test_distinct_keys_distinct_addresses() {
        let mut seen = HashSet::new();
        for _ in 0..256 {
            let kp = KeyPair::generate();
            assert!(seen.insert(derive(&kp.public_bytes()).unwrap()));
        }
    }

    #[test]
    fn test_rejects_wrong_length() {
        assert!(matches!(derive(&[0u8; 31]), Err(Error::InvalidPublicKey(_))));
        assert!(matches!(derive(&[0u8; 33]), Err(Error::InvalidPublicKey(_))));
    }

    #[test]
    fn test_prefix_parse_and_contains() {
        let p: Prefix = "fdd9:f800:1::1/24".parse().unwrap();
        assert_eq!(p.len, 24);
        assert!(p.contains(&"fdd9:f8ff::1".parse().unwrap()));
        assert!(!p.contains(&"fdd9:f900::1".parse().unwrap()));
        assert!("fdd9::/129".parse::<Prefix>().is_err());
        assert!("fdd9::".parse::<Prefix>().is_err());
    }
}
