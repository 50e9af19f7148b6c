//! DNS over HTTPS
//!
//! Minimal DNS wire format for the two lookups peer resolution needs: URI
//! records pointing at a peer's relay link, and CNAME records whose target
//! spells a public key.

use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tracing::debug;

use crate::crypto::KEY_LEN;
use crate::error::{Error, Result};

pub const TYPE_CNAME: u16 = 5;
pub const TYPE_URI: u16 = 256;
pub const CLASS_IN: u16 = 1;

/// Response code for a name that does not exist
const RCODE_NXDOMAIN: u8 = 3;

const HEADER_LEN: usize = 12;
const MAX_NAME_LEN: usize = 255;
const MAX_LABEL_LEN: usize = 63;
const MAX_POINTER_JUMPS: usize = 32;

const DNS_MESSAGE: &str = "application/dns-message";

/// Default public resolver
pub const DEFAULT_DOH_SERVER: &str = "1.1.1.1";

/// Carries one DNS message to a resolver and back
#[async_trait::async_trait]
pub trait DohTransport: Send + Sync {
    async fn exchange(&self, query: Vec<u8>) -> Result<Vec<u8>>;
}

/// RFC 8484 transport using POST
pub struct HttpsDoh {
    url: String,
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpsDoh {
    /// `server` is a host (`1.1.1.1`) or a full `https://` query URL
    pub fn new(server: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self::with_http_client(server, timeout, http))
    }

    pub fn with_http_client(server: &str, timeout: Duration, http: reqwest::Client) -> Self {
        let url = if server.starts_with("https://") || server.starts_with("http://") {
            server.to_string()
        } else {
            format!("https://{}/dns-query", server)
        };
        Self { url, http, timeout }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl DohTransport for HttpsDoh {
    async fn exchange(&self, query: Vec<u8>) -> Result<Vec<u8>> {
        let resp = self
            .http
            .post(&self.url)
            .header(CONTENT_TYPE, DNS_MESSAGE)
            .header(ACCEPT, DNS_MESSAGE)
            .timeout(self.timeout)
            .body(query)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Protocol(format!("DoH server {} answered {}", self.url, status)));
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

/// Record payloads this crate understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    Uri { priority: u16, weight: u16, target: String },
    Cname(String),
    Other(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub data: RecordData,
}

#[derive(Debug, Clone)]
pub struct Response {
    pub id: u16,
    pub rcode: u8,
    pub answers: Vec<Record>,
}

/// Build a recursive query for `name`
pub fn encode_query(id: u16, name: &str, qtype: u16) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; HEADER_LEN];
    BigEndian::write_u16(&mut buf[0..2], id);
    // Standard query, recursion desired
    BigEndian::write_u16(&mut buf[2..4], 0x0100);
    BigEndian::write_u16(&mut buf[4..6], 1);

    encode_name(name, &mut buf)?;
    let mut tail = [0u8; 4];
    BigEndian::write_u16(&mut tail[0..2], qtype);
    BigEndian::write_u16(&mut tail[2..4], CLASS_IN);
    buf.extend_from_slice(&tail);
    Ok(buf)
}

fn encode_name(name: &str, buf: &mut Vec<u8>) -> Result<()> {
    let start = buf.len();
    for label in name.trim_end_matches('.').split('.') {
        if label.is_empty() {
            return Err(Error::Parse(format!("empty label in domain name {:?}", name)));
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(Error::Parse(format!("label too long in domain name {:?}", name)));
        }
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
    if buf.len() - start > MAX_NAME_LEN {
        return Err(Error::Parse(format!("domain name too long: {:?}", name)));
    }
    Ok(())
}

/// Parse a response message, keeping only the answer section
pub fn decode_response(msg: &[u8]) -> Result<Response> {
    if msg.len() < HEADER_LEN {
        return Err(truncated());
    }
    let id = BigEndian::read_u16(&msg[0..2]);
    let flags = BigEndian::read_u16(&msg[2..4]);
    if flags & 0x8000 == 0 {
        return Err(Error::Protocol("DNS message is not a response".into()));
    }
    let rcode = (flags & 0x000f) as u8;
    let qdcount = BigEndian::read_u16(&msg[4..6]);
    let ancount = BigEndian::read_u16(&msg[6..8]);

    let mut pos = HEADER_LEN;
    for _ in 0..qdcount {
        let (_, next) = read_name(msg, pos)?;
        pos = next + 4;
    }

    let mut answers = Vec::with_capacity(ancount as usize);
    for _ in 0..ancount {
        let (name, next) = read_name(msg, pos)?;
        pos = next;
        let fixed = msg.get(pos..pos + 10).ok_or_else(truncated)?;
        let rtype = BigEndian::read_u16(&fixed[0..2]);
        let class = BigEndian::read_u16(&fixed[2..4]);
        let ttl = BigEndian::read_u32(&fixed[4..8]);
        let rdlen = BigEndian::read_u16(&fixed[8..10]) as usize;
        pos += 10;

        let rdata = msg.get(pos..pos + rdlen).ok_or_else(truncated)?;
        let data = match rtype {
            TYPE_URI => {
                if rdata.len() < 4 {
                    return Err(truncated());
                }
                RecordData::Uri {
                    priority: BigEndian::read_u16(&rdata[0..2]),
                    weight: BigEndian::read_u16(&rdata[2..4]),
                    target: String::from_utf8_lossy(&rdata[4..]).into_owned(),
                }
            }
            TYPE_CNAME => RecordData::Cname(read_name(msg, pos)?.0),
            _ => RecordData::Other(rdata.to_vec()),
        };
        pos += rdlen;

        answers.push(Record { name, rtype, class, ttl, data });
    }

    Ok(Response { id, rcode, answers })
}

/// Read a possibly compressed name; returns it and the offset after it
fn read_name(msg: &[u8], mut pos: usize) -> Result<(String, usize)> {
    let mut name = String::new();
    let mut end = None;
    let mut jumps = 0;

    loop {
        let len = *msg.get(pos).ok_or_else(truncated)? as usize;
        match len & 0xc0 {
            0x00 => {
                if len == 0 {
                    let next = end.unwrap_or(pos + 1);
                    return Ok((name, next));
                }
                let label = msg.get(pos + 1..pos + 1 + len).ok_or_else(truncated)?;
                if !name.is_empty() {
                    name.push('.');
                }
                name.push_str(&String::from_utf8_lossy(label));
                if name.len() > MAX_NAME_LEN {
                    return Err(Error::Protocol("domain name too long".into()));
                }
                pos += 1 + len;
            }
            0xc0 => {
                let low = *msg.get(pos + 1).ok_or_else(truncated)? as usize;
                if end.is_none() {
                    end = Some(pos + 2);
                }
                jumps += 1;
                if jumps > MAX_POINTER_JUMPS {
                    return Err(Error::Protocol("compression loop in domain name".into()));
                }
                pos = ((len & 0x3f) << 8) | low;
            }
            _ => return Err(Error::Protocol("unsupported label type".into())),
        }
    }
}

fn truncated() -> Error {
    Error::Protocol("truncated DNS message".into())
}

async fn query(doh: &dyn DohTransport, name: &str, qtype: u16) -> Result<Response> {
    let id = rand::random::<u16>();
    let msg = encode_query(id, name, qtype)?;
    let resp = decode_response(&doh.exchange(msg).await?)?;

    if resp.id != id {
        return Err(Error::Protocol(format!("DNS response id {} does not match query {}", resp.id, id)));
    }
    if resp.rcode != 0 && resp.rcode != RCODE_NXDOMAIN {
        return Err(Error::Protocol(format!("DNS lookup of {} failed with rcode {}", name, resp.rcode)));
    }
    Ok(resp)
}

/// Target of the first URI record for `name`, `None` if there is none
pub async fn lookup_uri(doh: &dyn DohTransport, name: &str) -> Result<Option<String>> {
    debug!(name, "uri lookup pending");
    let resp = query(doh, name, TYPE_URI).await?;
    let target = resp.answers.into_iter().find_map(|record| match record.data {
        RecordData::Uri { target, .. } => Some(target),
        _ => None,
    });
    debug!(name, found = target.is_some(), "uri lookup successful");
    Ok(target)
}

/// Public key spelled by `name` or by one of its CNAME targets
pub async fn lookup_cname_pubkey(doh: &dyn DohTransport, name: &str) -> Result<[u8; KEY_LEN]> {
    if let Some(key) = pubkey_from_name(name) {
        return Ok(key);
    }

    let resp = query(doh, name, TYPE_CNAME).await?;
    resp.answers
        .iter()
        .find_map(|record| match &record.data {
            RecordData::Cname(target) => pubkey_from_name(target),
            _ => None,
        })
        .ok_or_else(|| Error::NoCnamePubkey(name.to_string()))
}

/// A 32-byte key written as hex across the first two labels
///
/// A single label holds at most 63 characters, so the 64 hex digits are
/// split, e.g. `2.d3c1…441f.example.net`.
pub fn pubkey_from_name(name: &str) -> Option<[u8; KEY_LEN]> {
    let mut labels = name.split('.');
    let joined = format!("{}{}", labels.next()?, labels.next()?);
    if joined.len() != KEY_LEN * 2 {
        return None;
    }
    let mut key = [0u8; KEY_LEN];
    hex::decode_to_slice(joined, &mut key).ok()?;
    Some(key)
}
