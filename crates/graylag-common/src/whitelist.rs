//! Whitelist matchers and the sources they are built from.
//!
//! A [`WhitelistSet`] is four independent matchers consulted in order:
//! IPv4 networks, IPv6 networks, client-name patterns, recipient
//! patterns. Sets are immutable once built; a reload constructs a fresh
//! set from the configured sources and publishes it wholesale, so readers
//! never observe a half-populated mixture.

use crate::store::{sanitize_url, split_scheme, RedisStore, StoreError};
use cidr::{Cidr, Ipv4Cidr, Ipv6Cidr};
use regex::{Regex, RegexBuilder};
use serde_json::Value;
use std::net::IpAddr;
use thiserror::Error;
use tracing::warn;

/// Name of the redis root list that enumerates the stored whitelists.
pub const REDIS_ROOT_LIST: &str = "whitelists";

/// Errors raised while loading whitelist sources.
///
/// Source failures never abort a reload; they are logged and the source is
/// skipped.
#[derive(Debug, Error)]
pub enum WhitelistError {
    /// File source could not be read.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// File source held malformed JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// Redis source failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The source URL scheme is not a whitelist source.
    #[error("unsupported whitelist source scheme {0:?}")]
    UnsupportedScheme(String),
    /// The document root was not a map of lists.
    #[error("whitelist document root is not an object")]
    BadDocument,
}

/// Which matcher accepted a request; used for logging and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// IPv4 network containment.
    Ipv4Net,
    /// IPv6 network containment.
    Ipv6Net,
    /// Client-name pattern.
    ClientName,
    /// Recipient literal or pattern.
    Recipient,
}

impl MatchKind {
    /// Stable label for metrics and log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ipv4Net => "ipv4_net",
            Self::Ipv6Net => "ipv6_net",
            Self::ClientName => "client_name",
            Self::Recipient => "recipient",
        }
    }
}

/// The four matchers, composed. Replaced only wholesale.
#[derive(Debug, Default)]
pub struct WhitelistSet {
    v4_nets: Vec<Ipv4Cidr>,
    v6_nets: Vec<Ipv6Cidr>,
    client_names: Vec<Regex>,
    recipients: Vec<Regex>,
}

impl WhitelistSet {
    /// Tests a request against the matchers in order, short-circuiting on
    /// the first hit.
    #[must_use]
    pub fn matches(
        &self,
        client_address: IpAddr,
        client_name: &str,
        recipient: &str,
    ) -> Option<MatchKind> {
        match client_address {
            IpAddr::V4(v4) => {
                if self.v4_nets.iter().any(|net| net.contains(&v4)) {
                    return Some(MatchKind::Ipv4Net);
                }
            }
            IpAddr::V6(v6) => {
                if self.v6_nets.iter().any(|net| net.contains(&v6)) {
                    return Some(MatchKind::Ipv6Net);
                }
            }
        }
        if self.client_names.iter().any(|re| re.is_match(client_name)) {
            return Some(MatchKind::ClientName);
        }
        if self.recipients.iter().any(|re| re.is_match(recipient)) {
            return Some(MatchKind::Recipient);
        }
        None
    }

    /// Total number of entries across all four matchers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.v4_nets.len() + self.v6_nets.len() + self.client_names.len() + self.recipients.len()
    }

    /// Whether the set holds no entries at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Accumulates entries from any number of sources into a fresh set.
pub struct WhitelistBuilder {
    allow_regex: bool,
    set: WhitelistSet,
    skipped: usize,
}

impl WhitelistBuilder {
    /// Creates an empty builder. Regex-typed entries are honored only when
    /// `allow_regex` is set.
    #[must_use]
    pub fn new(allow_regex: bool) -> Self {
        Self {
            allow_regex,
            set: WhitelistSet::default(),
            skipped: 0,
        }
    }

    /// Adds a whole JSON document: a top-level map of whitelist-name →
    /// array of entry objects.
    pub fn add_document(&mut self, text: &str) -> Result<(), WhitelistError> {
        let document: Value = serde_json::from_str(text)?;
        let lists = document.as_object().ok_or(WhitelistError::BadDocument)?;
        for (name, entries) in lists {
            let Some(entries) = entries.as_array() else {
                warn!(list = %name, "whitelist is not an array, skipping");
                self.skipped += 1;
                continue;
            };
            for entry in entries {
                self.add_entry(name, entry);
            }
        }
        Ok(())
    }

    /// Adds one entry object. Malformed entries are logged and skipped;
    /// they never abort the reload.
    pub fn add_entry(&mut self, list: &str, entry: &Value) {
        if let Err(reason) = self.try_add_entry(entry) {
            warn!(list = %list, %reason, "skipping whitelist entry");
            self.skipped += 1;
        }
    }

    fn try_add_entry(&mut self, entry: &Value) -> Result<(), String> {
        let kind = field(entry, "type").ok_or("entry has no type")?;
        match kind {
            "ipv4_net" => {
                let net = field(entry, "net").ok_or("ipv4_net entry has no net")?;
                let addr = net.parse().map_err(|_| format!("bad ipv4 address {net:?}"))?;
                let mask = mask_field(entry)?;
                let cidr = Ipv4Cidr::new(addr, mask)
                    .map_err(|e| format!("bad ipv4 network {net}/{mask}: {e}"))?;
                self.set.v4_nets.push(cidr);
            }
            "ipv6_net" => {
                let net = field(entry, "net").ok_or("ipv6_net entry has no net")?;
                let addr = net.parse().map_err(|_| format!("bad ipv6 address {net:?}"))?;
                let mask = mask_field(entry)?;
                let cidr = Ipv6Cidr::new(addr, mask)
                    .map_err(|e| format!("bad ipv6 network {net}/{mask}: {e}"))?;
                self.set.v6_nets.push(cidr);
            }
            "recipient_literal" => {
                let recipient =
                    field(entry, "recipient").ok_or("recipient_literal entry has no recipient")?;
                self.set.recipients.push(compile_recipient_literal(recipient)?);
            }
            "recipient_regex" => {
                let pattern = self.regex_field(entry)?;
                self.set.recipients.push(pattern);
            }
            "remote_regex" => {
                let pattern = self.regex_field(entry)?;
                self.set.client_names.push(pattern);
            }
            other => return Err(format!("unknown entry type {other:?}")),
        }
        Ok(())
    }

    fn regex_field(&self, entry: &Value) -> Result<Regex, String> {
        if !self.allow_regex {
            return Err("regex whitelisting is disabled".to_owned());
        }
        let pattern = field(entry, "regex").ok_or("regex entry has no regex")?;
        compile_anchored(pattern).map_err(|e| format!("bad regex {pattern:?}: {e}"))
    }

    /// Finishes the build, returning the immutable set.
    #[must_use]
    pub fn build(self) -> WhitelistSet {
        if self.skipped > 0 {
            warn!(skipped = self.skipped, "whitelist entries were skipped");
        }
        self.set
    }
}

fn field<'a>(entry: &'a Value, name: &str) -> Option<&'a str> {
    entry.get(name).and_then(Value::as_str)
}

/// Masks arrive as JSON numbers from files and as strings from redis
/// hashes; accept both.
fn mask_field(entry: &Value) -> Result<u8, String> {
    let mask = entry.get("mask").ok_or("net entry has no mask")?;
    match mask {
        Value::Number(n) => n.as_u64().and_then(|n| u8::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| format!("bad mask {mask}"))
}

/// Compiles a pattern with anchored-at-start, case-insensitive semantics.
fn compile_anchored(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(&format!("^(?:{pattern})"))
        .case_insensitive(true)
        .build()
}

/// Compiles a literal `user@domain` entry. Either half may be missing and
/// then matches anything; the local part admits a `+extension`.
fn compile_recipient_literal(recipient: &str) -> Result<Regex, String> {
    if recipient.matches('@').count() > 1 {
        return Err(format!("recipient {recipient:?} has multiple '@'"));
    }
    let (user, domain) = recipient.split_once('@').unwrap_or((recipient, ""));
    if user.is_empty() && domain.is_empty() {
        return Err("recipient entry is empty".to_owned());
    }
    let user = if user.is_empty() {
        ".+".to_owned()
    } else {
        regex::escape(user)
    };
    let domain = if domain.is_empty() {
        ".+".to_owned()
    } else {
        regex::escape(domain)
    };
    RegexBuilder::new(&format!("^{user}(?:\\+[^@]+)?@{domain}$"))
        .case_insensitive(true)
        .build()
        .map_err(|e| format!("recipient {recipient:?} did not compile: {e}"))
}

/// Loads one source URL into the builder.
pub async fn load_source(
    builder: &mut WhitelistBuilder,
    url: &str,
) -> Result<(), WhitelistError> {
    let (scheme, rest) = split_scheme(url)?;
    match scheme {
        "file" => {
            let text = tokio::fs::read_to_string(rest).await?;
            builder.add_document(&text)
        }
        "redis-tcp" | "redis-unix" => load_redis_source(builder, url).await,
        other => Err(WhitelistError::UnsupportedScheme(other.to_owned())),
    }
}

/// Reads the importer's layout: a root list `whitelists` naming sub-lists,
/// each sub-list naming entry keys, each entry key a hash of fields.
async fn load_redis_source(
    builder: &mut WhitelistBuilder,
    url: &str,
) -> Result<(), WhitelistError> {
    let store = RedisStore::connect(url).await?;
    for list in store.lrange(REDIS_ROOT_LIST).await? {
        for entry_key in store.lrange(&list).await? {
            let fields = store.hgetall(&entry_key).await?;
            let entry = Value::Object(
                fields
                    .into_iter()
                    .map(|(name, value)| (name, Value::String(value)))
                    .collect(),
            );
            builder.add_entry(&list, &entry);
        }
    }
    Ok(())
}

/// Builds a fresh set from every configured source. A failing source is
/// logged and skipped; the build completes with whatever succeeded.
pub async fn load_sources(urls: &[String], allow_regex: bool) -> WhitelistSet {
    let mut builder = WhitelistBuilder::new(allow_regex);
    for url in urls {
        if let Err(error) = load_source(&mut builder, url).await {
            warn!(source = %sanitize_url(url), %error, "skipping whitelist source");
        }
    }
    builder.build()
}
