//! Sender and remote normalization, and store key derivation.
//!
//! The greylist identifies a delivery attempt by the tuple
//! (sender network, cleaned sender, recipient); the auto-whitelist by the
//! sender network alone. Both keys are case-folded and, when hashing is
//! enabled, replaced by their hex SHA-1 so arbitrary addresses cannot grow
//! unbounded keys in the store.

use cidr::{Ipv4Inet, Ipv6Inet};
use once_cell::sync::Lazy;
use regex::Regex;
use sha1::{Digest, Sha1};
use std::fmt::Write as _;
use std::net::IpAddr;

/// `prvs=TAG=` bounce-address-verification wrapper; TAG is exactly ten
/// alphanumerics.
static PRVS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^prvs=[0-9A-Za-z]{10}=(.*)$").expect("prvs pattern"));

/// An isolated decimal run in a local part, e.g. the `12345` in
/// `bounce-12345-user`. Runs embedded in a word (`user123`) stay put.
static DIGIT_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d+\b").expect("digit pattern"));

/// Renders the network containing `addr` masked to the configured prefix,
/// e.g. `192.0.0.0/20` or `2001:db8::/64`.
///
/// Returns `None` when the mask is longer than the address family allows;
/// callers validate masks at startup, so this only trips on bad config.
#[must_use]
pub fn normalized_remote(addr: IpAddr, v4_mask: u8, v6_mask: u8) -> Option<String> {
    match addr {
        IpAddr::V4(v4) => Ipv4Inet::new(v4, v4_mask)
            .ok()
            .map(|inet| inet.network().to_string()),
        IpAddr::V6(v6) => Ipv6Inet::new(v6, v6_mask)
            .ok()
            .map(|inet| inet.network().to_string()),
    }
}

/// Normalizes a sender address so that per-message wrappers do not defeat
/// greylisting. In order: strip a leading `prvs=TAG=` wrapper (when the TAG
/// is malformed, only the first `=`-delimited field is dropped), strip a
/// `+extension` suffix from the local part, collapse isolated decimal runs
/// in the local part to a single `#`. The domain part is preserved verbatim.
#[must_use]
pub fn cleaned_sender(sender: &str) -> String {
    // A wrapped bounce can itself be wrapped; strip until no wrapper is left
    // so cleaning is idempotent.
    let mut sender = sender;
    while sender.starts_with("prvs=") {
        sender = match PRVS_RE.captures(sender) {
            Some(caps) => caps.get(1).map_or("", |m| m.as_str()),
            None => sender.split_once('=').map_or("", |(_, rest)| rest),
        };
    }

    let (local, domain) = match sender.rsplit_once('@') {
        Some((local, domain)) => (local, Some(domain)),
        None => (sender, None),
    };

    let local = match local.split_once('+') {
        Some((base, _extension)) => base,
        None => local,
    };
    let local = DIGIT_RUN_RE.replace_all(local, "#");

    match domain {
        Some(domain) => format!("{local}@{domain}"),
        None => local.into_owned(),
    }
}

/// Derives the greylist key for one (network, sender, recipient) tuple.
pub fn grey_key(remote: &str, sender: &str, recipient: &str, hash: bool) -> String {
    let key = format!("{remote}/{sender}/{recipient}").to_lowercase();
    if hash {
        hex_sha1(&key)
    } else {
        key
    }
}

/// Derives the auto-whitelist key for one sender network.
pub fn awl_key(remote: &str, hash: bool) -> String {
    let key = remote.to_lowercase();
    if hash {
        hex_sha1(&key)
    } else {
        key
    }
}

fn hex_sha1(input: &str) -> String {
    let digest = Sha1::digest(input.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_remote_masks_to_network() {
        let addr: IpAddr = "192.0.2.44".parse().unwrap();
        assert_eq!(
            normalized_remote(addr, 20, 64).as_deref(),
            Some("192.0.0.0/20")
        );
    }

    #[test]
    fn v6_remote_masks_to_network() {
        let addr: IpAddr = "2001:db8:0:42:dead:beef:0:1".parse().unwrap();
        assert_eq!(
            normalized_remote(addr, 20, 64).as_deref(),
            Some("2001:db8:0:42::/64")
        );
    }

    #[test]
    fn remote_is_stable_within_prefix() {
        let a: IpAddr = "192.0.0.1".parse().unwrap();
        let b: IpAddr = "192.0.15.254".parse().unwrap();
        let c: IpAddr = "192.0.16.1".parse().unwrap();
        assert_eq!(normalized_remote(a, 20, 64), normalized_remote(b, 20, 64));
        assert_ne!(normalized_remote(a, 20, 64), normalized_remote(c, 20, 64));
    }

    #[test]
    fn overlong_mask_is_refused() {
        let addr: IpAddr = "192.0.2.44".parse().unwrap();
        assert_eq!(normalized_remote(addr, 33, 64), None);
    }

    #[test]
    fn prvs_wrapper_is_stripped() {
        assert_eq!(
            cleaned_sender("prvs=1234567890=alice@example.com"),
            "alice@example.com"
        );
        assert_eq!(
            cleaned_sender("prvs=a1B2c3D4e5=alice@example.com"),
            "alice@example.com"
        );
    }

    #[test]
    fn malformed_prvs_drops_first_field_only() {
        // Nine-character tag: not a valid wrapper, shed only "prvs=".
        assert_eq!(
            cleaned_sender("prvs=123456789=alice@example.com"),
            "#=alice@example.com"
        );
    }

    #[test]
    fn extension_suffix_is_stripped() {
        assert_eq!(cleaned_sender("alice+lists@example.com"), "alice@example.com");
        assert_eq!(cleaned_sender("alice+a+b@example.com"), "alice@example.com");
    }

    #[test]
    fn isolated_digit_runs_collapse() {
        assert_eq!(
            cleaned_sender("bounce-12345-alice@example.com"),
            "bounce-#-alice@example.com"
        );
        // Digits attached to a word are not isolated.
        assert_eq!(cleaned_sender("alice123@example.com"), "alice123@example.com");
    }

    #[test]
    fn domain_is_preserved_verbatim() {
        assert_eq!(cleaned_sender("a-99-b@mx99.example.com"), "a-#-b@mx99.example.com");
    }

    #[test]
    fn senders_without_domain_survive() {
        assert_eq!(cleaned_sender("postmaster"), "postmaster");
        assert_eq!(cleaned_sender(""), "");
    }

    #[test]
    fn grey_key_is_case_folded() {
        assert_eq!(
            grey_key("192.0.0.0/20", "Alice@Example.COM", "Bob@ours.test", false),
            "192.0.0.0/20/alice@example.com/bob@ours.test"
        );
    }

    #[test]
    fn hashed_key_is_hex_sha1() {
        let key = grey_key("192.0.0.0/20", "alice@example.com", "bob@ours.test", true);
        assert_eq!(key.len(), 40);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        // Hashing the folded literal must agree with the unhashed form.
        let literal = grey_key("192.0.0.0/20", "alice@example.com", "bob@ours.test", false);
        assert_eq!(key, hex_sha1(&literal));
    }

    #[test]
    fn awl_key_folds_and_hashes() {
        assert_eq!(awl_key("2001:DB8::/64", false), "2001:db8::/64");
        assert_eq!(awl_key("2001:db8::/64", true), hex_sha1("2001:db8::/64"));
    }
}
