//! The per-request decision state machine.
//!
//! A valid request is classified against the greylist store as new,
//! pending, passing or already seen; whitelisted and malformed requests
//! bypass the state machine entirely and get the neutral verb. Every
//! accepted connection is answered exactly once, and no failure mode
//! escalates beyond the neutral verb, so a broken store never denies
//! legitimate mail.

use crate::config::Config;
use crate::metrics::counters;
use crate::server::ServerState;
use chrono::{Local, TimeZone};
use graylag_common::entry::Entry;
use graylag_common::frame::{Request, Response};
use graylag_common::keys;
use graylag_common::store::StoreError;
use std::net::IpAddr;
use tracing::{debug, warn};

/// Evaluates one request at time `now` (seconds since the epoch).
pub async fn evaluate(state: &ServerState, request: &Request, now: i64) -> Response {
    match decide(state, request, now).await {
        Ok(response) => response,
        Err(error) => {
            counters::store_errors_total();
            warn!(%error, "store failure, answering neutrally");
            Response::dunno()
        }
    }
}

async fn decide(
    state: &ServerState,
    request: &Request,
    now: i64,
) -> Result<Response, StoreError> {
    let config = &state.config;

    if !request.is_valid() {
        warn!("request is not a complete policy request");
        counters::requests_total("invalid");
        return Ok(Response::dunno());
    }
    let client_address = request.client_address().unwrap_or_default();
    let client_name = request.client_name().unwrap_or_default();
    let recipient = request.recipient().unwrap_or_default();

    let Ok(address) = client_address.parse::<IpAddr>() else {
        warn!(client_address, "client address does not parse");
        counters::requests_total("invalid");
        return Ok(Response::dunno());
    };

    // A whitelisted request leaves both stores untouched. The snapshot
    // taken here is immune to a concurrent reload.
    let matched = state.whitelist.load().matches(address, client_name, recipient);
    if let Some(kind) = matched {
        debug!(matcher = kind.as_str(), "request whitelisted");
        counters::whitelist_hits_total(kind.as_str());
        counters::requests_total("whitelisted");
        return Ok(Response::dunno());
    }

    let Some(remote) = keys::normalized_remote(address, config.ipv4_mask, config.ipv6_mask)
    else {
        warn!(%address, "cannot normalize client address");
        counters::requests_total("invalid");
        return Ok(Response::dunno());
    };

    if let Some(awl_db) = &state.awl_db {
        let awl_key = keys::awl_key(&remote, config.hash_keys);
        let trusted = match awl_db.get(&awl_key).await? {
            Some(value) => {
                Entry::decode(&value).is_ok_and(|e| e.count >= config.awl_client_count)
            }
            None => false,
        };
        if trusted {
            debug!(remote = %remote, "sender network is auto-whitelisted");
            counters::whitelist_hits_total("auto");
            counters::requests_total("whitelisted");
            return Ok(Response::dunno());
        }
    }

    let sender = keys::cleaned_sender(request.sender().unwrap_or_default());
    let key = keys::grey_key(&remote, &sender, recipient, config.hash_keys);

    let entry = match state.grey_db.get(&key).await? {
        Some(value) => match Entry::decode(&value) {
            Ok(entry) => Some(entry),
            Err(error) => {
                warn!(%error, "unreadable greylist entry, treating as new");
                None
            }
        },
        None => None,
    };

    let response = match entry {
        None => {
            state
                .grey_db
                .update(&key, &Entry::new(0, now).encode())
                .await?;
            debug!(key = %key, "new tuple recorded");
            counters::requests_total("deferred");
            render_defer(config, config.delay)
        }
        Some(Entry {
            count: 0,
            last_seen,
        }) => {
            // A clock step backward counts as not having waited at all.
            let waited = (now - last_seen).max(0);
            if waited <= config.delay {
                counters::requests_total("deferred");
                render_defer(config, config.delay - waited)
            } else if waited > config.retry_window {
                // The retry came too late; the delay clock starts over and
                // the original first-seen timestamp is lost.
                state
                    .grey_db
                    .update(&key, &Entry::new(0, now).encode())
                    .await?;
                debug!(key = %key, waited, "retry window expired, re-recorded");
                counters::requests_total("deferred");
                render_defer(config, config.delay)
            } else {
                state
                    .grey_db
                    .update(&key, &Entry::new(1, now).encode())
                    .await?;
                bump_auto_whitelist(state, &remote, now).await;
                debug!(key = %key, waited, "tuple passed greylisting");
                counters::requests_total("passed");
                render_prepend(config, waited, now)
            }
        }
        Some(Entry { count, last_seen }) => {
            // last_seen never moves backward, even across a clock step.
            state
                .grey_db
                .update(&key, &Entry::new(count + 1, now.max(last_seen)).encode())
                .await?;
            bump_auto_whitelist(state, &remote, now).await;
            counters::requests_total("seen");
            Response::dunno()
        }
    };
    Ok(response)
}

/// Credits one delivery to the sender network's auto-whitelist entry.
///
/// The count keeps growing past the match threshold. A failed bump only
/// delays trust, so it is logged and the already-made greylist decision
/// stands.
async fn bump_auto_whitelist(state: &ServerState, remote: &str, now: i64) {
    let Some(awl_db) = &state.awl_db else {
        return;
    };
    let key = keys::awl_key(remote, state.config.hash_keys);
    let result = async {
        let hits = match awl_db.get(&key).await? {
            Some(value) => Entry::decode(&value).map(|e| e.count).unwrap_or(0),
            None => 0,
        };
        awl_db.update(&key, &Entry::new(hits + 1, now).encode()).await
    }
    .await;
    if let Err(error) = result {
        warn!(%error, remote = %remote, "auto-whitelist bump failed");
    }
}

fn render_defer(config: &Config, wait: i64) -> Response {
    let text = config.grey_text.replace("{wait}", &wait.max(0).to_string());
    Response::with_arg(&config.grey_action, &text)
}

fn render_prepend(config: &Config, waited: i64, now: i64) -> Response {
    let header = config
        .grey_smtp_header
        .replace("{delay}", &waited.to_string())
        .replace("{hostname}", &config.hostname)
        .replace("{date}", &ctime(now));
    Response::prepend(&header)
}

/// `ctime(3)`-style rendering in local time, e.g. `Sun Jun 20 23:21:05 1993`.
fn ctime(timestamp: i64) -> String {
    Local
        .timestamp_opt(timestamp, 0)
        .single()
        .map(|dt| dt.format("%a %b %e %H:%M:%S %Y").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use graylag_common::store;
    use graylag_common::whitelist::WhitelistBuilder;
    use serde_json::json;

    const DELAY: i64 = 60;

    async fn test_state(awl_client_count: u64) -> (tempfile::TempDir, ServerState) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.delay = DELAY;
        config.awl_client_count = awl_client_count;
        config.grey_db = format!("sled://{}", dir.path().join("grey").display());
        config.awl_db = format!("sled://{}", dir.path().join("awl").display());
        let grey_db = store::open(&config.grey_db).await.unwrap();
        let awl_db = if awl_client_count > 0 {
            Some(store::open(&config.awl_db).await.unwrap())
        } else {
            None
        };
        (dir, ServerState::new(config, grey_db, awl_db))
    }

    fn request(sender: &str, recipient: &str) -> Request {
        Request::from_lines([
            "request=smtpd_access_policy",
            "client_address=192.0.2.44",
            "client_name=mail.example.com",
            &format!("sender={sender}"),
            &format!("recipient={recipient}"),
        ])
        .unwrap()
    }

    fn tuple_key(state: &ServerState) -> String {
        keys::grey_key(
            "192.0.0.0/20",
            "alice@example.com",
            "bob@ours.test",
            state.config.hash_keys,
        )
    }

    async fn stored(state: &ServerState, key: &str) -> Option<String> {
        state.grey_db.get(key).await.unwrap()
    }

    #[tokio::test]
    async fn new_tuple_is_deferred_and_recorded() {
        let (_dir, state) = test_state(0).await;
        let req = request("alice@example.com", "bob@ours.test");

        let response = evaluate(&state, &req, 1000).await;
        assert_eq!(
            response.action(),
            "DEFER_IF_PERMIT Greylisted, please retry in 60 seconds"
        );
        assert_eq!(stored(&state, &tuple_key(&state)).await.as_deref(), Some("0,1000"));
    }

    #[tokio::test]
    async fn retry_after_delay_passes_with_header() {
        let (_dir, state) = test_state(0).await;
        let req = request("alice@example.com", "bob@ours.test");

        evaluate(&state, &req, 1000).await;
        let response = evaluate(&state, &req, 1070).await;

        let expected = format!(
            "PREPEND X-Greylist: delayed 70 seconds at mx.test; {}",
            ctime(1070)
        );
        assert_eq!(response.action(), expected);
        assert_eq!(stored(&state, &tuple_key(&state)).await.as_deref(), Some("1,1070"));
    }

    #[tokio::test]
    async fn passed_tuple_keeps_counting() {
        let (_dir, state) = test_state(0).await;
        let req = request("alice@example.com", "bob@ours.test");

        evaluate(&state, &req, 1000).await;
        evaluate(&state, &req, 1070).await;
        let response = evaluate(&state, &req, 1080).await;

        assert_eq!(response.action(), "DUNNO");
        assert_eq!(stored(&state, &tuple_key(&state)).await.as_deref(), Some("2,1080"));
    }

    #[tokio::test]
    async fn retry_too_soon_reports_remaining_wait() {
        let (_dir, state) = test_state(0).await;
        let req = request("alice@example.com", "bob@ours.test");

        evaluate(&state, &req, 1000).await;
        let response = evaluate(&state, &req, 1030).await;

        assert_eq!(
            response.action(),
            "DEFER_IF_PERMIT Greylisted, please retry in 30 seconds"
        );
        // Too-soon retries do not touch the entry.
        assert_eq!(stored(&state, &tuple_key(&state)).await.as_deref(), Some("0,1000"));
    }

    #[tokio::test]
    async fn expired_retry_window_restarts_the_clock() {
        let (_dir, state) = test_state(0).await;
        let req = request("alice@example.com", "bob@ours.test");

        evaluate(&state, &req, 1000).await;
        let late = 1000 + state.config.retry_window + 1;
        let response = evaluate(&state, &req, late).await;

        assert_eq!(
            response.action(),
            "DEFER_IF_PERMIT Greylisted, please retry in 60 seconds"
        );
        assert_eq!(
            stored(&state, &tuple_key(&state)).await,
            Some(format!("0,{late}"))
        );
    }

    #[tokio::test]
    async fn clock_step_backward_counts_as_no_wait() {
        let (_dir, state) = test_state(0).await;
        let req = request("alice@example.com", "bob@ours.test");

        evaluate(&state, &req, 2000).await;
        let response = evaluate(&state, &req, 1500).await;

        assert_eq!(
            response.action(),
            "DEFER_IF_PERMIT Greylisted, please retry in 60 seconds"
        );
        assert_eq!(stored(&state, &tuple_key(&state)).await.as_deref(), Some("0,2000"));
    }

    #[tokio::test]
    async fn seen_entry_never_moves_last_seen_backward() {
        let (_dir, state) = test_state(0).await;
        let req = request("alice@example.com", "bob@ours.test");
        let key = tuple_key(&state);

        state.grey_db.update(&key, "3,1000").await.unwrap();
        let response = evaluate(&state, &req, 900).await;

        assert_eq!(response.action(), "DUNNO");
        assert_eq!(stored(&state, &key).await.as_deref(), Some("4,1000"));
    }

    #[tokio::test]
    async fn prvs_wrapper_and_extension_share_the_plain_key() {
        let (_dir, state) = test_state(0).await;

        let wrapped = request("prvs=1234567890=alice@example.com", "bob+spam@ours.test");
        evaluate(&state, &wrapped, 1000).await;

        // The sender is cleaned but the recipient keeps its extension.
        let key = keys::grey_key(
            "192.0.0.0/20",
            "alice@example.com",
            "bob+spam@ours.test",
            state.config.hash_keys,
        );
        assert_eq!(stored(&state, &key).await.as_deref(), Some("0,1000"));

        let plain = request("alice@example.com", "bob+spam@ours.test");
        let response = evaluate(&state, &plain, 1070).await;
        assert!(response.action().starts_with("PREPEND X-Greylist: delayed 70 seconds"));
    }

    #[tokio::test]
    async fn whitelisted_recipient_skips_the_state_machine() {
        let (_dir, state) = test_state(0).await;
        let mut builder = WhitelistBuilder::new(false);
        builder.add_entry(
            "test",
            &json!({"type": "recipient_literal", "recipient": "@ours.test"}),
        );
        state.whitelist.store(std::sync::Arc::new(builder.build()));

        let req = request("alice@example.com", "bob@ours.test");
        let response = evaluate(&state, &req, 1000).await;

        assert_eq!(response.action(), "DUNNO");
        // No store write of any kind happened.
        assert_eq!(stored(&state, &tuple_key(&state)).await, None);
        let all = state.grey_db.scan(&|_, _| true).await.unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn invalid_request_is_neutral() {
        let (_dir, state) = test_state(0).await;
        let req = Request::from_lines([
            "request=smtpd_access_policy",
            "client_address=192.0.2.44",
            "client_name=mail.example.com",
            "sender=alice@example.com",
        ])
        .unwrap();
        assert_eq!(evaluate(&state, &req, 1000).await.action(), "DUNNO");
    }

    #[tokio::test]
    async fn unparseable_address_is_neutral() {
        let (_dir, state) = test_state(0).await;
        let req = Request::from_lines([
            "request=smtpd_access_policy",
            "client_address=not-an-ip",
            "client_name=mail.example.com",
            "sender=alice@example.com",
            "recipient=bob@ours.test",
        ])
        .unwrap();
        assert_eq!(evaluate(&state, &req, 1000).await.action(), "DUNNO");
        let all = state.grey_db.scan(&|_, _| true).await.unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn first_pass_credits_the_auto_whitelist() {
        let (_dir, state) = test_state(3).await;
        let req = request("alice@example.com", "bob@ours.test");

        evaluate(&state, &req, 1000).await;
        evaluate(&state, &req, 1070).await;

        let awl_db = state.awl_db.as_ref().unwrap();
        let key = keys::awl_key("192.0.0.0/20", state.config.hash_keys);
        assert_eq!(awl_db.get(&key).await.unwrap().as_deref(), Some("1,1070"));
    }

    #[tokio::test]
    async fn trusted_network_bypasses_greylisting() {
        let (_dir, state) = test_state(2).await;
        let awl_db = state.awl_db.as_ref().unwrap();
        let key = keys::awl_key("192.0.0.0/20", state.config.hash_keys);
        awl_db.update(&key, "2,900").await.unwrap();

        let req = request("alice@example.com", "bob@ours.test");
        let response = evaluate(&state, &req, 1000).await;

        assert_eq!(response.action(), "DUNNO");
        // Neither the greylist nor the trust counter moved.
        assert_eq!(stored(&state, &tuple_key(&state)).await, None);
        assert_eq!(awl_db.get(&key).await.unwrap().as_deref(), Some("2,900"));
    }

    #[tokio::test]
    async fn below_threshold_network_is_still_greylisted() {
        let (_dir, state) = test_state(5).await;
        let awl_db = state.awl_db.as_ref().unwrap();
        let key = keys::awl_key("192.0.0.0/20", state.config.hash_keys);
        awl_db.update(&key, "4,900").await.unwrap();

        let req = request("alice@example.com", "bob@ours.test");
        let response = evaluate(&state, &req, 1000).await;
        assert!(response.action().starts_with("DEFER_IF_PERMIT"));
    }

    #[tokio::test]
    async fn unreadable_entry_is_re_recorded() {
        let (_dir, state) = test_state(0).await;
        let key = tuple_key(&state);
        state.grey_db.update(&key, "garbage").await.unwrap();

        let req = request("alice@example.com", "bob@ours.test");
        let response = evaluate(&state, &req, 1000).await;

        assert!(response.action().starts_with("DEFER_IF_PERMIT"));
        assert_eq!(stored(&state, &key).await.as_deref(), Some("0,1000"));
    }

    #[test]
    fn defer_wait_never_renders_negative() {
        let mut config = test_config();
        config.grey_text = "{wait}".to_owned();
        let response = render_defer(&config, -5);
        assert_eq!(response.action(), "DEFER_IF_PERMIT 0");
    }

    #[test]
    fn ctime_matches_the_classic_layout() {
        let rendered = ctime(1_000_000_000);
        // Weekday, month, day, clock and year with single spaces (the day
        // of month is space-padded below 10).
        assert_eq!(rendered.len(), 24);
        assert_eq!(rendered.matches(':').count(), 2);
    }
}
