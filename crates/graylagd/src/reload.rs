use crate::server::ServerState;
use graylag_common::whitelist;
use std::sync::Arc;
use tracing::info;

/// Rebuilds the whitelist set from the configured sources and publishes it
/// with a single swap. In-flight requests finish against the set they
/// already loaded; a failing source is skipped, never fatal.
pub async fn reload_whitelists(state: Arc<ServerState>) {
    let set =
        whitelist::load_sources(&state.config.wl_sources, state.config.allow_wl_regex).await;
    let entries = set.len();
    state.whitelist.store(Arc::new(set));
    info!(entries, "whitelists reloaded");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use graylag_common::store;

    async fn state_with_source(dir: &tempfile::TempDir, source: &std::path::Path) -> ServerState {
        let mut config = test_config();
        config.grey_db = format!("sled://{}", dir.path().join("grey").display());
        config.wl_sources = vec![format!("file://{}", source.display())];
        let grey_db = store::open(&config.grey_db).await.unwrap();
        ServerState::new(config, grey_db, None)
    }

    #[tokio::test]
    async fn reload_swaps_the_set_wholesale() {
        let dir = tempfile::tempdir().unwrap();
        let wl_path = dir.path().join("wl.json");
        std::fs::write(
            &wl_path,
            r#"{"default": [{"type": "recipient_literal", "recipient": "@ours.test"}]}"#,
        )
        .unwrap();
        let state = Arc::new(state_with_source(&dir, &wl_path).await);

        assert!(state.whitelist.load().is_empty());
        reload_whitelists(Arc::clone(&state)).await;
        assert_eq!(state.whitelist.load().len(), 1);

        // A reader holding the old snapshot keeps it across the next swap.
        let snapshot = state.whitelist.load_full();
        std::fs::write(
            &wl_path,
            r#"{"default": [
                {"type": "recipient_literal", "recipient": "@ours.test"},
                {"type": "recipient_literal", "recipient": "@theirs.test"}
            ]}"#,
        )
        .unwrap();
        reload_whitelists(Arc::clone(&state)).await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(state.whitelist.load().len(), 2);
    }

    #[tokio::test]
    async fn failing_source_leaves_an_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(state_with_source(&dir, &dir.path().join("missing.json")).await);
        reload_whitelists(Arc::clone(&state)).await;
        assert!(state.whitelist.load().is_empty());
    }
}
