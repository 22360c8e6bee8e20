//! Startup reconciliation: reattaches every locally-owned, in-flight
//! supervisor after a restart, since [`crate::supervisor::SupervisorPool`]
//! itself is purely in-memory and the persisted store is all that
//! survives a crash.
//!
//! Mirrors the teacher's `lobby::reload_config` in spirit — reconcile
//! in-memory runtime state against what was last durably known — but
//! runs once at startup rather than on a reload signal, since topology
//! and handler config are both load-once (see [`crate::config`]).

use std::sync::Arc;

use observer_protocol::StreamState;

use crate::state::AppState;
use crate::supervisor;

/// Walks every row this node owns and restores runtime state to match
/// what the store says should be happening:
///
/// - `waiting`/`watching` with no delegated child: this node owns an
///   in-flight watch with no supervisor task running for it (the
///   process just restarted) — respawn one.
/// - `waiting`/`watching` with a delegated child: the child node is
///   responsible for its own recovery; there is nothing to do here.
/// - `found`/`failed`: the self-PATCH either never ran or never
///   completed before the crash. The row is terminal and settlement
///   can't be re-attempted from a stale in-memory supervisor, so it is
///   simply dropped — an operator PUTting the same handle again starts
///   a fresh stream.
pub async fn recover(state: &Arc<AppState>) {
    for stream in state.store.iterate_all().await {
        match (stream.state, &stream.child) {
            (StreamState::Waiting | StreamState::Watching, None) => {
                tracing::info!(
                    handle = %stream.handle,
                    gametype = %stream.gametype,
                    "reattaching supervisor for in-flight stream found at startup"
                );
                state.pool.spawn(stream, state.clone()).await;
            }
            (StreamState::Waiting | StreamState::Watching, Some(child)) => {
                tracing::debug!(
                    handle = %stream.handle,
                    gametype = %stream.gametype,
                    child,
                    "in-flight stream delegated to a child, no local recovery needed"
                );
            }
            (StreamState::Found | StreamState::Failed, _) => {
                tracing::warn!(
                    handle = %stream.handle,
                    gametype = %stream.gametype,
                    "dropping stale resolved row left over from before restart"
                );
                let _ = state.store.delete(&stream.handle, &stream.gametype).await;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::acl::SiblingAcl;
    use crate::config::NodeConfig;
    use crate::handlers::HandlerRegistry;
    use crate::peer_client::PeerClient;
    use crate::store::{Stream, StreamStore};
    use crate::supervisor::SupervisorPool;
    use std::collections::HashMap;

    fn config() -> NodeConfig {
        NodeConfig {
            self_url: "http://127.0.0.1:1".into(),
            bind_addr: "127.0.0.1:0".into(),
            max_streams: 4,
            parent: None,
            children: vec![],
            settlement_webhook: None,
            handlers: HashMap::new(),
        }
    }

    fn stream(handle: &str, game_id: i64, state: StreamState, child: Option<String>) -> Stream {
        Stream {
            handle: handle.into(),
            gametype: "test".into(),
            game_id,
            supplementary_games: vec![],
            state,
            creator: "a".into(),
            opponent: "b".into(),
            child,
        }
    }

    async fn build_state(rows: Vec<Stream>) -> Arc<AppState> {
        let config = config();
        let store = StreamStore::load(None).await.unwrap();
        for row in rows {
            store.insert(row).await.unwrap();
        }
        Arc::new(AppState {
            handlers: HandlerRegistry::from_config(&config),
            store,
            pool: SupervisorPool::default(),
            acl: Arc::new(SiblingAcl::resolve(&[]).await),
            peers: PeerClient::default(),
            settlement: Box::new(crate::adapter::test_support::Recorder::default()),
            config,
        })
    }

    #[tokio::test]
    async fn respawns_locally_owned_in_flight_streams() {
        let state = build_state(vec![stream("a", 1, StreamState::Waiting, None)]).await;
        recover(&state).await;
        assert_eq!(state.pool.len().await, 1);
        assert!(state.store.find("a", "test").await.is_some());
    }

    #[tokio::test]
    async fn leaves_delegated_streams_alone() {
        let state = build_state(vec![stream("a", 1, StreamState::Watching, Some("child-a".into()))]).await;
        recover(&state).await;
        assert_eq!(state.pool.len().await, 0);
        assert!(state.store.find("a", "test").await.is_some());
    }

    #[tokio::test]
    async fn drops_stale_resolved_rows() {
        let state = build_state(vec![
            stream("a", 1, StreamState::Found, None),
            stream("b", 2, StreamState::Failed, None),
        ])
        .await;
        recover(&state).await;
        assert_eq!(state.pool.len().await, 0);
        assert!(state.store.find("a", "test").await.is_none());
        assert!(state.store.find("b", "test").await.is_none());
    }
}
