//! External-platform adapter: the root-only bridge from a resolved
//! stream's winner to the settlement subsystem. Every other node forwards
//! its PATCH to its parent instead of reaching this module at all (see
//! `router::patch_stream`).
//!
//! The settlement platform is treated as an external collaborator with a
//! narrow, specified interface (§1/§6 of the design doc), modeled here as
//! the [`SettlementClient`] trait rather than an in-process function call
//! — the observer fleet and the settlement platform are separate
//! services. [`HttpSettlementClient`] is the shipped implementation;
//! tests substitute [`test_support::Recorder`].

use async_trait::async_trait;
use observer_protocol::Winner;

use crate::handlers::HandlerKind;
use crate::store::Stream;

/// The settlement subsystem's half of the contract: look up a game by
/// id, and apply a final winner to it. A missing game is not an error —
/// it is logged and that entry is skipped, per §4.7.
#[async_trait]
pub trait SettlementClient: Send + Sync {
    async fn find_game(&self, game_id: i64) -> bool;
    async fn game_done(&self, game_id: i64, winner: Winner, timestamp_secs: i64);
}

/// Applies the §4.7 procedure to every settlement-game this stream
/// touches: the primary `game_id` and each signed supplementary entry,
/// resolving the twitch policy for a `failed` stream and inverting the
/// winner for a reversed (negative) supplementary entry before invoking
/// the settlement callback.
pub async fn apply(
    client: &dyn SettlementClient,
    stream: &Stream,
    handler: &HandlerKind,
    winner: Winner,
    timestamp: f64,
) {
    let timestamp_secs = timestamp as i64;

    resolve_and_invoke(client, stream.game_id, winner, handler, timestamp_secs, false).await;
    for &entry in &stream.supplementary_games {
        resolve_and_invoke(client, entry.abs(), winner, handler, timestamp_secs, entry < 0).await;
    }
}

async fn resolve_and_invoke(
    client: &dyn SettlementClient,
    game_id: i64,
    winner: Winner,
    handler: &HandlerKind,
    timestamp_secs: i64,
    reversed: bool,
) {
    if !client.find_game(game_id).await {
        tracing::warn!(game_id, "settlement game not found, skipping entry");
        return;
    }

    let mut resolved = winner;
    if resolved == Winner::Failed {
        resolved = match handler.twitch {
            2 => Winner::Draw,
            1 => {
                tracing::info!(game_id, "twitch optional: abandoning failed stream to another subsystem");
                return;
            }
            _ => {
                tracing::info!(game_id, "twitch not supported: skipping failed stream");
                return;
            }
        };
    }

    if reversed {
        resolved = resolved.invert();
    }

    client.game_done(game_id, resolved, timestamp_secs).await;
}

/// POSTs to `{base_url}/games/{id}/done` (and GETs `{base_url}/games/{id}`
/// for the lookup). Any non-2xx or transport failure is logged and
/// treated as "that entry didn't settle" — the adapter has already
/// committed to deleting the local row, so retrying is the settlement
/// platform's own problem per the out-of-scope boundary in §1.
pub struct HttpSettlementClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpSettlementClient {
    pub fn new(base_url: String) -> Self {
        HttpSettlementClient { http: reqwest::Client::new(), base_url }
    }
}

#[async_trait]
impl SettlementClient for HttpSettlementClient {
    async fn find_game(&self, game_id: i64) -> bool {
        let url = format!("{}/games/{}", self.base_url, game_id);
        match self.http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                tracing::warn!(game_id, status = %resp.status(), "settlement game lookup failed");
                false
            }
            Err(err) => {
                tracing::warn!(game_id, ?err, "settlement game lookup unreachable");
                false
            }
        }
    }

    async fn game_done(&self, game_id: i64, winner: Winner, timestamp_secs: i64) {
        let url = format!("{}/games/{}/done", self.base_url, game_id);
        let body = serde_json::json!({ "winner": winner, "timestamp": timestamp_secs });
        match self.http.post(&url).json(&body).send().await {
            Ok(resp) if !resp.status().is_success() => {
                tracing::warn!(game_id, status = %resp.status(), "settlement game_done rejected");
            }
            Err(err) => tracing::warn!(game_id, ?err, "settlement game_done unreachable"),
            _ => {}
        }
    }
}

/// A recording fake `SettlementClient` used by tests in this crate (the
/// supervisor's and router's own test modules), matching the pack's habit
/// of keeping side-effecting I/O behind a narrow trait so surrounding
/// logic is unit-testable without a live network.
pub mod test_support {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Call {
        pub game_id: i64,
        pub winner: Winner,
        pub timestamp_secs: i64,
    }

    #[derive(Default)]
    pub struct Recorder {
        pub calls: Mutex<Vec<Call>>,
        /// Game ids `find_game` should report as missing.
        pub missing: Mutex<Vec<i64>>,
    }

    impl Recorder {
        pub async fn calls(&self) -> Vec<Call> {
            self.calls.lock().await.clone()
        }
    }

    #[async_trait]
    impl SettlementClient for Recorder {
        async fn find_game(&self, game_id: i64) -> bool {
            !self.missing.lock().await.contains(&game_id)
        }

        async fn game_done(&self, game_id: i64, winner: Winner, timestamp_secs: i64) {
            self.calls.lock().await.push(Call { game_id, winner, timestamp_secs });
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::Stream;
    use observer_protocol::StreamState;
    use test_support::Recorder;

    fn handler(twitch: u8) -> HandlerKind {
        HandlerKind {
            gametype: "test".into(),
            working_dir: None,
            env_activate: None,
            command_template: "./test.sh".into(),
            quorum: 5,
            delta: std::time::Duration::from_secs(10),
            twitch,
            parser: crate::handlers::Parser::Echo,
        }
    }

    fn stream(supplementary: Vec<i64>) -> Stream {
        Stream {
            handle: "h".into(),
            gametype: "test".into(),
            game_id: 1,
            supplementary_games: supplementary,
            state: StreamState::Found,
            creator: "a".into(),
            opponent: "b".into(),
            child: None,
        }
    }

    #[tokio::test]
    async fn primary_game_gets_the_winner_as_is() {
        let recorder = Recorder::default();
        apply(&recorder, &stream(vec![]), &handler(2), Winner::Creator, 100.0).await;
        let calls = recorder.calls().await;
        assert_eq!(calls, vec![test_support::Call { game_id: 1, winner: Winner::Creator, timestamp_secs: 100 }]);
    }

    #[tokio::test]
    async fn reversed_supplementary_entry_inverts_the_winner() {
        let recorder = Recorder::default();
        apply(&recorder, &stream(vec![-20]), &handler(2), Winner::Creator, 0.0).await;
        let calls = recorder.calls().await;
        assert_eq!(calls[1], test_support::Call { game_id: 20, winner: Winner::Opponent, timestamp_secs: 0 });
    }

    #[tokio::test]
    async fn non_reversed_supplementary_entry_keeps_the_winner() {
        let recorder = Recorder::default();
        apply(&recorder, &stream(vec![20]), &handler(2), Winner::Opponent, 0.0).await;
        let calls = recorder.calls().await;
        assert_eq!(calls[1], test_support::Call { game_id: 20, winner: Winner::Opponent, timestamp_secs: 0 });
    }

    #[tokio::test]
    async fn draw_is_unaffected_by_reversal() {
        let recorder = Recorder::default();
        apply(&recorder, &stream(vec![-20]), &handler(2), Winner::Draw, 0.0).await;
        let calls = recorder.calls().await;
        assert_eq!(calls[1].winner, Winner::Draw);
    }

    #[tokio::test]
    async fn failed_with_mandatory_twitch_coerces_to_draw() {
        let recorder = Recorder::default();
        apply(&recorder, &stream(vec![]), &handler(2), Winner::Failed, 0.0).await;
        assert_eq!(recorder.calls().await[0].winner, Winner::Draw);
    }

    #[tokio::test]
    async fn failed_with_optional_twitch_is_abandoned() {
        let recorder = Recorder::default();
        apply(&recorder, &stream(vec![]), &handler(1), Winner::Failed, 0.0).await;
        assert!(recorder.calls().await.is_empty());
    }

    #[tokio::test]
    async fn failed_with_unsupported_twitch_is_skipped() {
        let recorder = Recorder::default();
        apply(&recorder, &stream(vec![]), &handler(0), Winner::Failed, 0.0).await;
        assert!(recorder.calls().await.is_empty());
    }

    #[tokio::test]
    async fn missing_game_is_skipped_not_fatal() {
        let recorder = Recorder::default();
        recorder.missing.lock().await.push(1);
        apply(&recorder, &stream(vec![]), &handler(2), Winner::Creator, 0.0).await;
        assert!(recorder.calls().await.is_empty());
    }
}
