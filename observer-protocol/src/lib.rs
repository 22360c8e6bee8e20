//! Wire contract shared by every node in the observer tree.
//!
//! Every node in the tree runs the same binary, so "shared" here means
//! "the JSON shapes that cross an HTTP hop between two nodes, or between
//! a node and the external client" rather than a separate client/server
//! split. Keeping them in their own crate still pays off: the supervisor,
//! the delegation router and the settlement adapter all serialize and
//! deserialize exactly these types, and a single definition keeps a
//! PATCH encoded at a child identical to one decoded at the root.

use serde::{Deserialize, Serialize};

/// Seconds between offline retries of a watcher subprocess.
pub const WAIT_DELAY_SECS: u64 = 30;
/// Maximum total time (seconds) a stream may spend retrying an offline stream
/// before it is abandoned. `WAIT_MAX_SECS / WAIT_DELAY_SECS` is the retry cap.
pub const WAIT_MAX_SECS: u64 = 360;
/// Default minimum number of verdict lines before a result is trusted.
pub const DEFAULT_QUORUM: usize = 5;
/// Default window (seconds), starting at the first verdict, after which the
/// supervisor stops reading regardless of how many verdicts it has.
pub const DEFAULT_DELTA_SECS: u64 = 10;
/// Grace period between a graceful TERM and a forceful KILL of a watcher
/// subprocess.
pub const KILL_GRACE_SECS: u64 = 3;

/// `state` ∈ {`waiting`, `watching`, `found`, `failed`} on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Waiting,
    Watching,
    Found,
    Failed,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StreamState::Waiting => "waiting",
            StreamState::Watching => "watching",
            StreamState::Found => "found",
            StreamState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The canonical winner of a stream, as decided by the supervisor and
/// carried across every PATCH hop up to the root.
///
/// `Failed` means the watcher never produced a trustworthy verdict (the
/// subprocess died with no lines, or the stream stayed offline past the
/// retry cap); it is not a gameplay outcome and the settlement adapter
/// treats it specially.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    Creator,
    Opponent,
    Draw,
    Failed,
}

impl Winner {
    /// Inverts `Creator`/`Opponent` for a reversed supplementary game;
    /// `Draw` and `Failed` are unaffected.
    pub fn invert(self) -> Winner {
        match self {
            Winner::Creator => Winner::Opponent,
            Winner::Opponent => Winner::Creator,
            other => other,
        }
    }
}

impl std::fmt::Display for Winner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Winner::Creator => "creator",
            Winner::Opponent => "opponent",
            Winner::Draw => "draw",
            Winner::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Body of `PUT /streams/{handle}/{gametype}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PutStreamRequest {
    pub game_id: i64,
    pub creator: String,
    pub opponent: String,
}

/// Body of `PATCH /streams/{handle}/{gametype}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PatchStreamRequest {
    pub winner: Winner,
    pub timestamp: f64,
}

/// Response to a successful PATCH once it reaches the root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchStreamResponse {
    pub success: bool,
}

/// Response to a successful DELETE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteStreamResponse {
    pub deleted: bool,
}

/// Serialized view of a stream row, as returned by GET and embedded in a
/// PUT response. `supplementary_games` is comma-joined signed integers
/// (`"10,-20,5"`) to match the wire shape the original observer used for
/// its `game_ids_supplementary` column; other nodes re-parse it rather
/// than re-deriving it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamView {
    pub handle: String,
    pub gametype: String,
    pub game_id: i64,
    #[serde(default)]
    pub supplementary_games: String,
    pub state: StreamState,
    pub creator: String,
    pub opponent: String,
    #[serde(default)]
    pub child: Option<String>,
}

/// Response to `GET /streams` (no handle/gametype segment): the full
/// local listing, used for debugging and operations, never forwarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamListResponse {
    pub streams: Vec<StreamView>,
}

/// Response to `GET /load`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadResponse {
    pub total: f64,
    pub current_streams: u64,
    pub max_streams: u64,
}

/// `{error_code, error, ...}` envelope used for every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error_code: u16,
    pub error: String,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Encodes the signed supplementary-game list into its wire form.
pub fn encode_supplementary(games: &[i64]) -> String {
    games
        .iter()
        .map(|g| g.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Parses the wire form back into signed game ids, skipping empty entries.
pub fn parse_supplementary(raw: &str) -> Vec<i64> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn winner_invert_flips_only_sides() {
        assert_eq!(Winner::Creator.invert(), Winner::Opponent);
        assert_eq!(Winner::Opponent.invert(), Winner::Creator);
        assert_eq!(Winner::Draw.invert(), Winner::Draw);
        assert_eq!(Winner::Failed.invert(), Winner::Failed);
    }

    #[test]
    fn supplementary_round_trips() {
        let games = vec![10, -20, 5];
        let encoded = encode_supplementary(&games);
        assert_eq!(encoded, "10,-20,5");
        assert_eq!(parse_supplementary(&encoded), games);
    }

    #[test]
    fn parse_supplementary_skips_empty() {
        assert_eq!(parse_supplementary(""), Vec::<i64>::new());
        assert_eq!(parse_supplementary("7"), vec![7]);
    }

    #[test]
    fn winner_serializes_lower_snake() {
        let s = serde_json::to_string(&Winner::Creator).unwrap();
        assert_eq!(s, "\"creator\"");
        let s = serde_json::to_string(&Winner::Failed).unwrap();
        assert_eq!(s, "\"failed\"");
    }
}
