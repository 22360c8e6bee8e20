//! The stream store: the single source of truth for every row this node
//! owns or has delegated.
//!
//! The teacher reads its game-config JSON with `tokio::fs` + `serde_json`
//! and keeps it in an `RwLock` (see `lobby::reload_config`); we follow the
//! same "plain file, `serde`-typed, loaded into an in-memory map guarded
//! by an async lock" shape, but make it two-way: every mutation is
//! flushed back to disk so a restarted node can reconstruct its table
//! before the recovery pass re-attaches supervisors to it.

use std::collections::HashMap;
use std::path::PathBuf;

use observer_protocol::{StreamState, StreamView, encode_supplementary};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::ApiError;

pub type StreamKey = (String, String);

/// An owned, persistent row. See `StreamView` for its wire projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stream {
    pub handle: String,
    pub gametype: String,
    pub game_id: i64,
    pub supplementary_games: Vec<i64>,
    pub state: StreamState,
    pub creator: String,
    pub opponent: String,
    pub child: Option<String>,
}

impl Stream {
    pub fn key(&self) -> StreamKey {
        (self.handle.clone(), self.gametype.clone())
    }

    pub fn to_view(&self) -> StreamView {
        StreamView {
            handle: self.handle.clone(),
            gametype: self.gametype.clone(),
            game_id: self.game_id,
            supplementary_games: encode_supplementary(&self.supplementary_games),
            state: self.state,
            creator: self.creator.clone(),
            opponent: self.opponent.clone(),
            child: self.child.clone(),
        }
    }

    /// Lower-cased creator/opponent, used for case-insensitive matching
    /// throughout the merge and verdict-parsing logic.
    pub fn creator_lower(&self) -> String {
        self.creator.to_lowercase()
    }
    pub fn opponent_lower(&self) -> String {
        self.opponent.to_lowercase()
    }
}

/// Durable table of streams owned by this node, guarded by a single
/// process-wide lock. Holding that lock for the full read-modify-write of
/// a PUT (rather than just the final insert) is a stronger guarantee than
/// the spec strictly requires (§9 open question on concurrent PUTs): it
/// makes the race impossible to observe instead of merely detecting and
/// rejecting the loser.
pub struct StreamStore {
    rows: Mutex<HashMap<StreamKey, Stream>>,
    persist_path: Option<PathBuf>,
}

impl StreamStore {
    /// Loads the store from `persist_path` if it exists, otherwise starts
    /// empty. Every subsequent mutation is flushed back to that path.
    pub async fn load(persist_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let rows = match &persist_path {
            Some(path) => match tokio::fs::read_to_string(path).await {
                Ok(raw) => serde_json::from_str(&raw)?,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
                Err(err) => return Err(err.into()),
            },
            None => HashMap::new(),
        };
        Ok(StreamStore { rows: Mutex::new(rows), persist_path })
    }

    async fn flush(&self, rows: &HashMap<StreamKey, Stream>) -> anyhow::Result<()> {
        let Some(path) = &self.persist_path else { return Ok(()) };
        let serialized = serde_json::to_string_pretty(rows)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, serialized).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub async fn find(&self, handle: &str, gametype: &str) -> Option<Stream> {
        let rows = self.rows.lock().await;
        rows.get(&(handle.to_string(), gametype.to_string())).cloned()
    }

    pub async fn iterate_all(&self) -> Vec<Stream> {
        let rows = self.rows.lock().await;
        rows.values().cloned().collect()
    }

    pub async fn insert(&self, stream: Stream) -> Result<(), ApiError> {
        let mut rows = self.rows.lock().await;
        if rows.values().any(|s| s.game_id == stream.game_id) {
            return Err(ApiError::Conflict(
                "this game ID is already watched in some other stream".into(),
            ));
        }
        rows.insert(stream.key(), stream);
        self.flush(&rows)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))
    }

    pub async fn update(&self, stream: Stream) -> Result<(), ApiError> {
        let mut rows = self.rows.lock().await;
        rows.insert(stream.key(), stream);
        self.flush(&rows)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))
    }

    /// Atomically finds-or-creates the row for `(handle, gametype)` and
    /// persists the result, holding the single process-wide lock for the
    /// whole decide-then-write sequence. This is what makes the race the
    /// design doc's §9 open question asks about ("concurrent PUT of the
    /// same (handle, gametype)") impossible to observe rather than merely
    /// detected-and-rejected: the loser of the race sees the winner's row
    /// already present and goes through `merge` instead of double-inserting.
    ///
    /// `game_id` uniqueness (against every *other* key) is checked first,
    /// inside the same lock acquisition, per the `game_id is unique per
    /// node` invariant.
    pub async fn reserve_or_merge(
        &self,
        handle: &str,
        gametype: &str,
        game_id: i64,
        make_new: impl FnOnce() -> Stream,
        merge: impl FnOnce(&mut Stream) -> Result<(), ApiError>,
    ) -> Result<(Stream, bool), ApiError> {
        let mut rows = self.rows.lock().await;
        let key = (handle.to_string(), gametype.to_string());
        // Checked against every row including the merge target itself: a
        // `game_id` already sitting as the target's own primary or in its
        // supplementary list is just as much a collision as one on some
        // other stream (the Python original's `filter_by(game_id=...)`
        // matches the merge target too). Without this, re-merging the
        // primary game_id or an already-supplementary one would double up
        // an entry instead of being rejected.
        let collides = rows.values().any(|s| {
            s.game_id == game_id || s.supplementary_games.iter().any(|g| g.abs() == game_id)
        });
        if collides {
            return Err(ApiError::Conflict(
                "this game ID is already watched in some other stream".into(),
            ));
        }

        let is_new = !rows.contains_key(&key);
        let mut stream = if is_new {
            make_new()
        } else {
            rows.get(&key).expect("checked contains_key above").clone()
        };
        if !is_new {
            merge(&mut stream)?;
        }

        rows.insert(key, stream.clone());
        self.flush(&rows)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        Ok((stream, is_new))
    }

    pub async fn delete(&self, handle: &str, gametype: &str) -> Result<bool, ApiError> {
        let mut rows = self.rows.lock().await;
        let removed = rows.remove(&(handle.to_string(), gametype.to_string())).is_some();
        if removed {
            self.flush(&rows)
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?;
        }
        Ok(removed)
    }
}
