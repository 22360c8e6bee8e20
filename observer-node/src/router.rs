//! The delegation router: the PUT/GET/PATCH/DELETE protocol every node in
//! the tree serves, identically, at `/streams/{handle}/{gametype}`, plus
//! the `/streams` debug listing and the `/load` aggregation endpoint.
//! "Master" is simply the node whose `parent` is unset — every routing
//! rule below runs the same way at every depth of the tree.

use std::sync::Arc;

use axum::extract::{Form, Path, State};
use axum::http::StatusCode;
use axum::Json;
use observer_protocol::{
    DeleteStreamResponse, LoadResponse, PatchStreamRequest, PatchStreamResponse, PutStreamRequest,
    StreamListResponse, StreamState, StreamView,
};

use crate::adapter;
use crate::config::NodeConfig;
use crate::error::ApiError;
use crate::state::AppState;
use crate::store::Stream;

/// Looks up a configured child's base URL by name. A row pointing at a
/// name no longer in configuration indicates an operator error (config
/// changed without a restart, which §4.1 explicitly doesn't support) —
/// surfaced as an internal error rather than panicking.
fn child_url<'a>(config: &'a NodeConfig, name: &str) -> Result<&'a str, ApiError> {
    config
        .children
        .iter()
        .find(|c| c.name == name)
        .map(|c| c.url.as_str())
        .ok_or_else(|| ApiError::Internal(format!("child '{name}' is not in this node's configuration")))
}

/// Decides the signed supplementary-game entry a merge PUT contributes,
/// or rejects it with 409 if the incoming players don't match the
/// existing stream in either orientation. See §4.5 step 2.
fn merge_entry(existing: &Stream, body: &PutStreamRequest) -> Result<i64, ApiError> {
    let (creator, opponent) = (existing.creator_lower(), existing.opponent_lower());
    let (incoming_creator, incoming_opponent) =
        (body.creator.to_lowercase(), body.opponent.to_lowercase());

    if incoming_creator == creator && incoming_opponent == opponent {
        Ok(body.game_id)
    } else if incoming_creator == opponent && incoming_opponent == creator {
        Ok(-body.game_id)
    } else {
        Err(ApiError::Conflict(
            "incoming players do not match the existing stream's creator/opponent".into(),
        ))
    }
}

/// `GET /streams` — the full local listing, debug/ops use only. Never
/// forwarded to children and not part of the delegation protocol proper.
pub async fn list_streams(State(state): State<Arc<AppState>>) -> Json<StreamListResponse> {
    let streams = state.store.iterate_all().await.into_iter().map(|s| s.to_view()).collect();
    Json(StreamListResponse { streams })
}

/// `GET /streams/{handle}/{gametype}` — forwards verbatim if this node
/// delegated the stream to a child, otherwise returns its own row.
pub async fn get_stream(
    State(state): State<Arc<AppState>>,
    Path((handle, gametype)): Path<(String, String)>,
) -> Result<Json<StreamView>, ApiError> {
    let stream = state.store.find(&handle, &gametype).await.ok_or(ApiError::NotFound)?;
    if let Some(child_name) = &stream.child {
        let url = child_url(&state.config, child_name)?;
        let view = state.peers.get(url, &handle, &gametype).await?;
        return Ok(Json(view));
    }
    Ok(Json(stream.to_view()))
}

/// `PUT /streams/{handle}/{gametype}` — create-or-merge a stream, trying
/// downstream delegation before running it locally. See §4.5.
pub async fn put_stream(
    State(state): State<Arc<AppState>>,
    Path((handle, gametype)): Path<(String, String)>,
    Form(body): Form<PutStreamRequest>,
) -> Result<(StatusCode, Json<StreamView>), ApiError> {
    let new_row = {
        let handle = handle.clone();
        let gametype = gametype.clone();
        let body = body.clone();
        move || Stream {
            handle,
            gametype,
            game_id: body.game_id,
            supplementary_games: Vec::new(),
            state: StreamState::Waiting,
            creator: body.creator,
            opponent: body.opponent,
            child: None,
        }
    };
    let merge_body = body.clone();

    let (mut stream, is_new) = state
        .store
        .reserve_or_merge(&handle, &gametype, body.game_id, new_row, move |existing| {
            let entry = merge_entry(existing, &merge_body)?;
            existing.supplementary_games.push(entry);
            Ok(())
        })
        .await?;

    if !is_new {
        if let Some(child_name) = stream.child.clone() {
            let url = child_url(&state.config, &child_name)?;
            state
                .peers
                .try_put(url, &handle, &gametype, &body)
                .await
                .ok_or_else(|| ApiError::Internal("child declined or was unreachable during merge".into()))?;
        }
        return Ok((StatusCode::OK, Json(stream.to_view())));
    }

    for child in &state.config.children {
        if let Some((_status, _view)) = state.peers.try_put(&child.url, &handle, &gametype, &body).await {
            stream.child = Some(child.name.clone());
            state.store.update(stream.clone()).await?;
            return Ok((StatusCode::CREATED, Json(stream.to_view())));
        }
    }

    if state.handlers.find(&gametype).is_none() {
        let _ = state.store.delete(&handle, &gametype).await;
        return Err(ApiError::Unsupported);
    }

    // Capacity check and pool insert happen under one `SupervisorPool`
    // lock acquisition (see `try_spawn`), so two concurrent PUTs can't
    // both observe spare capacity and both spawn past `max_streams`.
    if !state.pool.try_spawn(state.max_streams(), stream.clone(), state.clone()).await {
        let _ = state.store.delete(&handle, &gametype).await;
        return Err(ApiError::Busy);
    }
    Ok((StatusCode::CREATED, Json(stream.to_view())))
}

/// `PATCH /streams/{handle}/{gametype}` — forwards up the tree until it
/// reaches the root, which invokes the settlement adapter and schedules
/// the self-DELETE.
pub async fn patch_stream(
    State(state): State<Arc<AppState>>,
    Path((handle, gametype)): Path<(String, String)>,
    Json(body): Json<PatchStreamRequest>,
) -> Result<Json<PatchStreamResponse>, ApiError> {
    if let Some(parent) = &state.config.parent {
        let response = state.peers.patch(&parent.url, &handle, &gametype, &body).await?;
        return Ok(Json(response));
    }

    let stream = state.store.find(&handle, &gametype).await.ok_or(ApiError::NotFound)?;
    let handler = state
        .handlers
        .find(&stream.gametype)
        .ok_or_else(|| ApiError::Internal("handler missing for a stream that already resolved".into()))?;

    adapter::apply(state.settlement.as_ref(), &stream, handler, body.winner, body.timestamp).await;

    // Fire-and-forget: the DELETE handler would otherwise block waiting
    // on this still-running PATCH handler to release the row. Spawning a
    // fresh task lets the PATCH response return first; see §4.7/§5.
    let background_state = state.clone();
    tokio::spawn(async move {
        if let Err(err) = background_state
            .peers
            .delete(&background_state.config.self_url, &handle, &gametype)
            .await
        {
            tracing::error!(?err, "self-DELETE after settlement failed");
        }
    });

    Ok(Json(PatchStreamResponse { success: true }))
}

/// `DELETE /streams/{handle}/{gametype}` — forwards to the delegated
/// child if any, otherwise aborts the local supervisor, then always
/// removes the local row.
pub async fn delete_stream(
    State(state): State<Arc<AppState>>,
    Path((handle, gametype)): Path<(String, String)>,
) -> Result<Json<DeleteStreamResponse>, ApiError> {
    let stream = state.store.find(&handle, &gametype).await.ok_or(ApiError::NotFound)?;

    if let Some(child_name) = &stream.child {
        let url = child_url(&state.config, child_name)?;
        state.peers.delete(url, &handle, &gametype).await?;
    } else {
        state.pool.abort(&stream.key()).await;
    }

    state.store.delete(&handle, &gametype).await?;
    Ok(Json(DeleteStreamResponse { deleted: true }))
}

/// `GET /load` — the naive, unweighted average described in §4.6/§9: a
/// child that times out contributes 0 to both the numerator and the
/// summed counts, and the denominator only ever counts this node's
/// immediate children, not the whole subtree.
pub async fn load(State(state): State<Arc<AppState>>) -> Json<LoadResponse> {
    let current = state.pool.len().await as u64;
    let max = state.max_streams() as u64;
    let local_load = if max == 0 { 0.0 } else { current as f64 / max as f64 };

    let mut total = local_load;
    let mut current_streams = current;
    let mut max_streams = max;

    for child in &state.config.children {
        if let Some(child_load) = state.peers.get_load(&child.url).await {
            total += child_load.total;
            current_streams += child_load.current_streams;
            max_streams += child_load.max_streams;
        }
    }

    let denominator = (state.config.children.len() + 1) as f64;
    Json(LoadResponse {
        total: total / denominator,
        current_streams,
        max_streams,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn merge_entry_matches_same_order_positively() {
        let existing = Stream {
            handle: "h".into(),
            gametype: "test".into(),
            game_id: 1,
            supplementary_games: vec![],
            state: StreamState::Waiting,
            creator: "Alice".into(),
            opponent: "Bob".into(),
            child: None,
        };
        let body = PutStreamRequest { game_id: 2, creator: "alice".into(), opponent: "bob".into() };
        assert_eq!(merge_entry(&existing, &body).unwrap(), 2);
    }

    #[test]
    fn merge_entry_swapped_order_is_negative() {
        let existing = Stream {
            handle: "h".into(),
            gametype: "test".into(),
            game_id: 1,
            supplementary_games: vec![],
            state: StreamState::Waiting,
            creator: "Alice".into(),
            opponent: "Bob".into(),
            child: None,
        };
        let body = PutStreamRequest { game_id: 2, creator: "bob".into(), opponent: "alice".into() };
        assert_eq!(merge_entry(&existing, &body).unwrap(), -2);
    }

    #[test]
    fn merge_entry_mismatched_players_conflicts() {
        let existing = Stream {
            handle: "h".into(),
            gametype: "test".into(),
            game_id: 1,
            supplementary_games: vec![],
            state: StreamState::Waiting,
            creator: "Alice".into(),
            opponent: "Bob".into(),
            child: None,
        };
        let body = PutStreamRequest { game_id: 2, creator: "carol".into(), opponent: "dave".into() };
        assert!(matches!(merge_entry(&existing, &body), Err(ApiError::Conflict(_))));
    }
}
