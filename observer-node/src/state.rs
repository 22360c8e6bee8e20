//! The application state shared across every axum handler and supervisor
//! task — the same role the teacher's `AppState` (rooms + configs,
//! wrapped in `Arc`) plays, generalized to the observer's store, pool,
//! peer client, handler registry and settlement adapter.

use std::sync::Arc;

use crate::acl::SiblingAcl;
use crate::adapter::SettlementClient;
use crate::config::NodeConfig;
use crate::handlers::HandlerRegistry;
use crate::peer_client::PeerClient;
use crate::store::StreamStore;
use crate::supervisor::SupervisorPool;

pub struct AppState {
    pub config: NodeConfig,
    pub store: StreamStore,
    pub pool: SupervisorPool,
    pub handlers: HandlerRegistry,
    pub acl: Arc<SiblingAcl>,
    pub peers: PeerClient,
    pub settlement: Box<dyn SettlementClient>,
}

impl AppState {
    pub fn max_streams(&self) -> usize {
        self.config.max_streams
    }
}
