//! Sibling ACL: resolves configured peer hostnames to IPs once at startup
//! and rejects any inbound request whose address isn't in that set.
//!
//! Mirrors the teacher's `before_request` hook in shape (a single gate
//! every request passes through before reaching a handler), implemented
//! as an axum middleware instead of a Flask `before_request`.

use std::collections::HashSet;
use std::net::IpAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::Response;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::ApiError;

/// The resolved set of IPs allowed to talk to this node: every configured
/// sibling (children, parent) plus localhost, as A/AAAA records looked up
/// once at startup. Re-resolution at runtime is not supported — operators
/// restart the node after a topology change.
#[derive(Debug, Clone)]
pub struct SiblingAcl {
    allowed: HashSet<IpAddr>,
}

impl SiblingAcl {
    /// Resolves every host in `hosts` and unions the results into the
    /// allow-set. A host that fails to resolve is logged and skipped —
    /// it simply means requests claiming to originate from it will be
    /// rejected, which is the safe default.
    pub async fn resolve(hosts: &[String]) -> Self {
        let mut allowed = HashSet::new();
        for host in hosts {
            match tokio::net::lookup_host((host.as_str(), 0)).await {
                Ok(addrs) => {
                    for addr in addrs {
                        allowed.insert(addr.ip());
                    }
                }
                Err(err) => {
                    tracing::warn!(host, ?err, "failed to resolve sibling host");
                }
            }
        }
        tracing::info!(allowed = ?allowed, "sibling ACL resolved");
        SiblingAcl { allowed }
    }

    pub fn is_allowed(&self, ip: &IpAddr) -> bool {
        self.allowed.contains(ip)
    }
}

/// Determines the address a request should be checked against: the
/// `X-Real-IP` header if present and parseable, else the transport peer.
fn remote_addr(headers: &HeaderMap, transport_peer: IpAddr) -> IpAddr {
    headers
        .get("X-Real-IP")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<IpAddr>().ok())
        .unwrap_or(transport_peer)
}

/// Axum middleware rejecting any request whose effective remote address
/// is not in the sibling ACL, with a 403 before the request reaches
/// routing proper.
pub async fn restrict_siblings(
    State(acl): State<Arc<SiblingAcl>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let addr = remote_addr(request.headers(), peer.ip());
    if !acl.is_allowed(&addr) {
        tracing::debug!(%addr, "attempt to request from unknown address");
        return Err(ApiError::Forbidden);
    }
    Ok(next.run(request).await)
}
