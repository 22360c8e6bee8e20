//! Static, startup-only configuration.
//!
//! Read once from a TOML file the same way the teacher reads its
//! `GameConfig.json` (a `serde`-typed parse of a file read with
//! `tokio::fs`), generalized from a single hot-reloadable map to the
//! whole node topology plus per-handler overrides.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

/// One configured peer: a delegation target (child) or the upstream (parent).
#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    pub name: String,
    pub url: String,
}

/// Per-gametype overrides of the handler defaults in [`crate::handlers`].
#[derive(Debug, Clone, Deserialize)]
pub struct HandlerOverride {
    /// Working directory to `chdir` into before spawning, relative to the
    /// node's own working directory.
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Optional `VIRTUAL_ENV_DISABLE_PROMPT=1 . {env_activate}/bin/activate;`
    /// prefix prepended to the command.
    #[serde(default)]
    pub env_activate: Option<String>,
    /// Command template; `{handle}` is substituted with the stream handle.
    pub command: String,
    #[serde(default)]
    pub quorum: Option<usize>,
    #[serde(default)]
    pub delta_secs: Option<u64>,
    /// Twitch policy level consulted by the settlement adapter when a
    /// stream fails: 0 = not supported, 1 = optional, 2 = mandatory.
    #[serde(default)]
    pub twitch: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// This node's own externally-reachable base URL; used to build the
    /// self-PATCH and self-DELETE requests the supervisor and adapter issue.
    pub self_url: String,
    /// Address the HTTP server binds to.
    pub bind_addr: String,
    /// Upper bound on the number of streams this node supervises locally.
    pub max_streams: usize,
    #[serde(default)]
    pub parent: Option<PeerConfig>,
    #[serde(default)]
    pub children: Vec<PeerConfig>,
    /// Base URL of the settlement webhook the root adapter posts to.
    #[serde(default)]
    pub settlement_webhook: Option<String>,
    #[serde(default)]
    pub handlers: HashMap<String, HandlerOverride>,
}

impl NodeConfig {
    /// Whether this node is the root of the tree.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// All hostnames (without scheme/port) that belong to configured
    /// peers, in the order the sibling ACL should resolve them: every
    /// child, the parent (if any), and localhost.
    pub fn sibling_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .children
            .iter()
            .filter_map(|c| host_of(&c.url))
            .collect();
        if let Some(parent) = &self.parent {
            if let Some(h) = host_of(&parent.url) {
                hosts.push(h);
            }
        }
        hosts.push("localhost".to_string());
        hosts
    }
}

/// Strips scheme and port off a `scheme://host:port` URL, returning just
/// the host part (or `None` for an empty host, e.g. an unset parent URL).
fn host_of(url: &str) -> Option<String> {
    let without_scheme = url.split("://").next_back().unwrap_or(url);
    let host = without_scheme.split(['/', ':']).next().unwrap_or("");
    if host.is_empty() { None } else { Some(host.to_string()) }
}

pub async fn load(path: &Path) -> anyhow::Result<NodeConfig> {
    let raw = tokio::fs::read_to_string(path).await?;
    let config: NodeConfig = toml::from_str(&raw)?;
    Ok(config)
}
