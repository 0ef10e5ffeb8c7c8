//! # config
//!
//! why: describe one cluster member: who it is, where it listens, who its peers are
//! relations: loaded by the raft-node binary, wraps raft-core RaftConfig
//! what: NodeConfig, NodeConfigBuilder, json file loading and validation

use raft_core::{NodeId, RaftConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::NodeConfigError;

/// Configuration for a single node process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's id, unique in the cluster
    pub id: NodeId,
    /// Address to bind for inbound raft rpcs (e.g. "127.0.0.1:7101")
    pub listen_addr: String,
    /// Other members: id -> rpc address. An entry for `id` itself is ignored.
    #[serde(default)]
    pub peers: BTreeMap<NodeId, String>,
    /// Directory for meta.json and log.jsonl
    pub data_dir: PathBuf,
    #[serde(default)]
    pub raft: RaftConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: NodeId::from("node-1"),
            listen_addr: "127.0.0.1:7101".to_string(),
            peers: BTreeMap::new(),
            data_dir: PathBuf::from("./raft-data"),
            raft: RaftConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn builder() -> NodeConfigBuilder {
        NodeConfigBuilder::default()
    }

    /// Read and validate a json config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, NodeConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| NodeConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&contents)
    }

    pub fn from_json(json: &str) -> Result<Self, NodeConfigError> {
        let config: NodeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Every member id, self included, sorted
    pub fn cluster(&self) -> Vec<NodeId> {
        let mut members: Vec<NodeId> = self.peers.keys().cloned().collect();
        if !self.peers.contains_key(&self.id) {
            members.push(self.id.clone());
        }
        members.sort();
        members
    }

    pub fn validate(&self) -> Result<(), NodeConfigError> {
        if self.id.as_str().is_empty() {
            return Err(NodeConfigError::MissingId);
        }
        if self.listen_addr.is_empty() {
            return Err(NodeConfigError::MissingListenAddr);
        }
        if let Some((peer, _)) = self.peers.iter().find(|(_, addr)| addr.is_empty()) {
            return Err(NodeConfigError::MissingPeerAddr(peer.clone()));
        }
        self.raft.validate()?;
        Ok(())
    }
}

/// Builder for NodeConfig
#[derive(Debug, Default)]
pub struct NodeConfigBuilder {
    config: NodeConfig,
}

impl NodeConfigBuilder {
    pub fn id(mut self, id: impl Into<NodeId>) -> Self {
        self.config.id = id.into();
        self
    }

    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    /// Add a peer node
    pub fn peer(mut self, id: impl Into<NodeId>, addr: impl Into<String>) -> Self {
        self.config.peers.insert(id.into(), addr.into());
        self
    }

    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    pub fn raft(mut self, raft: RaftConfig) -> Self {
        self.config.raft = raft;
        self
    }

    pub fn heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.config.raft.heartbeat_interval = ms;
        self
    }

    pub fn build(self) -> Result<NodeConfig, NodeConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
