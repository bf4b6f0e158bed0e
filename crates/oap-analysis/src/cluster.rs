// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cluster membership: instances register their remote address and query the
//! peer list. Indicator routing picks a peer by hash over that list.

use crate::errors::ClusterError;
use crate::indicator::Indicator;
use derive_more::Display;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

/// Address of one analysis instance. Equality ignores `is_self`.
#[derive(Debug, Display, Clone, Eq)]
#[display("{host}:{port}")]
pub struct RemoteInstance {
    pub host: String,
    pub port: u16,
    pub is_self: bool,
}

impl RemoteInstance {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            is_self: false,
        }
    }
}

impl PartialEq for RemoteInstance {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

pub trait ClusterRegistry: Send + Sync {
    fn register_remote(&self, instance: RemoteInstance) -> Result<(), ClusterError>;

    /// Every registered instance, sorted by address, with the caller's own
    /// instance flagged `is_self`.
    fn query_remote_nodes(&self) -> Result<Vec<RemoteInstance>, ClusterError>;
}

/// Peer selected for `hash`, stable for a given peer list. Every instance
/// that sees the same membership picks the same peer.
pub fn route(nodes: &[RemoteInstance], hash: u64) -> Option<&RemoteInstance> {
    if nodes.is_empty() {
        return None;
    }
    nodes.get((hash % nodes.len() as u64) as usize)
}

/// Instance that owns `indicator` across every level of its rollup chain.
pub fn owner_of<'a>(
    nodes: &'a [RemoteInstance],
    indicator: &Indicator,
) -> Option<&'a RemoteInstance> {
    route(nodes, indicator.remote_hash())
}

/// Membership list shared by every coordinator of one process-local cluster.
pub type Directory = Arc<RwLock<Vec<RemoteInstance>>>;

#[derive(Default)]
pub struct InMemoryCoordinator {
    directory: Directory,
    self_instance: RwLock<Option<RemoteInstance>>,
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A coordinator that shares its membership list with others.
    pub fn with_directory(directory: Directory) -> Self {
        Self {
            directory,
            self_instance: RwLock::new(None),
        }
    }
}

impl ClusterRegistry for InMemoryCoordinator {
    fn register_remote(&self, instance: RemoteInstance) -> Result<(), ClusterError> {
        if instance.host.trim().is_empty() || instance.port == 0 {
            return Err(ClusterError::Register {
                address: instance.to_string(),
                reason: "host and port are required".to_string(),
            });
        }

        let mut directory = self
            .directory
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !directory.contains(&instance) {
            directory.push(instance.clone());
        }
        info!("Registered remote instance {}", instance);
        *self
            .self_instance
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(instance);
        Ok(())
    }

    fn query_remote_nodes(&self) -> Result<Vec<RemoteInstance>, ClusterError> {
        let self_instance = self
            .self_instance
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ClusterError::NotRegistered)?;

        let mut nodes: Vec<RemoteInstance> = self
            .directory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|node| RemoteInstance {
                is_self: *node == self_instance,
                ..node.clone()
            })
            .collect();
        nodes.sort_by(|a, b| (&a.host, a.port).cmp(&(&b.host, b.port)));
        Ok(nodes)
    }
}
