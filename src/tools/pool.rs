//! Supervised pool of tool provider clients.
//!
//! The pool holds at most one client per closed-vocabulary tool name.
//! It imposes no global concurrency limit of its own — throughput is
//! governed upstream by the rate limiter.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::config::ToolProviderConfig;

use super::client::{ClientSettings, ProcessSpec, ToolClient};
use super::{ClientStatus, ToolError, ToolName};

pub struct ToolPool {
    clients: BTreeMap<ToolName, ToolClient>,
}

impl ToolPool {
    /// Build a pool from configuration. Unknown provider names are
    /// skipped with a warning; they are outside the closed vocabulary.
    pub fn from_config(providers: &[ToolProviderConfig], settings: ClientSettings) -> Self {
        let mut clients = BTreeMap::new();
        for provider in providers {
            let Some(name) = ToolName::parse(&provider.name) else {
                tracing::warn!(name = %provider.name, "ignoring unknown tool provider");
                continue;
            };
            let client = ToolClient::new(
                name,
                Some(ProcessSpec {
                    path: provider.path.clone(),
                    env_passthrough: provider.env_passthrough.clone(),
                }),
                settings.clone(),
            );
            clients.insert(name, client);
        }
        Self { clients }
    }

    /// Pool over pre-built clients (tests).
    #[cfg(test)]
    pub fn from_clients(clients: Vec<ToolClient>) -> Self {
        Self {
            clients: clients.into_iter().map(|c| (c.name(), c)).collect(),
        }
    }

    /// Connect every configured client concurrently. Individual
    /// failures leave that client `failed`; the pool still serves the
    /// rest.
    pub async fn connect_all(self: &Arc<Self>) {
        let mut joins = tokio::task::JoinSet::new();
        for client in self.clients.values() {
            let client = client.clone();
            joins.spawn(async move {
                if let Err(e) = client.connect().await {
                    tracing::warn!(tool = %client.name(), error = %e, "tool connect failed");
                }
            });
        }
        while joins.join_next().await.is_some() {}
    }

    /// Configured tool names, sorted.
    pub fn members(&self) -> Vec<ToolName> {
        self.clients.keys().copied().collect()
    }

    pub fn contains(&self, name: ToolName) -> bool {
        self.clients.contains_key(&name)
    }

    /// Connection status per configured client.
    pub fn statuses(&self) -> BTreeMap<ToolName, ClientStatus> {
        self.clients
            .iter()
            .map(|(name, client)| (*name, client.status()))
            .collect()
    }

    /// Sorted union of method names advertised by currently-connected
    /// clients.
    pub fn capabilities(&self) -> Vec<String> {
        let mut methods: Vec<String> = self
            .clients
            .values()
            .filter(|c| c.status() == ClientStatus::Connected)
            .flat_map(|c| c.methods())
            .collect();
        methods.sort();
        methods.dedup();
        methods
    }

    /// Issue one call to a named tool with a deadline.
    pub async fn call(
        &self,
        name: ToolName,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Result<Value, ToolError> {
        let client = self.clients.get(&name).ok_or(ToolError::Unavailable)?;
        client.call(method, params, deadline).await
    }

    /// Close every client with the graceful shutdown protocol.
    pub async fn shutdown(&self) {
        for client in self.clients.values() {
            client.close().await;
        }
    }
}
