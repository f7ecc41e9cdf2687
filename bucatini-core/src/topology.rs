// Copyright 2025 Bucatini Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Read-only view over the deployment topology.
//!
//! Server discovery and monitoring live outside this crate; cursors and
//! change streams only need the narrow surface modeled by [`Topology`]:
//! whether the deployment is reachable, server selection, session support,
//! and the cluster time watermark. [`await_connected`] is the wait loop the
//! resume path parks on while the topology recovers.

use crate::error::Error;
use crate::options::ReadPreference;
use crate::server::ServerHandle;
use crate::session::{ClientSession, SessionOwner};
use async_trait::async_trait;
use bson::Document;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{trace, warn};

/// How often the resume path re-checks topology connectivity.
pub const TOPOLOGY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default bound on one resume attempt's wait for the topology.
pub const DEFAULT_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// The role a server plays in the deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ServerType {
    /// A standalone server.
    Standalone,
    /// A sharded-cluster router.
    Mongos,
    /// The primary of a replica set.
    ReplicaSetPrimary,
    /// A secondary of a replica set.
    ReplicaSetSecondary,
    /// A non-data-bearing replica set member.
    ReplicaSetOther,
    /// A load balancer fronting the deployment.
    LoadBalancer,
    /// Not yet determined by monitoring.
    Unknown,
}

/// Immutable snapshot of one server, as reported by monitoring.
#[derive(Debug, Clone)]
pub struct ServerDescription {
    /// "host:port" of the server.
    pub address: String,

    /// The server's role.
    pub server_type: ServerType,

    /// Highest wire protocol version the server speaks.
    pub max_wire_version: i32,

    /// Whether the server sits behind a load balancer.
    pub load_balanced: bool,
}

/// What the caller needs from server selection.
#[derive(Debug, Clone, Default)]
pub struct SelectionCriteria {
    /// Which members are acceptable.
    pub read_preference: ReadPreference,

    /// Overrides the topology's own selection timeout when set.
    pub timeout: Option<Duration>,
}

impl SelectionCriteria {
    /// Criteria selecting by read preference with the default timeout.
    pub fn read_preference(read_preference: ReadPreference) -> Self {
        Self {
            read_preference,
            timeout: None,
        }
    }
}

/// Read-only facade over server discovery and monitoring.
#[async_trait]
pub trait Topology: Send + Sync {
    /// Whether at least one usable server is currently known.
    fn is_connected(&self) -> bool;

    /// Picks a server satisfying `criteria`.
    ///
    /// # Errors
    ///
    /// Selection timeouts and other selection failures are surfaced
    /// unchanged.
    async fn select_server(
        &self,
        criteria: &SelectionCriteria,
    ) -> Result<Arc<dyn ServerHandle>, Error>;

    /// Whether the deployment supports sessions.
    fn supports_sessions(&self) -> bool;

    /// Whether session support is still undetermined and must be checked by
    /// running an operation.
    fn should_check_session_support(&self) -> bool {
        false
    }

    /// Starts a session with the given ownership.
    fn start_session(&self, owner: SessionOwner) -> ClientSession {
        ClientSession::with_owner(owner)
    }

    /// Whether the deployment is in load-balanced mode.
    fn is_load_balanced(&self) -> bool {
        false
    }

    /// The most recent cluster time observed on any response.
    fn cluster_time(&self) -> Option<Document>;

    /// Advances the cluster time watermark; older times are ignored.
    fn advance_cluster_time(&self, cluster_time: &Document);
}

/// Whether `incoming` carries a newer cluster time than `current`.
///
/// Cluster time documents embed a `clusterTime` timestamp; a missing or
/// malformed timestamp never advances the watermark.
pub fn cluster_time_is_newer(current: Option<&Document>, incoming: &Document) -> bool {
    let incoming_ts = match incoming.get_timestamp("clusterTime") {
        Ok(ts) => ts,
        Err(_) => return false,
    };
    match current.and_then(|c| c.get_timestamp("clusterTime").ok()) {
        Some(current_ts) => {
            (incoming_ts.time, incoming_ts.increment) > (current_ts.time, current_ts.increment)
        }
        None => true,
    }
}

/// Waits until the topology reports a connection, polling every
/// [`TOPOLOGY_POLL_INTERVAL`], or fails with [`Error::ServerSelection`]
/// once `timeout` elapses.
pub async fn await_connected(topology: &dyn Topology, timeout: Duration) -> Result<(), Error> {
    let deadline = Instant::now() + timeout;
    loop {
        if topology.is_connected() {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            warn!(
                waited_ms = timeout.as_millis() as u64,
                "topology did not reconnect within the selection timeout"
            );
            return Err(Error::ServerSelection {
                waited_ms: timeout.as_millis() as u64,
            });
        }
        let wait = TOPOLOGY_POLL_INTERVAL.min(deadline - now);
        trace!(wait_ms = wait.as_millis() as u64, "topology not connected; waiting");
        sleep(wait).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTopology;
    use bson::{doc, Bson, Timestamp};

    fn cluster_time(time: u32, increment: u32) -> Document {
        doc! { "clusterTime": Bson::Timestamp(Timestamp { time, increment }) }
    }

    #[test]
    fn newer_cluster_times_win() {
        let older = cluster_time(10, 1);
        let newer = cluster_time(10, 2);
        assert!(cluster_time_is_newer(None, &older));
        assert!(cluster_time_is_newer(Some(&older), &newer));
        assert!(!cluster_time_is_newer(Some(&newer), &older));
        assert!(!cluster_time_is_newer(Some(&newer), &newer));
    }

    #[test]
    fn malformed_cluster_times_never_advance() {
        let current = cluster_time(10, 1);
        assert!(!cluster_time_is_newer(Some(&current), &doc! { "other": 1 }));
    }

    #[tokio::test]
    async fn await_connected_returns_immediately_when_connected() {
        let topology = MockTopology::disconnected();
        topology.set_connected(true);
        await_connected(topology.as_ref(), Duration::from_millis(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn await_connected_times_out() {
        let topology = MockTopology::disconnected();
        let started = std::time::Instant::now();
        let result = await_connected(topology.as_ref(), Duration::from_millis(50)).await;
        assert!(matches!(result, Err(Error::ServerSelection { .. })));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn await_connected_observes_reconnection() {
        let topology = MockTopology::disconnected();
        let waiter = Arc::clone(&topology);
        let handle = tokio::spawn(async move {
            await_connected(waiter.as_ref(), Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        topology.set_connected(true);
        handle.await.unwrap().unwrap();
    }
}
