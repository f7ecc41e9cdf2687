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

//! Scripted transport doubles for exercising cursors without a server.
//!
//! [`MockServer`] replays a queue of scripted replies and records every
//! command it receives, so tests can assert the exact wire shapes the engine
//! produced. [`MockTopology`] serves those servers through the
//! [`Topology`] seam and lets tests flip connectivity to drive the resume
//! wait loop.

use crate::cursor::{CursorSource, CursorSpec, OperationContext};
use crate::error::Error;
use crate::server::{OperationCountGuard, ServerHandle};
use crate::session::{ClientSession, SessionOwner};
use crate::topology::{
    cluster_time_is_newer, SelectionCriteria, ServerDescription, ServerType, Topology,
};
use async_trait::async_trait;
use bson::{doc, Bson, Document, Timestamp};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A server that replays scripted replies in order.
pub struct MockServer {
    description: ServerDescription,
    replies: Mutex<VecDeque<Result<Document, Error>>>,
    commands: Mutex<Vec<Document>>,
    operations: Arc<AtomicUsize>,
}

impl MockServer {
    /// A server with the given description and an empty script.
    pub fn new(description: ServerDescription) -> Arc<Self> {
        Arc::new(Self {
            description,
            replies: Mutex::new(VecDeque::new()),
            commands: Mutex::new(Vec::new()),
            operations: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// A replica-set primary at the given wire version.
    pub fn primary(max_wire_version: i32) -> Arc<Self> {
        Self::new(ServerDescription {
            address: "mock-primary:27017".to_string(),
            server_type: ServerType::ReplicaSetPrimary,
            max_wire_version,
            load_balanced: false,
        })
    }

    /// A server behind a load balancer at the given wire version.
    pub fn load_balanced(max_wire_version: i32) -> Arc<Self> {
        Self::new(ServerDescription {
            address: "mock-lb:27017".to_string(),
            server_type: ServerType::LoadBalancer,
            max_wire_version,
            load_balanced: true,
        })
    }

    /// Scripts the next reply.
    pub fn enqueue(&self, reply: Result<Document, Error>) {
        self.replies
            .lock()
            .expect("mock reply queue poisoned")
            .push_back(reply);
    }

    /// Scripts a successful reply.
    pub fn enqueue_ok(&self, response: Document) {
        self.enqueue(Ok(response));
    }

    /// Scripts a transport failure.
    pub fn enqueue_error(&self, error: Error) {
        self.enqueue(Err(error));
    }

    /// Every command received so far, in order.
    pub fn commands(&self) -> Vec<Document> {
        self.commands
            .lock()
            .expect("mock command log poisoned")
            .clone()
    }

    /// The received commands whose first key is `name`.
    pub fn commands_named(&self, name: &str) -> Vec<Document> {
        self.commands()
            .into_iter()
            .filter(|command| command.contains_key(name))
            .collect()
    }
}

#[async_trait]
impl ServerHandle for MockServer {
    fn description(&self) -> ServerDescription {
        self.description.clone()
    }

    fn operation_count(&self) -> usize {
        self.operations.load(Ordering::SeqCst)
    }

    async fn command(
        &self,
        _database: &str,
        command: Document,
        _session: Option<&ClientSession>,
    ) -> Result<Document, Error> {
        let _guard = OperationCountGuard::acquire(&self.operations);
        self.commands
            .lock()
            .expect("mock command log poisoned")
            .push(command);
        match self
            .replies
            .lock()
            .expect("mock reply queue poisoned")
            .pop_front()
        {
            Some(reply) => reply,
            None => Err(Error::Runtime(
                "mock server has no scripted reply left".to_string(),
            )),
        }
    }
}

/// A topology serving scripted servers, with switchable connectivity.
///
/// Successive `select_server` calls walk the server list and stick on the
/// last entry, so a resume can be pointed at a different server than the
/// original cursor.
pub struct MockTopology {
    servers: Mutex<Vec<Arc<MockServer>>>,
    selection_index: AtomicUsize,
    connected: AtomicBool,
    sessions_supported: bool,
    load_balanced: bool,
    cluster_time: Mutex<Option<Document>>,
    sessions_started: AtomicUsize,
}

impl MockTopology {
    /// A connected topology with one server and session support.
    pub fn new(server: Arc<MockServer>) -> Arc<Self> {
        Self::with_servers(vec![server])
    }

    /// A connected topology serving `servers` in selection order.
    pub fn with_servers(servers: Vec<Arc<MockServer>>) -> Arc<Self> {
        Arc::new(Self {
            servers: Mutex::new(servers),
            selection_index: AtomicUsize::new(0),
            connected: AtomicBool::new(true),
            sessions_supported: true,
            load_balanced: false,
            cluster_time: Mutex::new(None),
            sessions_started: AtomicUsize::new(0),
        })
    }

    /// A connected load-balanced topology with one server.
    pub fn load_balanced(server: Arc<MockServer>) -> Arc<Self> {
        Arc::new(Self {
            servers: Mutex::new(vec![server]),
            selection_index: AtomicUsize::new(0),
            connected: AtomicBool::new(true),
            sessions_supported: true,
            load_balanced: true,
            cluster_time: Mutex::new(None),
            sessions_started: AtomicUsize::new(0),
        })
    }

    /// A disconnected topology with no servers.
    pub fn disconnected() -> Arc<Self> {
        Arc::new(Self {
            servers: Mutex::new(Vec::new()),
            selection_index: AtomicUsize::new(0),
            connected: AtomicBool::new(false),
            sessions_supported: true,
            load_balanced: false,
            cluster_time: Mutex::new(None),
            sessions_started: AtomicUsize::new(0),
        })
    }

    /// Flips the connectivity flag the resume wait loop polls.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Appends a server to the selection order.
    pub fn add_server(&self, server: Arc<MockServer>) {
        self.servers
            .lock()
            .expect("mock server list poisoned")
            .push(server);
    }

    /// How many sessions were started through this topology.
    pub fn sessions_started(&self) -> usize {
        self.sessions_started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Topology for MockTopology {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn select_server(
        &self,
        _criteria: &SelectionCriteria,
    ) -> Result<Arc<dyn ServerHandle>, Error> {
        if !self.is_connected() {
            return Err(Error::ServerSelection { waited_ms: 0 });
        }
        let servers = self.servers.lock().expect("mock server list poisoned");
        if servers.is_empty() {
            return Err(Error::ServerSelection { waited_ms: 0 });
        }
        let index = self
            .selection_index
            .fetch_add(1, Ordering::SeqCst)
            .min(servers.len() - 1);
        Ok(servers[index].clone())
    }

    fn supports_sessions(&self) -> bool {
        self.sessions_supported
    }

    fn start_session(&self, owner: SessionOwner) -> ClientSession {
        self.sessions_started.fetch_add(1, Ordering::SeqCst);
        ClientSession::with_owner(owner)
    }

    fn is_load_balanced(&self) -> bool {
        self.load_balanced
    }

    fn cluster_time(&self) -> Option<Document> {
        self.cluster_time
            .lock()
            .expect("mock cluster time poisoned")
            .clone()
    }

    fn advance_cluster_time(&self, cluster_time: &Document) {
        let mut current = self
            .cluster_time
            .lock()
            .expect("mock cluster time poisoned");
        if cluster_time_is_newer(current.as_ref(), cluster_time) {
            *current = Some(cluster_time.clone());
        }
    }
}

/// A cursor source that selects a server and runs one fixed command; the
/// generic-cursor counterpart of the change stream's aggregate source.
pub struct CommandSource {
    database: String,
    command: Document,
    criteria: SelectionCriteria,
}

impl CommandSource {
    /// Runs `command` against `database` on a selected server.
    pub fn new(database: impl Into<String>, command: Document) -> Self {
        Self {
            database: database.into(),
            command,
            criteria: SelectionCriteria::default(),
        }
    }
}

#[async_trait]
impl CursorSource for CommandSource {
    async fn execute(&mut self, context: OperationContext) -> Result<CursorSpec, Error> {
        let server = context.topology.select_server(&self.criteria).await?;
        let response = server
            .command(&self.database, self.command.clone(), context.session.as_ref())
            .await?;
        Ok(CursorSpec {
            server,
            session: context.session,
            response,
        })
    }
}

/// A resume token document with the given payload.
pub fn resume_token(data: &str) -> Bson {
    Bson::Document(doc! { "_data": data })
}

/// A successful cursor response.
pub fn cursor_response(id: i64, namespace: &str, first: bool, batch: Vec<Document>) -> Document {
    cursor_response_with(id, namespace, first, batch, None, None)
}

/// A successful cursor response with an optional post-batch resume token and
/// operation time.
pub fn cursor_response_with(
    id: i64,
    namespace: &str,
    first: bool,
    batch: Vec<Document>,
    post_batch_resume_token: Option<Bson>,
    operation_time: Option<Timestamp>,
) -> Document {
    let batch_key = if first { "firstBatch" } else { "nextBatch" };
    let mut cursor = doc! { "id": id, "ns": namespace };
    cursor.insert(
        batch_key,
        Bson::Array(batch.into_iter().map(Bson::Document).collect()),
    );
    if let Some(token) = post_batch_resume_token {
        cursor.insert("postBatchResumeToken", token);
    }
    let mut response = doc! { "cursor": cursor, "ok": 1 };
    if let Some(timestamp) = operation_time {
        response.insert("operationTime", Bson::Timestamp(timestamp));
    }
    response
}

/// A failed command response.
pub fn command_error(code: i32, code_name: &str, message: &str, labels: &[&str]) -> Document {
    doc! {
        "ok": 0,
        "code": code,
        "codeName": code_name,
        "errmsg": message,
        "errorLabels": labels.iter().map(|l| Bson::String((*l).to_string())).collect::<Vec<_>>(),
    }
}

/// A minimal change document with the given token and operation.
pub fn change_document(
    token: Bson,
    operation: &str,
    database: &str,
    collection: &str,
) -> Document {
    doc! {
        "_id": token,
        "operationType": operation,
        "ns": { "db": database, "coll": collection },
        "documentKey": { "_id": 1 },
        "clusterTime": Bson::Timestamp(Timestamp { time: 1000, increment: 1 }),
    }
}
