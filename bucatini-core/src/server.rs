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

//! The per-server RPC surface and the wire commands built on it.
//!
//! [`ServerHandle`] is the seam between the cursor engine and the transport:
//! one implementation per connected server, each call one RPC round-trip.
//! `get_more` and `kill_cursors` have default implementations that build the
//! documented command shapes and delegate to [`ServerHandle::command`], so a
//! transport only has to run commands.
//!
//! [`CursorBatch::parse`] is the single place server responses are decoded:
//! it turns non-ok replies into [`Error::Server`] (code, codeName, labels)
//! and extracts the cursor descriptor, post-batch resume token, and
//! timestamps.

use crate::error::Error;
use crate::event::{Namespace, ResumeToken};
use crate::session::ClientSession;
use crate::topology::ServerDescription;
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Wire version at which `getMore` accepts a caller comment.
pub const GET_MORE_COMMENT_WIRE_VERSION: i32 = 9;

/// Options forwarded on a `getMore` round-trip.
#[derive(Debug, Clone, Default)]
pub struct GetMoreOptions {
    /// Documents requested for this batch.
    pub batch_size: Option<u32>,

    /// Server-side wait before returning an empty batch; tailable
    /// await-data cursors only.
    pub max_await_time: Option<Duration>,

    /// Caller comment; forwarded only to servers new enough to accept it.
    pub comment: Option<Bson>,
}

/// Executes single RPCs against one server.
#[async_trait]
pub trait ServerHandle: Send + Sync {
    /// The monitoring snapshot for this server.
    fn description(&self) -> ServerDescription;

    /// Number of RPCs currently in flight on this handle. Used for fairness
    /// and observability only.
    fn operation_count(&self) -> usize;

    /// Runs one command round-trip against the given database and returns
    /// the raw response document.
    async fn command(
        &self,
        database: &str,
        command: Document,
        session: Option<&ClientSession>,
    ) -> Result<Document, Error>;

    /// Issues a `getMore` for the given cursor.
    async fn get_more(
        &self,
        namespace: &Namespace,
        cursor_id: i64,
        options: &GetMoreOptions,
    ) -> Result<Document, Error> {
        let command = build_get_more(
            namespace,
            cursor_id,
            options,
            self.description().max_wire_version,
        );
        self.command(&namespace.database, command, None).await
    }

    /// Best-effort `killCursors`; callers ignore failures.
    async fn kill_cursors(&self, namespace: &Namespace, cursor_ids: &[i64]) -> Result<(), Error> {
        let command = build_kill_cursors(namespace, cursor_ids);
        self.command(&namespace.database, command, None)
            .await
            .map(|_| ())
    }
}

/// RAII in-flight operation counter.
///
/// Acquired before a checkout, released on every exit path.
pub struct OperationCountGuard {
    counter: Arc<AtomicUsize>,
}

impl OperationCountGuard {
    /// Increments the counter and returns the guard that decrements it.
    pub fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self {
            counter: Arc::clone(counter),
        }
    }
}

impl Drop for OperationCountGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Builds a `getMore` command for the given cursor.
pub fn build_get_more(
    namespace: &Namespace,
    cursor_id: i64,
    options: &GetMoreOptions,
    wire_version: i32,
) -> Document {
    let mut command = doc! {
        "getMore": cursor_id,
        "collection": namespace.collection.clone(),
    };
    if let Some(batch_size) = options.batch_size {
        command.insert("batchSize", batch_size as i32);
    }
    if let Some(max_await_time) = options.max_await_time {
        command.insert("maxTimeMS", max_await_time.as_millis() as i64);
    }
    if wire_version >= GET_MORE_COMMENT_WIRE_VERSION {
        if let Some(comment) = &options.comment {
            command.insert("comment", comment.clone());
        }
    }
    command
}

/// Builds a `killCursors` command for the given cursor ids.
pub fn build_kill_cursors(namespace: &Namespace, cursor_ids: &[i64]) -> Document {
    doc! {
        "killCursors": namespace.collection.clone(),
        "cursors": cursor_ids.to_vec(),
    }
}

/// One decoded cursor response: a batch of documents plus the descriptor
/// fields the engine tracks.
#[derive(Debug, Clone)]
pub struct CursorBatch {
    /// Server cursor id; zero means the cursor is exhausted.
    pub id: i64,

    /// Namespace rewrite from the response, when present.
    pub namespace: Option<Namespace>,

    /// The batch documents in server order.
    pub documents: VecDeque<Document>,

    /// Token for the position just past the end of this batch.
    pub post_batch_resume_token: Option<ResumeToken>,

    /// The command's operation time.
    pub operation_time: Option<bson::Timestamp>,

    /// The `$clusterTime` the response carried.
    pub cluster_time: Option<Document>,
}

impl CursorBatch {
    /// Decodes a cursor response.
    ///
    /// Returns `Ok(None)` when the response carries no `cursor` document at
    /// all (an explain-style reply); the cursor engine buffers such
    /// responses whole.
    ///
    /// # Errors
    ///
    /// Non-ok responses become [`Error::Server`]; a present but malformed
    /// cursor descriptor becomes [`Error::Runtime`].
    pub fn parse(response: &Document, first: bool) -> Result<Option<Self>, Error> {
        check_ok(response)?;

        let cursor = match response.get_document("cursor") {
            Ok(cursor) => cursor,
            Err(_) => return Ok(None),
        };

        let id = read_cursor_id(cursor)?;
        let namespace = cursor
            .get_str("ns")
            .ok()
            .and_then(Namespace::from_qualified);

        let batch_key = if first { "firstBatch" } else { "nextBatch" };
        let batch = cursor.get_array(batch_key).map_err(|_| {
            Error::Runtime(format!("cursor response is missing {batch_key}"))
        })?;
        let documents = batch
            .iter()
            .map(|entry| {
                entry
                    .as_document()
                    .cloned()
                    .ok_or_else(|| Error::Runtime("non-document entry in cursor batch".to_string()))
            })
            .collect::<Result<VecDeque<_>, _>>()?;

        let post_batch_resume_token = cursor
            .get("postBatchResumeToken")
            .cloned()
            .map(ResumeToken::new);
        let operation_time = response.get("operationTime").and_then(Bson::as_timestamp);
        let cluster_time = response.get_document("$clusterTime").ok().cloned();

        Ok(Some(Self {
            id,
            namespace,
            documents,
            post_batch_resume_token,
            operation_time,
            cluster_time,
        }))
    }
}

/// Fails with [`Error::Server`] when the response reports `ok: 0`.
///
/// A missing `ok` field is treated as success; only command replies carry it.
pub fn check_ok(response: &Document) -> Result<(), Error> {
    let ok = match response.get("ok") {
        Some(Bson::Double(value)) => *value == 1.0,
        Some(Bson::Int32(value)) => *value == 1,
        Some(Bson::Int64(value)) => *value == 1,
        Some(_) => false,
        None => true,
    };
    if ok {
        return Ok(());
    }

    let code = match response.get("code") {
        Some(Bson::Int32(code)) => *code,
        Some(Bson::Int64(code)) => *code as i32,
        Some(Bson::Double(code)) => *code as i32,
        _ => 0,
    };
    let code_name = response.get_str("codeName").unwrap_or_default().to_string();
    let message = response.get_str("errmsg").unwrap_or("command failed").to_string();
    let labels = response
        .get_array("errorLabels")
        .map(|labels| {
            labels
                .iter()
                .filter_map(|label| label.as_str().map(ToString::to_string))
                .collect()
        })
        .unwrap_or_default();

    Err(Error::Server {
        code,
        code_name,
        message,
        labels,
    })
}

fn read_cursor_id(cursor: &Document) -> Result<i64, Error> {
    match cursor.get("id") {
        Some(Bson::Int64(id)) => Ok(*id),
        Some(Bson::Int32(id)) => Ok(i64::from(*id)),
        _ => Err(Error::Runtime(
            "cursor response is missing a numeric id".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RESUMABLE_CHANGE_STREAM_LABEL;
    use bson::Timestamp;

    fn namespace() -> Namespace {
        Namespace::new("shop", "orders")
    }

    #[test]
    fn get_more_shape() {
        let options = GetMoreOptions {
            batch_size: Some(50),
            max_await_time: Some(Duration::from_millis(250)),
            comment: None,
        };
        let command = build_get_more(&namespace(), 42, &options, 8);
        assert_eq!(command.get_i64("getMore").unwrap(), 42);
        assert_eq!(command.get_str("collection").unwrap(), "orders");
        assert_eq!(command.get_i32("batchSize").unwrap(), 50);
        assert_eq!(command.get_i64("maxTimeMS").unwrap(), 250);
    }

    #[test]
    fn get_more_comment_requires_wire_nine() {
        let options = GetMoreOptions {
            comment: Some(Bson::String("audit".to_string())),
            ..Default::default()
        };
        let old = build_get_more(&namespace(), 42, &options, 8);
        assert!(!old.contains_key("comment"));
        let new = build_get_more(&namespace(), 42, &options, 9);
        assert_eq!(new.get_str("comment").unwrap(), "audit");
    }

    #[test]
    fn kill_cursors_shape() {
        let command = build_kill_cursors(&namespace(), &[42, 43]);
        assert_eq!(command.get_str("killCursors").unwrap(), "orders");
        let ids = command.get_array("cursors").unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], Bson::Int64(42));
    }

    #[test]
    fn parses_first_batch() {
        let response = doc! {
            "cursor": {
                "id": 42_i64,
                "ns": "shop.orders",
                "firstBatch": [ { "x": 1 }, { "x": 2 } ],
                "postBatchResumeToken": { "_data": "82" },
            },
            "operationTime": Bson::Timestamp(Timestamp { time: 7, increment: 1 }),
            "ok": 1,
        };
        let batch = CursorBatch::parse(&response, true).unwrap().unwrap();
        assert_eq!(batch.id, 42);
        assert_eq!(batch.namespace, Some(namespace()));
        assert_eq!(batch.documents.len(), 2);
        assert_eq!(
            batch.post_batch_resume_token,
            Some(ResumeToken::from_document(doc! { "_data": "82" }))
        );
        assert_eq!(
            batch.operation_time,
            Some(Timestamp { time: 7, increment: 1 })
        );
    }

    #[test]
    fn next_batches_read_next_batch_key() {
        let response = doc! {
            "cursor": { "id": 0_i64, "ns": "shop.orders", "nextBatch": [] },
            "ok": 1,
        };
        let batch = CursorBatch::parse(&response, false).unwrap().unwrap();
        assert_eq!(batch.id, 0);
        assert!(batch.documents.is_empty());
        // Parsing the same response as a first batch fails on the key.
        assert!(matches!(
            CursorBatch::parse(&response, true),
            Err(Error::Runtime(_))
        ));
    }

    #[test]
    fn cursorless_responses_parse_to_none() {
        let response = doc! { "ok": 1, "queryPlanner": { "winningPlan": "COLLSCAN" } };
        assert!(CursorBatch::parse(&response, true).unwrap().is_none());
    }

    #[test]
    fn non_ok_responses_become_server_errors() {
        let response = doc! {
            "ok": 0,
            "code": 6,
            "codeName": "HostUnreachable",
            "errmsg": "unreachable",
            "errorLabels": [RESUMABLE_CHANGE_STREAM_LABEL],
        };
        let error = CursorBatch::parse(&response, true).unwrap_err();
        assert_eq!(error.code(), Some(6));
        assert!(error.has_label(RESUMABLE_CHANGE_STREAM_LABEL));
    }

    #[test]
    fn operation_guard_counts_in_flight_work() {
        let counter = Arc::new(AtomicUsize::new(0));
        let outer = OperationCountGuard::acquire(&counter);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        {
            let _inner = OperationCountGuard::acquire(&counter);
            assert_eq!(counter.load(Ordering::SeqCst), 2);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        drop(outer);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
