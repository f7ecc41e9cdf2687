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

//! The generic server-cursor engine.
//!
//! A [`Cursor`] runs one server cursor to completion: it lazily executes its
//! originating operation (supplied as a [`CursorSource`]), buffers each
//! batch, issues `getMore` until the server reports id 0, and cleans up by
//! killing the server cursor and ending any implicitly owned session.
//!
//! Consumption is pull-style ([`Cursor::next`], [`Cursor::try_next`]) or
//! push-style ([`Cursor::stream`], a [`futures::Stream`] with at most one
//! in-flight fetch). Options are frozen once the cursor initializes.
//!
//! # Lifecycle
//!
//! ```text
//! new ──► initialize (first pull) ──► buffered batches ⇄ getMore ──► id 0
//!                                                        │
//!                                                 error / close
//!                                                        ▼
//!                                                    cleanup
//! ```

use crate::error::Error;
use crate::event::Namespace;
use crate::options::{CursorFlag, CursorOptions, ReadPreference};
use crate::server::{CursorBatch, GetMoreOptions, ServerHandle};
use crate::session::{ClientSession, SessionOwner};
use crate::topology::{ServerDescription, Topology};
use async_trait::async_trait;
use bson::Document;
use futures::Stream;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, trace, warn};

/// Batch size used for `getMore` when the caller did not pick one.
const DEFAULT_GET_MORE_BATCH_SIZE: u32 = 1000;

/// Server codes raised when a `getMore` races a cursor kill: Interrupted and
/// CursorKilled.
pub(crate) const INTERRUPTION_CODES: &[i32] = &[11601, 237];

const CURSOR_NOT_FOUND: i32 = 43;

/// A document-to-document mapping applied to every yielded document.
pub type DocumentTransform = Arc<dyn Fn(Document) -> Result<Document, Error> + Send + Sync>;

/// Callback invoked with every decoded batch, before its documents are
/// buffered. Receives the batch, the description of the server that produced
/// it, and whether it came from the initial response.
pub(crate) type BatchObserver =
    Box<dyn FnMut(&CursorBatch, &ServerDescription, bool) + Send>;

/// What a [`CursorSource`] needs to run the originating operation.
pub struct OperationContext {
    /// The topology to select a server from.
    pub topology: Arc<dyn Topology>,

    /// The session the cursor acquired, passed through for the operation and
    /// returned in the [`CursorSpec`].
    pub session: Option<ClientSession>,
}

/// The outcome of a cursor's originating operation.
pub struct CursorSpec {
    /// The server the operation ran against; subsequent `getMore` and
    /// `killCursors` go to the same server.
    pub server: Arc<dyn ServerHandle>,

    /// The session handed back from the operation.
    pub session: Option<ClientSession>,

    /// The raw server response containing the cursor descriptor.
    pub response: Document,
}

/// The one operation a cursor runs to come into existence, e.g. an
/// aggregate. Executed lazily on the first pull, and again after
/// [`Cursor::rewind`].
#[async_trait]
pub trait CursorSource: Send {
    /// Selects a server, runs the operation, and returns the server, the
    /// session, and the raw response.
    async fn execute(&mut self, context: OperationContext) -> Result<CursorSpec, Error>;
}

/// A generic server cursor.
pub struct Cursor {
    topology: Arc<dyn Topology>,
    source: Option<Box<dyn CursorSource>>,
    namespace: Namespace,
    options: CursorOptions,
    id: i64,
    buffer: VecDeque<Document>,
    server: Option<Arc<dyn ServerHandle>>,
    session: Option<ClientSession>,
    transform: Option<DocumentTransform>,
    observer: Option<BatchObserver>,
    initialized: bool,
    closed: bool,
    killed: bool,
    exhausted: bool,
}

impl Cursor {
    /// Creates a cursor that will run `source` on its first pull.
    pub fn new(
        topology: Arc<dyn Topology>,
        namespace: Namespace,
        options: CursorOptions,
        source: Box<dyn CursorSource>,
    ) -> Self {
        Self {
            topology,
            source: Some(source),
            namespace,
            options,
            id: 0,
            buffer: VecDeque::new(),
            server: None,
            session: None,
            transform: None,
            observer: None,
            initialized: false,
            closed: false,
            killed: false,
            exhausted: false,
        }
    }

    /// Installs the batch observer. Must happen before initialization.
    pub(crate) fn set_batch_observer(&mut self, observer: BatchObserver) {
        self.observer = Some(observer);
    }

    /// The server cursor id; zero means exhausted or not yet initialized.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// The namespace the cursor iterates, as last reported by the server.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// The options the cursor was built with.
    pub fn options(&self) -> &CursorOptions {
        &self.options
    }

    /// Whether the originating operation has run.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Whether the cursor has been closed, explicitly or by exhaustion.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether a `killCursors` was issued for this cursor.
    pub fn is_killed(&self) -> bool {
        self.killed
    }

    /// Whether the server reported the cursor exhausted and the buffer has
    /// drained.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Documents currently buffered locally.
    pub fn buffered_count(&self) -> usize {
        self.buffer.len()
    }

    /// The server the cursor is pinned to, once initialized.
    pub fn server(&self) -> Option<&Arc<dyn ServerHandle>> {
        self.server.as_ref()
    }

    /// The session attached to the cursor, if any.
    pub fn session(&self) -> Option<&ClientSession> {
        self.session.as_ref()
    }

    /// The wire version of the server that ran the cursor.
    pub fn max_wire_version(&self) -> Option<i32> {
        self.server.as_ref().map(|s| s.description().max_wire_version)
    }

    fn ensure_mutable(&self) -> Result<(), Error> {
        if self.initialized {
            return Err(Error::CursorInUse);
        }
        Ok(())
    }

    /// Requests a cursor behavior flag. Fails once the cursor is in use.
    pub fn add_cursor_flag(&mut self, flag: CursorFlag) -> Result<(), Error> {
        self.ensure_mutable()?;
        match flag {
            CursorFlag::Tailable => self.options.tailable = true,
            CursorFlag::AwaitData => self.options.await_data = true,
            CursorFlag::NoCursorTimeout => self.options.no_cursor_timeout = true,
        }
        Ok(())
    }

    /// Sets the batch size. Fails once in use, and always on tailable
    /// cursors, whose batch size is fixed at construction.
    pub fn set_batch_size(&mut self, batch_size: u32) -> Result<(), Error> {
        self.ensure_mutable()?;
        if self.options.tailable {
            return Err(Error::TailableCursor {
                operation: "batch size changes",
            });
        }
        self.options.batch_size = Some(batch_size);
        Ok(())
    }

    /// Sets the server-side time limit. Fails once in use.
    pub fn set_max_time(&mut self, max_time: std::time::Duration) -> Result<(), Error> {
        self.ensure_mutable()?;
        self.options.max_time = Some(max_time);
        Ok(())
    }

    /// Sets the read preference. Fails once in use.
    pub fn set_read_preference(&mut self, read_preference: ReadPreference) -> Result<(), Error> {
        self.ensure_mutable()?;
        self.options.read_preference = Some(read_preference);
        Ok(())
    }

    /// Sets the read concern. Fails once in use.
    pub fn set_read_concern(&mut self, read_concern: Document) -> Result<(), Error> {
        self.ensure_mutable()?;
        self.options.read_concern = Some(read_concern);
        Ok(())
    }

    /// Adds a transform applied to every yielded document, composing on top
    /// of any transform already installed. Fails once in use.
    pub fn map<F>(&mut self, transform: F) -> Result<(), Error>
    where
        F: Fn(Document) -> Result<Document, Error> + Send + Sync + 'static,
    {
        self.ensure_mutable()?;
        let next: DocumentTransform = Arc::new(transform);
        self.transform = Some(match self.transform.take() {
            Some(previous) => Arc::new(move |document| next(previous(document)?)),
            None => next,
        });
        Ok(())
    }

    /// Yields the next document, waiting for the server when the buffer is
    /// empty. `Ok(None)` signals end-of-stream; calling again after a
    /// natural exhaustion returns [`Error::CursorExhausted`], while a cursor
    /// ended by [`Cursor::close`] keeps returning `Ok(None)`.
    pub async fn next(&mut self) -> Result<Option<Document>, Error> {
        match self.advance(true).await? {
            Some(document) => self.apply_transform(document).map(Some),
            None => Ok(None),
        }
    }

    /// Like [`Cursor::next`], but returns `Ok(None)` as soon as a `getMore`
    /// comes back empty instead of waiting for data.
    pub async fn try_next(&mut self) -> Result<Option<Document>, Error> {
        match self.advance(false).await? {
            Some(document) => self.apply_transform(document).map(Some),
            None => Ok(None),
        }
    }

    /// Whether another document is available. Fetches at most one document
    /// and pushes it back untransformed, so transforms still apply exactly
    /// once when it is eventually yielded.
    pub async fn has_next(&mut self) -> Result<bool, Error> {
        if !self.buffer.is_empty() {
            return Ok(true);
        }
        match self.advance(true).await {
            Ok(Some(document)) => {
                self.buffer.push_front(document);
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(Error::CursorExhausted) => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Drains the cursor to completion.
    pub async fn collect_all(&mut self) -> Result<Vec<Document>, Error> {
        let mut documents = Vec::new();
        while let Some(document) = self.next().await? {
            documents.push(document);
        }
        Ok(documents)
    }

    /// Iterates until exhaustion or until `f` returns `false`.
    pub async fn for_each<F>(&mut self, mut f: F) -> Result<(), Error>
    where
        F: FnMut(Document) -> bool + Send,
    {
        while let Some(document) = self.next().await? {
            if !f(document) {
                break;
            }
        }
        Ok(())
    }

    /// Converts the cursor into a push-style stream.
    pub fn stream(self) -> DocumentStream {
        DocumentStream::new(self, None)
    }

    /// Converts the cursor into a push-style stream with an extra transform
    /// layered over the cursor's own.
    pub fn stream_with_transform(self, transform: DocumentTransform) -> DocumentStream {
        DocumentStream::new(self, Some(transform))
    }

    /// Closes the cursor: kills the server cursor when one is live and ends
    /// an implicitly owned session. Idempotent.
    pub async fn close(&mut self) {
        self.cleanup(None).await;
    }

    /// Resets the cursor to its pre-initialized state so the originating
    /// operation can run again. Ends an implicitly owned session.
    pub fn rewind(&mut self) {
        if !self.initialized {
            return;
        }
        trace!(namespace = %self.namespace, "rewinding cursor");
        self.id = 0;
        self.buffer.clear();
        self.server = None;
        self.initialized = false;
        self.closed = false;
        self.killed = false;
        self.exhausted = false;
        if let Some(session) = self.session.as_mut() {
            if session.is_implicit() {
                session.end();
            }
        }
        self.session = None;
    }

    fn apply_transform(&self, document: Document) -> Result<Document, Error> {
        match &self.transform {
            Some(transform) => transform(document),
            None => Ok(document),
        }
    }

    fn notify_observer(&mut self, batch: &CursorBatch, first: bool) {
        if let Some(observer) = self.observer.as_mut() {
            if let Some(server) = &self.server {
                observer(batch, &server.description(), first);
            }
        }
    }

    /// The iteration loop. Yields raw (untransformed) documents.
    async fn advance(&mut self, blocking: bool) -> Result<Option<Document>, Error> {
        loop {
            if self.closed {
                if self.exhausted && blocking {
                    return Err(Error::CursorExhausted);
                }
                return Ok(None);
            }

            if let Some(document) = self.buffer.pop_front() {
                return Ok(Some(document));
            }

            if !self.initialized {
                self.initialize().await?;
                continue;
            }

            if self.id == 0 {
                self.exhausted = true;
                self.cleanup(None).await;
                return Ok(None);
            }

            let server = match self.server.clone() {
                Some(server) => server,
                None => {
                    let error = Error::Runtime("initialized cursor has no server".to_string());
                    self.cleanup(Some(&error)).await;
                    return Err(error);
                }
            };

            let get_more = GetMoreOptions {
                batch_size: Some(
                    self.options
                        .batch_size
                        .unwrap_or(DEFAULT_GET_MORE_BATCH_SIZE),
                ),
                max_await_time: if self.options.tailable && self.options.await_data {
                    self.options.max_await_time
                } else {
                    None
                },
                comment: self.options.comment.clone(),
            };

            trace!(cursor_id = self.id, namespace = %self.namespace, "issuing getMore");
            let parsed = match server.get_more(&self.namespace, self.id, &get_more).await {
                Ok(response) => CursorBatch::parse(&response, false),
                Err(error) => {
                    self.cleanup(Some(&error)).await;
                    return Err(error);
                }
            };

            let batch = match parsed {
                Ok(Some(batch)) => batch,
                Ok(None) => {
                    let error = Error::Runtime("getMore response has no cursor".to_string());
                    self.cleanup(Some(&error)).await;
                    return Err(error);
                }
                Err(error) => {
                    self.cleanup(Some(&error)).await;
                    return Err(error);
                }
            };

            if let Some(cluster_time) = &batch.cluster_time {
                self.topology.advance_cluster_time(cluster_time);
            }
            self.notify_observer(&batch, false);

            let CursorBatch { id, documents, .. } = batch;
            self.id = id;
            self.buffer = documents;

            if self.id == 0 && self.buffer.is_empty() {
                self.exhausted = true;
                self.cleanup(None).await;
                return Ok(None);
            }

            // A zero id alongside a non-empty batch still drains first; the
            // loop ends the cursor once the buffer empties.
            if self.buffer.is_empty() && !blocking {
                return Ok(None);
            }
        }
    }

    /// Runs the originating operation. The cursor counts as initialized
    /// whether or not the operation succeeds.
    async fn initialize(&mut self) -> Result<(), Error> {
        debug!(namespace = %self.namespace, "initializing cursor");

        if self.session.is_none()
            && (self.topology.supports_sessions()
                || self.topology.should_check_session_support())
        {
            self.session = Some(self.topology.start_session(SessionOwner::Implicit));
        }

        let mut source = match self.source.take() {
            Some(source) => source,
            None => {
                self.initialized = true;
                let error = Error::Runtime("cursor source is gone".to_string());
                self.cleanup(Some(&error)).await;
                return Err(error);
            }
        };
        let context = OperationContext {
            topology: Arc::clone(&self.topology),
            session: self.session.take(),
        };
        let result = source.execute(context).await;
        self.source = Some(source);
        self.initialized = true;

        let spec = match result {
            Ok(spec) => spec,
            Err(error) => {
                self.cleanup(Some(&error)).await;
                return Err(error);
            }
        };
        self.session = spec.session;
        self.server = Some(spec.server);
        if self.topology.is_load_balanced() {
            if let Some(session) = self.session.as_mut() {
                session.pin();
            }
        }

        match CursorBatch::parse(&spec.response, true) {
            Ok(Some(batch)) => {
                if let Some(cluster_time) = &batch.cluster_time {
                    self.topology.advance_cluster_time(cluster_time);
                }
                if let Some(namespace) = &batch.namespace {
                    self.namespace = namespace.clone();
                }
                self.notify_observer(&batch, true);
                let CursorBatch { id, documents, .. } = batch;
                self.id = id;
                self.buffer = documents;
                debug!(
                    cursor_id = self.id,
                    namespace = %self.namespace,
                    buffered = self.buffer.len(),
                    "cursor initialized"
                );
                Ok(())
            }
            Ok(None) => {
                // No cursor in the response (e.g. an explain): the whole
                // response is the single result.
                self.id = 0;
                self.buffer = VecDeque::from([spec.response]);
                Ok(())
            }
            Err(error) => {
                self.cleanup(Some(&error)).await;
                Err(error)
            }
        }
    }

    /// Tears the cursor down. Kills the server cursor when one is live,
    /// except on the load-balanced network-error path where the connection
    /// is already suspect. Ends an implicitly owned session. Idempotent.
    async fn cleanup(&mut self, error: Option<&Error>) {
        if self.closed {
            return;
        }
        self.closed = true;

        let network_error = error.map(Error::is_network).unwrap_or(false);
        let load_balanced = self.topology.is_load_balanced();
        let skip_kill = load_balanced && network_error;

        if self.id != 0 && !skip_kill {
            if let Some(server) = self.server.clone() {
                self.killed = true;
                debug!(cursor_id = self.id, namespace = %self.namespace, "killing server cursor");
                if let Err(kill_error) = server.kill_cursors(&self.namespace, &[self.id]).await {
                    debug!(error = %kill_error, "killCursors failed; ignoring");
                }
            }
        } else if skip_kill {
            debug!("skipping killCursors after a network error in load-balanced mode");
        }

        if let Some(session) = self.session.as_mut() {
            if session.is_pinned() {
                session.unpin();
            }
            if session.is_implicit() {
                session.end();
            }
        }

        match error {
            Some(error) => warn!(
                namespace = %self.namespace,
                error = %error,
                category = error.category(),
                "cursor closed after error"
            ),
            None => trace!(namespace = %self.namespace, "cursor closed"),
        }
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("namespace", &self.namespace)
            .field("id", &self.id)
            .field("buffered", &self.buffer.len())
            .field("initialized", &self.initialized)
            .field("closed", &self.closed)
            .field("killed", &self.killed)
            .finish()
    }
}

type FetchFuture = Pin<Box<dyn Future<Output = (Cursor, Result<Option<Document>, Error>)> + Send>>;

/// Push-style adapter over a [`Cursor`].
///
/// Keeps at most one fetch in flight, so consumers get natural back-pressure:
/// no read-ahead happens until the previous document is taken. Interruption
/// races between a local kill and an in-flight `getMore` end the stream
/// silently; other errors propagate and end it.
pub struct DocumentStream {
    cursor: Option<Cursor>,
    in_flight: Option<FetchFuture>,
    transform: Option<DocumentTransform>,
    done: bool,
}

impl DocumentStream {
    fn new(cursor: Cursor, transform: Option<DocumentTransform>) -> Self {
        Self {
            cursor: Some(cursor),
            in_flight: None,
            transform,
            done: false,
        }
    }

    /// Recovers the cursor, unless a fetch is currently in flight.
    pub fn into_cursor(self) -> Option<Cursor> {
        self.cursor
    }

    fn ends_silently(error: &Error, cursor: Option<&Cursor>) -> bool {
        match error {
            Error::CursorExhausted => true,
            Error::Server { code, .. } => {
                INTERRUPTION_CODES.contains(code)
                    || (*code == CURSOR_NOT_FOUND
                        && cursor.map(Cursor::is_killed).unwrap_or(false))
            }
            _ => false,
        }
    }
}

impl Stream for DocumentStream {
    type Item = Result<Document, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.done {
                return Poll::Ready(None);
            }

            if let Some(fetch) = this.in_flight.as_mut() {
                let (cursor, result) = match fetch.as_mut().poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(outcome) => outcome,
                };
                this.in_flight = None;
                this.cursor = Some(cursor);

                match result {
                    Ok(Some(document)) => {
                        let document = match &this.transform {
                            Some(transform) => match transform(document) {
                                Ok(document) => document,
                                Err(error) => {
                                    this.done = true;
                                    return Poll::Ready(Some(Err(error)));
                                }
                            },
                            None => document,
                        };
                        return Poll::Ready(Some(Ok(document)));
                    }
                    Ok(None) => {
                        this.done = true;
                        return Poll::Ready(None);
                    }
                    Err(error) => {
                        this.done = true;
                        if Self::ends_silently(&error, this.cursor.as_ref()) {
                            trace!(error = %error, "document stream ended by interruption");
                            return Poll::Ready(None);
                        }
                        return Poll::Ready(Some(Err(error)));
                    }
                }
            }

            let mut cursor = match this.cursor.take() {
                Some(cursor) => cursor,
                None => {
                    this.done = true;
                    return Poll::Ready(None);
                }
            };
            this.in_flight = Some(Box::pin(async move {
                let result = cursor.next().await;
                (cursor, result)
            }));
        }
    }
}

impl std::fmt::Debug for DocumentStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStream")
            .field("done", &self.done)
            .field("fetch_in_flight", &self.in_flight.is_some())
            .finish()
    }
}
