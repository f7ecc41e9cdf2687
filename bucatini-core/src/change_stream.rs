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

//! Change streams: continuous, resumable feeds of change events.
//!
//! A [`ChangeStream`] owns a [`ChangeStreamCursor`], which is a generic
//! [`Cursor`](crate::cursor::Cursor) whose originating operation is an
//! aggregate opening with a `$changeStream` stage. The engine pulls change
//! documents from the cursor, keeps the resume-token cache current, and on a
//! resumable failure rebuilds the cursor from the cached token so the
//! consumer never observes the interruption.
//!
//! # Consumption modes
//!
//! A stream is consumed either by pulling ([`ChangeStream::next`],
//! [`ChangeStream::try_next`]) or as a push-style
//! [`futures::Stream`] ([`ChangeStream::stream`]). The first operation locks
//! the stream into its mode; mixing modes fails with
//! [`Error::ModeConflict`].
//!
//! # Resume flow
//!
//! ```text
//! getMore fails ──► resumable? ──► close old cursor
//!                      │                │
//!                      │ no             ▼
//!                      ▼         wait for topology (500ms ticks, 30s cap)
//!              close + surface          │
//!                                       ▼
//!                            new aggregate with resumeAfter/
//!                            startAfter/startAtOperationTime
//! ```

use crate::cursor::{Cursor, CursorSource, CursorSpec, OperationContext};
use crate::error::Error;
use crate::event::{ChangeEvent, Namespace, ResumeToken};
use crate::options::ChangeStreamOptions;
use crate::server::CursorBatch;
use crate::topology::{
    await_connected, SelectionCriteria, ServerDescription, Topology, DEFAULT_SELECTION_TIMEOUT,
};
use async_trait::async_trait;
use bson::{doc, Bson, Document, Timestamp};
use futures::{Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

/// Wire version at which servers accept `startAtOperationTime`.
pub const OPERATION_TIME_WIRE_VERSION: i32 = 7;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// The scope of a change stream subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchTarget {
    /// Changes on one collection.
    Collection {
        /// Database name.
        database: String,
        /// Collection name.
        collection: String,
    },

    /// Changes on every collection in a database.
    Database {
        /// Database name.
        database: String,
    },

    /// Changes across the whole deployment.
    Deployment,
}

impl WatchTarget {
    /// Watches one collection.
    pub fn collection(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self::Collection {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Watches every collection in a database.
    pub fn database(database: impl Into<String>) -> Self {
        Self::Database {
            database: database.into(),
        }
    }

    /// Watches the whole deployment.
    pub fn deployment() -> Self {
        Self::Deployment
    }

    /// Whether this is a deployment-wide subscription.
    pub fn is_deployment(&self) -> bool {
        matches!(self, Self::Deployment)
    }

    /// The database the aggregate runs against.
    pub(crate) fn aggregate_database(&self) -> &str {
        match self {
            Self::Collection { database, .. } | Self::Database { database } => database,
            Self::Deployment => "admin",
        }
    }

    /// The `aggregate` field value: the collection name, or 1 for
    /// database-wide and deployment-wide streams.
    pub(crate) fn aggregate_target(&self) -> Bson {
        match self {
            Self::Collection { collection, .. } => Bson::String(collection.clone()),
            Self::Database { .. } | Self::Deployment => Bson::Int32(1),
        }
    }

    /// The namespace the cursor starts under; the server may rewrite it in
    /// the initial response.
    pub(crate) fn namespace(&self) -> Namespace {
        match self {
            Self::Collection {
                database,
                collection,
            } => Namespace::new(database.clone(), collection.clone()),
            Self::Database { database } => Namespace::new(database.clone(), "$cmd.aggregate"),
            Self::Deployment => Namespace::new("admin", "$cmd.aggregate"),
        }
    }
}

impl fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Collection {
                database,
                collection,
            } => write!(f, "{database}.{collection}"),
            Self::Database { database } => write!(f, "{database} (database)"),
            Self::Deployment => write!(f, "deployment"),
        }
    }
}

/// Lifecycle notifications observable through [`ChangeStream::subscribe`].
///
/// Change documents themselves are delivered through the consumption surface
/// (`next` or `stream`), not through this channel.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The first server response of a cursor arrived.
    Initialized,

    /// A server response arrived (initial or `getMore`).
    Response,

    /// A `getMore` batch arrived, with its document count.
    More {
        /// Documents in the batch.
        batch_size: usize,
    },

    /// The cached resume token changed.
    ResumeTokenChanged {
        /// The new token.
        token: ResumeToken,
    },

    /// The server ended the stream (e.g. after an invalidate).
    End,

    /// The stream closed. Emitted exactly once.
    Closed,

    /// The stream is closing because of a terminal error.
    Error {
        /// Rendered error message.
        message: String,
    },
}

/// Shared resume-token state, updated by the cursor's batch observer and
/// read when building resume options.
#[derive(Debug, Default)]
struct TokenCache {
    resume_token: Option<ResumeToken>,
    post_batch_resume_token: Option<ResumeToken>,
    operation_time: Option<Timestamp>,
    has_received: bool,
    max_wire_version: Option<i32>,
}

impl TokenCache {
    fn set_resume_token(&mut self, token: ResumeToken, events: &broadcast::Sender<StreamEvent>) {
        if self.resume_token.as_ref() == Some(&token) {
            return;
        }
        let _ = events.send(StreamEvent::ResumeTokenChanged {
            token: token.clone(),
        });
        self.resume_token = Some(token);
    }
}

/// Builds the `$changeStream` stage from the recognized option subset.
pub(crate) fn build_change_stream_stage(
    options: &ChangeStreamOptions,
    all_changes_for_cluster: bool,
) -> Document {
    let mut stage = Document::new();
    if all_changes_for_cluster {
        stage.insert("allChangesForCluster", true);
    }
    if let Some(full_document) = options.full_document {
        stage.insert("fullDocument", full_document.as_str());
    }
    if let Some(token) = &options.resume_after {
        stage.insert("resumeAfter", token.bson().clone());
    }
    if let Some(token) = &options.start_after {
        stage.insert("startAfter", token.bson().clone());
    }
    if let Some(timestamp) = options.start_at_operation_time {
        stage.insert("startAtOperationTime", Bson::Timestamp(timestamp));
    }
    doc! { "$changeStream": stage }
}

/// The originating operation of a change-stream cursor: an aggregate whose
/// pipeline opens with `$changeStream`.
struct AggregateSource {
    target: WatchTarget,
    pipeline: Vec<Document>,
    options: ChangeStreamOptions,
    criteria: SelectionCriteria,
}

impl AggregateSource {
    fn build_command(&self) -> Document {
        let stage = build_change_stream_stage(&self.options, self.target.is_deployment());
        let mut pipeline: Vec<Bson> = Vec::with_capacity(self.pipeline.len() + 1);
        pipeline.push(Bson::Document(stage));
        pipeline.extend(self.pipeline.iter().cloned().map(Bson::Document));

        let mut cursor = Document::new();
        if let Some(batch_size) = self.options.batch_size {
            cursor.insert("batchSize", batch_size as i32);
        }

        let mut command = doc! {
            "aggregate": self.target.aggregate_target(),
            "pipeline": pipeline,
            "cursor": cursor,
        };
        if let Some(collation) = &self.options.collation {
            command.insert("collation", collation.clone());
        }
        if let Some(comment) = &self.options.comment {
            command.insert("comment", comment.clone());
        }
        command
    }
}

#[async_trait]
impl CursorSource for AggregateSource {
    async fn execute(&mut self, context: OperationContext) -> Result<CursorSpec, Error> {
        let server = context.topology.select_server(&self.criteria).await?;
        let description = server.description();

        if self.options.start_at_operation_time.is_some()
            && description.max_wire_version < OPERATION_TIME_WIRE_VERSION
        {
            return Err(Error::Compatibility {
                message: format!(
                    "server {} at wire version {} does not support startAtOperationTime \
                     (requires {OPERATION_TIME_WIRE_VERSION})",
                    description.address, description.max_wire_version
                ),
            });
        }

        let command = self.build_command();
        debug!(
            server = %description.address,
            scope = %self.target,
            "opening change stream"
        );
        let response = server
            .command(self.target.aggregate_database(), command, context.session.as_ref())
            .await?;
        Ok(CursorSpec {
            server,
            session: context.session,
            response,
        })
    }
}

/// A cursor over `$changeStream` aggregate results.
///
/// Beyond the generic cursor mechanics this tracks the resume token per the
/// caching rules: post-batch tokens are stored on every batch and promoted
/// to the resume token when the batch is empty or fully consumed; otherwise
/// the `_id` of each delivered document becomes the token.
pub struct ChangeStreamCursor {
    inner: Cursor,
    options: ChangeStreamOptions,
    cache: Arc<Mutex<TokenCache>>,
    events: broadcast::Sender<StreamEvent>,
}

impl ChangeStreamCursor {
    pub(crate) fn new(
        topology: Arc<dyn Topology>,
        target: &WatchTarget,
        pipeline: &[Document],
        options: ChangeStreamOptions,
        events: broadcast::Sender<StreamEvent>,
    ) -> Self {
        let criteria = SelectionCriteria {
            read_preference: options.read_preference.unwrap_or_default(),
            timeout: options.selection_timeout,
        };

        // A restart anchor is the stream's position until the server says
        // otherwise, so reads of the token stay stable across a resume.
        let cache_state = TokenCache {
            resume_token: options
                .start_after
                .clone()
                .or_else(|| options.resume_after.clone()),
            ..TokenCache::default()
        };
        let cache = Arc::new(Mutex::new(cache_state));

        let source = AggregateSource {
            target: target.clone(),
            pipeline: pipeline.to_vec(),
            options: options.clone(),
            criteria,
        };
        let mut inner = Cursor::new(
            topology,
            target.namespace(),
            options.cursor_options(),
            Box::new(source),
        );

        let observer_cache = Arc::clone(&cache);
        let observer_events = events.clone();
        let had_restart_anchor = options.has_restart_anchor();
        inner.set_batch_observer(Box::new(
            move |batch: &CursorBatch, server: &ServerDescription, first: bool| {
                if let Ok(mut cache) = observer_cache.lock() {
                    cache.max_wire_version = Some(server.max_wire_version);
                    if first {
                        let _ = observer_events.send(StreamEvent::Initialized);
                        if !had_restart_anchor
                            && server.max_wire_version >= OPERATION_TIME_WIRE_VERSION
                        {
                            if let Some(operation_time) = batch.operation_time {
                                cache.operation_time = Some(operation_time);
                            }
                        }
                    } else {
                        let _ = observer_events.send(StreamEvent::More {
                            batch_size: batch.documents.len(),
                        });
                    }
                    let _ = observer_events.send(StreamEvent::Response);

                    if let Some(token) = &batch.post_batch_resume_token {
                        cache.post_batch_resume_token = Some(token.clone());
                        if batch.documents.is_empty() {
                            cache.set_resume_token(token.clone(), &observer_events);
                        }
                    }
                }
            },
        ));

        Self {
            inner,
            options,
            cache,
            events,
        }
    }

    /// Yields the next raw change document, waiting for the server.
    pub async fn next(&mut self) -> Result<Option<Document>, Error> {
        self.inner.next().await
    }

    /// Yields the next raw change document if one is promptly available.
    pub async fn try_next(&mut self) -> Result<Option<Document>, Error> {
        self.inner.try_next().await
    }

    /// Whether another change document is available; blocks until the server
    /// produces one or the cursor dies.
    pub async fn has_next(&mut self) -> Result<bool, Error> {
        self.inner.has_next().await
    }

    /// Closes the underlying cursor. Idempotent.
    pub async fn close(&mut self) {
        self.inner.close().await;
    }

    /// Whether the underlying cursor is closed.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// The current resume token.
    pub fn resume_token(&self) -> Option<ResumeToken> {
        self.cache.lock().ok().and_then(|c| c.resume_token.clone())
    }

    /// Whether at least one change document has been delivered.
    pub fn has_received(&self) -> bool {
        self.cache.lock().map(|c| c.has_received).unwrap_or(false)
    }

    /// The wire version of the server this cursor ran against; zero when the
    /// cursor never initialized.
    pub fn max_wire_version(&self) -> i32 {
        self.cache
            .lock()
            .ok()
            .and_then(|c| c.max_wire_version)
            .or_else(|| self.inner.max_wire_version())
            .unwrap_or(0)
    }

    /// Caches the token of a just-delivered change document.
    ///
    /// When the local buffer has drained and a post-batch token is known,
    /// the post-batch token wins; it marks the position just past the batch
    /// and never points at an already-consumed event.
    pub fn cache_resume_token(&mut self, token: ResumeToken) {
        let buffered = self.inner.buffered_count();
        if let Ok(mut cache) = self.cache.lock() {
            if buffered == 0 && cache.post_batch_resume_token.is_some() {
                if let Some(post_batch) = cache.post_batch_resume_token.clone() {
                    cache.set_resume_token(post_batch, &self.events);
                }
            } else {
                cache.set_resume_token(token, &self.events);
            }
            cache.has_received = true;
        }
    }

    /// The options a replacement cursor must be built with to continue from
    /// this cursor's position.
    ///
    /// Exactly one restart anchor survives: the cached resume token (as
    /// `startAfter` only when the stream originally asked for `startAfter`
    /// and no document was ever delivered, otherwise `resumeAfter`), or the
    /// recorded operation time when no token exists and the dying server's
    /// wire version supports it.
    pub fn resume_options(&self) -> ChangeStreamOptions {
        let mut options = self.options.clone();
        options.resume_after = None;
        options.start_after = None;
        options.start_at_operation_time = None;

        let cache = match self.cache.lock() {
            Ok(cache) => cache,
            Err(_) => return options,
        };
        if let Some(token) = cache.resume_token.clone() {
            if self.options.start_after.is_some() && !cache.has_received {
                options.start_after = Some(token);
            } else {
                options.resume_after = Some(token);
            }
        } else if let Some(operation_time) = cache.operation_time {
            if cache.max_wire_version.unwrap_or(0) >= OPERATION_TIME_WIRE_VERSION {
                options.start_at_operation_time = Some(operation_time);
            }
        }
        options
    }
}

impl fmt::Debug for ChangeStreamCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeStreamCursor")
            .field("cursor", &self.inner)
            .field("resume_token", &self.resume_token())
            .finish()
    }
}

/// How a change stream is being consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessMode {
    Unset,
    Iterator,
    Emitter,
}

/// A resumable subscription to change events.
///
/// # Examples
///
/// ```rust,no_run
/// use bucatini_core::change_stream::{ChangeStream, WatchTarget};
/// use bucatini_core::options::ChangeStreamOptions;
/// use bucatini_core::topology::Topology;
/// use std::sync::Arc;
///
/// # async fn example(topology: Arc<dyn Topology>) -> Result<(), bucatini_core::Error> {
/// let mut stream = ChangeStream::new(
///     topology,
///     WatchTarget::collection("shop", "orders"),
///     Vec::new(),
///     ChangeStreamOptions::default(),
/// )?;
///
/// loop {
///     let event = stream.next().await?;
///     println!("{:?} on {:?}", event.operation, event.namespace);
/// }
/// # }
/// ```
pub struct ChangeStream {
    topology: Arc<dyn Topology>,
    target: WatchTarget,
    pipeline: Vec<Document>,
    options: ChangeStreamOptions,
    cursor: Option<ChangeStreamCursor>,
    mode: AccessMode,
    closed: bool,
    events: broadcast::Sender<StreamEvent>,
    selection_timeout: Duration,
}

impl ChangeStream {
    /// Creates a change stream over `target`, appending `pipeline` after the
    /// `$changeStream` stage. No server round-trip happens until the first
    /// pull.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when `options` carries more than
    /// one restart anchor.
    pub fn new(
        topology: Arc<dyn Topology>,
        target: WatchTarget,
        pipeline: Vec<Document>,
        options: ChangeStreamOptions,
    ) -> Result<Self, Error> {
        options.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let selection_timeout = options.selection_timeout.unwrap_or(DEFAULT_SELECTION_TIMEOUT);
        let cursor = ChangeStreamCursor::new(
            Arc::clone(&topology),
            &target,
            &pipeline,
            options.clone(),
            events.clone(),
        );
        info!(scope = %target, "change stream created");
        Ok(Self {
            topology,
            target,
            pipeline,
            options,
            cursor: Some(cursor),
            mode: AccessMode::Unset,
            closed: false,
            events,
            selection_timeout,
        })
    }

    /// The scope this stream watches.
    pub fn target(&self) -> &WatchTarget {
        &self.target
    }

    /// Subscribes to lifecycle notifications. Works in either consumption
    /// mode and does not affect the mode.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    /// The current resume token.
    pub fn resume_token(&self) -> Option<ResumeToken> {
        self.cursor.as_ref().and_then(ChangeStreamCursor::resume_token)
    }

    /// Whether the stream or its cursor is closed.
    pub fn is_closed(&self) -> bool {
        self.closed
            || self
                .cursor
                .as_ref()
                .map(ChangeStreamCursor::is_closed)
                .unwrap_or(true)
    }

    fn claim_mode(&mut self, requested: AccessMode) -> Result<(), Error> {
        if self.mode == AccessMode::Unset {
            self.mode = requested;
            return Ok(());
        }
        if self.mode == requested {
            Ok(())
        } else {
            Err(Error::ModeConflict)
        }
    }

    /// Waits for and returns the next change event.
    ///
    /// Locks the stream into pull consumption. Resumable failures are
    /// handled internally; an error from this method is terminal and the
    /// stream is closed when it surfaces.
    pub async fn next(&mut self) -> Result<ChangeEvent, Error> {
        self.claim_mode(AccessMode::Iterator)?;
        match self.pull(true).await? {
            Some(event) => Ok(event),
            None => Err(Error::ChangeStreamClosed),
        }
    }

    /// Returns the next change event if one is promptly available,
    /// `Ok(None)` otherwise. Locks the stream into pull consumption.
    pub async fn try_next(&mut self) -> Result<Option<ChangeEvent>, Error> {
        self.claim_mode(AccessMode::Iterator)?;
        self.pull(false).await
    }

    /// Whether another change event is available; blocks until the server
    /// produces one. Returns `Ok(false)` once the stream has ended. Locks
    /// the stream into pull consumption.
    pub async fn has_next(&mut self) -> Result<bool, Error> {
        self.claim_mode(AccessMode::Iterator)?;
        loop {
            if self.closed {
                return Err(Error::ChangeStreamClosed);
            }
            let outcome = match self.cursor.as_mut() {
                Some(cursor) => cursor.has_next().await,
                None => return Err(Error::NoCursor),
            };
            match outcome {
                Ok(true) => return Ok(true),
                Ok(false) => {
                    let _ = self.events.send(StreamEvent::End);
                    self.close_internal().await;
                    return Ok(false);
                }
                Err(error) => self.resume_or_surface(error).await?,
            }
        }
    }

    /// Consumes the stream as a push-style sequence of change events.
    ///
    /// Locks the stream into push consumption; pull methods fail with
    /// [`Error::ModeConflict`] afterwards, including after the returned
    /// stream is dropped. The stream ends after the server ends it or a
    /// terminal error is yielded.
    pub fn stream(
        &mut self,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<ChangeEvent, Error>> + Send + '_>>, Error> {
        self.claim_mode(AccessMode::Emitter)?;
        Ok(Box::pin(
            futures::stream::unfold(self, |engine| async move {
                if engine.closed {
                    return None;
                }
                match engine.pull(true).await {
                    Ok(Some(event)) => Some((Ok(event), engine)),
                    Ok(None) => None,
                    Err(Error::ChangeStreamClosed) => None,
                    Err(error) => Some((Err(error), engine)),
                }
            })
            .fuse(),
        ))
    }

    /// Closes the stream and its cursor. Idempotent; emits
    /// [`StreamEvent::Closed`] exactly once.
    pub async fn close(&mut self) {
        self.close_internal().await;
    }

    async fn close_internal(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(mut cursor) = self.cursor.take() {
            cursor.close().await;
        }
        let _ = self.events.send(StreamEvent::Closed);
        debug!(scope = %self.target, "change stream closed");
    }

    /// The pull loop shared by both consumption modes. Resumes in place on
    /// resumable failures; every surfaced error is terminal.
    async fn pull(&mut self, blocking: bool) -> Result<Option<ChangeEvent>, Error> {
        loop {
            if self.closed {
                return Err(Error::ChangeStreamClosed);
            }
            let outcome = match self.cursor.as_mut() {
                Some(cursor) => {
                    if blocking {
                        cursor.next().await
                    } else {
                        cursor.try_next().await
                    }
                }
                None => return Err(Error::NoCursor),
            };
            match outcome {
                Ok(Some(document)) => {
                    return self.process_new_change(document).await.map(Some);
                }
                Ok(None) => {
                    let cursor_live = self
                        .cursor
                        .as_ref()
                        .map(|c| !c.is_closed())
                        .unwrap_or(false);
                    if !blocking && cursor_live {
                        // An empty non-blocking poll; the stream is still
                        // running.
                        return Ok(None);
                    }
                    let _ = self.events.send(StreamEvent::End);
                    self.close_internal().await;
                    return Err(Error::ChangeStreamClosed);
                }
                Err(error) => self.resume_or_surface(error).await?,
            }
        }
    }

    /// Caches the delivered document's token and converts it into a typed
    /// event.
    async fn process_new_change(&mut self, document: Document) -> Result<ChangeEvent, Error> {
        let id = match document.get("_id").cloned() {
            Some(id) => id,
            None => {
                warn!(scope = %self.target, "change document has no _id; closing");
                let error = Error::NoResumeToken;
                let _ = self.events.send(StreamEvent::Error {
                    message: error.to_string(),
                });
                self.close_internal().await;
                return Err(error);
            }
        };

        if let Some(cursor) = self.cursor.as_mut() {
            cursor.cache_resume_token(ResumeToken::new(id));
        }
        // The cached token supersedes any operation-time anchor; keeping
        // both would put two restart anchors on a later reconstruction.
        self.options.start_at_operation_time = None;

        match bson::from_document::<ChangeEvent>(document) {
            Ok(event) => Ok(event),
            Err(parse_error) => {
                let error = Error::Runtime(format!("malformed change document: {parse_error}"));
                let _ = self.events.send(StreamEvent::Error {
                    message: error.to_string(),
                });
                self.close_internal().await;
                Err(error)
            }
        }
    }

    /// Handles a cursor failure: resumes in place when the classifier allows
    /// it, otherwise closes the stream and surfaces the error. Returns
    /// `Ok(())` exactly when the stream resumed and the pull should retry.
    #[instrument(skip(self, error), fields(scope = %self.target, category = error.category()))]
    async fn resume_or_surface(&mut self, error: Error) -> Result<(), Error> {
        if self.closed {
            return Err(Error::ChangeStreamClosed);
        }

        let resumable = match self.cursor.as_ref() {
            Some(cursor) => error.is_resumable(cursor.max_wire_version()),
            None => false,
        };
        if !resumable {
            warn!(error = %error, "change stream error is not resumable; closing");
            let _ = self.events.send(StreamEvent::Error {
                message: error.to_string(),
            });
            self.close_internal().await;
            return Err(error);
        }

        info!(error = %error, "resumable change stream error; reconstructing cursor");
        let mut old_cursor = match self.cursor.take() {
            Some(cursor) => cursor,
            None => return Err(Error::NoCursor),
        };
        let resume_options = old_cursor.resume_options();
        old_cursor.close().await;

        if let Err(wait_error) = await_connected(self.topology.as_ref(), self.selection_timeout).await
        {
            let _ = self.events.send(StreamEvent::Error {
                message: wait_error.to_string(),
            });
            self.close_internal().await;
            return Err(wait_error);
        }

        let mut cursor = ChangeStreamCursor::new(
            Arc::clone(&self.topology),
            &self.target,
            &self.pipeline,
            resume_options,
            self.events.clone(),
        );

        if self.mode == AccessMode::Iterator {
            // Prove the replacement works before adopting it; the fetched
            // document stays buffered for the caller's pull.
            if let Err(probe_error) = cursor.has_next().await {
                warn!(error = %probe_error, "replacement cursor failed its first fetch; closing");
                let _ = self.events.send(StreamEvent::Error {
                    message: probe_error.to_string(),
                });
                self.close_internal().await;
                return Err(probe_error);
            }
        }

        info!("change stream resumed");
        self.cursor = Some(cursor);
        Ok(())
    }
}

impl fmt::Debug for ChangeStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeStream")
            .field("target", &self.target)
            .field("mode", &self.mode)
            .field("closed", &self.closed)
            .field("cursor", &self.cursor)
            .finish()
    }
}
