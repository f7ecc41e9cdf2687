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

//! Options for change streams and the cursors beneath them.
//!
//! [`ChangeStreamOptions`] is validated at construction: at most one of the
//! restart anchors (`resumeAfter`, `startAfter`, `startAtOperationTime`) may
//! be present, and the builder rejects violations synchronously rather than
//! letting the server do it one round-trip later.

use crate::error::Error;
use crate::event::ResumeToken;
use bson::{Bson, Document, Timestamp};
use std::time::Duration;

/// How much of the affected document a change event should carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullDocumentType {
    /// Look up and attach the current document on updates.
    UpdateLookup,
    /// Attach the post-image when the collection records one.
    WhenAvailable,
    /// Require the post-image; the event fails without one.
    Required,
}

impl FullDocumentType {
    /// Wire-format name of this lookup mode.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UpdateLookup => "updateLookup",
            Self::WhenAvailable => "whenAvailable",
            Self::Required => "required",
        }
    }
}

/// Which servers an operation may be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadPreference {
    /// Only the primary.
    #[default]
    Primary,
    /// The primary if available, otherwise a secondary.
    PrimaryPreferred,
    /// Only secondaries.
    Secondary,
    /// A secondary if available, otherwise the primary.
    SecondaryPreferred,
    /// The lowest-latency member.
    Nearest,
}

impl ReadPreference {
    /// Wire-format mode name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::PrimaryPreferred => "primaryPreferred",
            Self::Secondary => "secondary",
            Self::SecondaryPreferred => "secondaryPreferred",
            Self::Nearest => "nearest",
        }
    }
}

/// Behavior flags a cursor can request from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorFlag {
    /// Keep the cursor open after the current data is exhausted.
    Tailable,
    /// Block `getMore` on the server until data arrives or the await time
    /// elapses. Only meaningful with [`CursorFlag::Tailable`].
    AwaitData,
    /// Exempt the cursor from server-side idle timeouts.
    NoCursorTimeout,
}

/// Options governing a generic server cursor.
#[derive(Debug, Clone, Default)]
pub struct CursorOptions {
    /// Documents per batch. The engine defaults `getMore` batches when unset.
    pub batch_size: Option<u32>,

    /// Server-side time limit for the originating command.
    pub max_time: Option<Duration>,

    /// Server-side wait for tailable await-data cursors; bounds each
    /// `getMore`.
    pub max_await_time: Option<Duration>,

    /// Caller comment attached to cursor commands.
    pub comment: Option<Bson>,

    /// Routing preference for the originating command.
    pub read_preference: Option<ReadPreference>,

    /// Read concern for the originating command.
    pub read_concern: Option<Document>,

    /// Cursor survives batch exhaustion.
    pub tailable: bool,

    /// Server blocks `getMore` until data or timeout.
    pub await_data: bool,

    /// Cursor is exempt from idle timeouts.
    pub no_cursor_timeout: bool,
}

/// Options recognized by a change stream.
///
/// Use [`ChangeStreamOptions::builder`] to construct instances:
///
/// ```rust
/// use bucatini_core::options::{ChangeStreamOptions, FullDocumentType};
///
/// let options = ChangeStreamOptions::builder()
///     .full_document(FullDocumentType::UpdateLookup)
///     .batch_size(100)
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone, Default)]
pub struct ChangeStreamOptions {
    /// Post-image behavior for update events.
    pub full_document: Option<FullDocumentType>,

    /// Resume the stream just after the event this token marks.
    pub resume_after: Option<ResumeToken>,

    /// Start the stream at the event this token marks, surviving an
    /// invalidate at that position.
    pub start_after: Option<ResumeToken>,

    /// Start the stream at a cluster timestamp.
    pub start_at_operation_time: Option<Timestamp>,

    /// Documents per batch.
    pub batch_size: Option<u32>,

    /// Server-side wait per `getMore` before returning an empty batch.
    pub max_await_time: Option<Duration>,

    /// Collation for the aggregation.
    pub collation: Option<Document>,

    /// Routing preference for the stream.
    pub read_preference: Option<ReadPreference>,

    /// Caller comment attached to the stream's commands.
    pub comment: Option<Bson>,

    /// How long a resume attempt may wait for the topology to reconnect.
    /// Defaults to 30 seconds.
    pub selection_timeout: Option<Duration>,
}

impl ChangeStreamOptions {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> ChangeStreamOptionsBuilder {
        ChangeStreamOptionsBuilder::default()
    }

    /// Validates the option set.
    ///
    /// Returns [`Error::InvalidArgument`] when more than one of
    /// `resume_after`, `start_after`, and `start_at_operation_time` is set;
    /// the server accepts at most one restart anchor.
    pub fn validate(&self) -> Result<(), Error> {
        let anchors = usize::from(self.resume_after.is_some())
            + usize::from(self.start_after.is_some())
            + usize::from(self.start_at_operation_time.is_some());
        if anchors > 1 {
            return Err(Error::InvalidArgument(
                "at most one of resumeAfter, startAfter, and startAtOperationTime may be set"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Whether any restart anchor is present.
    pub(crate) fn has_restart_anchor(&self) -> bool {
        self.resume_after.is_some()
            || self.start_after.is_some()
            || self.start_at_operation_time.is_some()
    }

    /// The cursor options a change stream runs with: tailable, await-data,
    /// carrying over the batch and wait settings.
    pub(crate) fn cursor_options(&self) -> CursorOptions {
        CursorOptions {
            batch_size: self.batch_size,
            max_time: None,
            max_await_time: self.max_await_time,
            comment: self.comment.clone(),
            read_preference: self.read_preference,
            read_concern: None,
            tailable: true,
            await_data: true,
            no_cursor_timeout: false,
        }
    }
}

/// Builder for [`ChangeStreamOptions`].
#[derive(Debug, Default)]
pub struct ChangeStreamOptionsBuilder {
    options: ChangeStreamOptions,
}

impl ChangeStreamOptionsBuilder {
    /// Sets the post-image behavior for update events.
    #[must_use]
    pub fn full_document(mut self, full_document: FullDocumentType) -> Self {
        self.options.full_document = Some(full_document);
        self
    }

    /// Resume just after the event the token marks.
    #[must_use]
    pub fn resume_after(mut self, token: ResumeToken) -> Self {
        self.options.resume_after = Some(token);
        self
    }

    /// Start at the event the token marks.
    #[must_use]
    pub fn start_after(mut self, token: ResumeToken) -> Self {
        self.options.start_after = Some(token);
        self
    }

    /// Start at a cluster timestamp.
    #[must_use]
    pub fn start_at_operation_time(mut self, timestamp: Timestamp) -> Self {
        self.options.start_at_operation_time = Some(timestamp);
        self
    }

    /// Sets the per-batch document count.
    #[must_use]
    pub fn batch_size(mut self, batch_size: u32) -> Self {
        self.options.batch_size = Some(batch_size);
        self
    }

    /// Sets the server-side wait per `getMore`.
    #[must_use]
    pub fn max_await_time(mut self, max_await_time: Duration) -> Self {
        self.options.max_await_time = Some(max_await_time);
        self
    }

    /// Sets the collation for the aggregation.
    #[must_use]
    pub fn collation(mut self, collation: Document) -> Self {
        self.options.collation = Some(collation);
        self
    }

    /// Sets the routing preference.
    #[must_use]
    pub fn read_preference(mut self, read_preference: ReadPreference) -> Self {
        self.options.read_preference = Some(read_preference);
        self
    }

    /// Attaches a caller comment to the stream's commands.
    #[must_use]
    pub fn comment(mut self, comment: impl Into<Bson>) -> Self {
        self.options.comment = Some(comment.into());
        self
    }

    /// Bounds how long each resume attempt waits for the topology.
    #[must_use]
    pub fn selection_timeout(mut self, selection_timeout: Duration) -> Self {
        self.options.selection_timeout = Some(selection_timeout);
        self
    }

    /// Builds the options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if more than one restart anchor is
    /// set.
    pub fn build(self) -> Result<ChangeStreamOptions, Error> {
        self.options.validate()?;
        Ok(self.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn default_options_are_valid() {
        let options = ChangeStreamOptions::builder().build().unwrap();
        assert!(options.full_document.is_none());
        assert!(!options.has_restart_anchor());
    }

    #[test]
    fn one_restart_anchor_is_allowed() {
        let options = ChangeStreamOptions::builder()
            .resume_after(ResumeToken::from_document(doc! { "_data": "82" }))
            .build()
            .unwrap();
        assert!(options.has_restart_anchor());
    }

    #[test]
    fn two_restart_anchors_are_rejected() {
        let result = ChangeStreamOptions::builder()
            .resume_after(ResumeToken::from_document(doc! { "_data": "82" }))
            .start_at_operation_time(Timestamp { time: 5, increment: 0 })
            .build();
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn cursor_options_are_tailable_await_data() {
        let options = ChangeStreamOptions::builder()
            .batch_size(64)
            .max_await_time(Duration::from_secs(1))
            .build()
            .unwrap();
        let cursor_options = options.cursor_options();
        assert!(cursor_options.tailable);
        assert!(cursor_options.await_data);
        assert_eq!(cursor_options.batch_size, Some(64));
        assert_eq!(cursor_options.max_await_time, Some(Duration::from_secs(1)));
    }
}
