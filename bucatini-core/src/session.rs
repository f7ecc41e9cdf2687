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

//! Client sessions and their ownership rules.
//!
//! A cursor that creates its own (implicit) session must end it during
//! cleanup, exactly once. A session handed in by the caller (explicit) is
//! never ended by the cursor. On load-balanced topologies the session is
//! additionally pinned to its connection for the cursor's lifetime.

use bson::{doc, Document};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Who is responsible for ending a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOwner {
    /// Created by a cursor for its own use; the cursor ends it.
    Implicit,
    /// Created by the caller; the caller ends it.
    Explicit,
}

/// A logical session attached to cursor operations.
#[derive(Debug)]
pub struct ClientSession {
    lsid: Document,
    owner: SessionOwner,
    ended: bool,
    pinned: bool,
}

impl ClientSession {
    /// Creates a session with the given owner. Session ids are issued
    /// process-locally; id negotiation with the server belongs to the
    /// transport layer.
    pub fn with_owner(owner: SessionOwner) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            lsid: doc! { "id": id as i64 },
            owner,
            ended: false,
            pinned: false,
        }
    }

    /// Creates an implicit session, owned by the cursor that requested it.
    pub fn implicit() -> Self {
        Self::with_owner(SessionOwner::Implicit)
    }

    /// Creates an explicit session, owned by the caller.
    pub fn explicit() -> Self {
        Self::with_owner(SessionOwner::Explicit)
    }

    /// The session id document sent alongside commands.
    pub fn lsid(&self) -> &Document {
        &self.lsid
    }

    /// Whether this session is implicitly owned by its cursor.
    pub fn is_implicit(&self) -> bool {
        self.owner == SessionOwner::Implicit
    }

    /// Whether the session has been ended.
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Ends the session. Idempotent.
    pub fn end(&mut self) {
        self.ended = true;
    }

    /// Pins the session to its current connection (load-balanced mode).
    pub fn pin(&mut self) {
        self.pinned = true;
    }

    /// Releases the connection pin.
    pub fn unpin(&mut self) {
        self.pinned = false;
    }

    /// Whether the session is pinned to a connection.
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }
}
