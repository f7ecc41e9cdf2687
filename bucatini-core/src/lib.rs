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

//! Bucatini core — the change-stream engine of a document-database driver.
//!
//! This crate implements the cursor and change-stream machinery that sits
//! between a consumer and the wire: the generic server-cursor lifecycle
//! (initialize, `getMore`, drain, kill), and on top of it resumable change
//! streams that survive network failures and failovers without the consumer
//! noticing.
//!
//! # Key components
//!
//! - [`cursor::Cursor`] — a generic server cursor with pull and push
//!   consumption.
//! - [`change_stream::ChangeStream`] — a resumable subscription to change
//!   events, with automatic cursor reconstruction from the cached resume
//!   token.
//! - [`topology::Topology`] / [`server::ServerHandle`] — the seams to the
//!   monitoring and transport layers, which live outside this crate.
//! - [`testing`] — scripted doubles for those seams.
//!
//! # Example
//!
//! ```rust,no_run
//! use bucatini_core::{ChangeStream, ChangeStreamOptions, WatchTarget};
//! use bucatini_core::topology::Topology;
//! use std::sync::Arc;
//!
//! # async fn example(topology: Arc<dyn Topology>) -> Result<(), bucatini_core::Error> {
//! let mut stream = ChangeStream::new(
//!     topology,
//!     WatchTarget::collection("shop", "orders"),
//!     Vec::new(),
//!     ChangeStreamOptions::default(),
//! )?;
//!
//! loop {
//!     let event = stream.next().await?;
//!     println!("{} on {:?}", event.operation.as_str(), event.namespace);
//! }
//! # }
//! ```

pub mod change_stream;
pub mod cursor;
pub mod error;
pub mod event;
pub mod options;
pub mod server;
pub mod session;
pub mod testing;
pub mod topology;

pub use change_stream::{ChangeStream, ChangeStreamCursor, StreamEvent, WatchTarget};
pub use cursor::{Cursor, CursorSource, CursorSpec, DocumentStream, OperationContext};
pub use error::Error;
pub use event::{ChangeEvent, Namespace, OperationType, ResumeToken, UpdateDescription};
pub use options::{ChangeStreamOptions, CursorOptions, FullDocumentType, ReadPreference};
pub use server::{CursorBatch, GetMoreOptions, ServerHandle};
pub use session::{ClientSession, SessionOwner};
pub use topology::{SelectionCriteria, ServerDescription, ServerType, Topology};
