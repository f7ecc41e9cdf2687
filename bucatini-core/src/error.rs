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

//! Error types for the driver core.
//!
//! All fallible operations in this crate return [`Error`]. The change-stream
//! engine additionally consults [`Error::is_resumable`] to decide whether a
//! failure can be recovered by reconstructing the cursor from the cached
//! resume token, or must be surfaced to the consumer.
//!
//! Resumability is decided from structured error data only: error labels on
//! servers new enough to attach them, and a fixed code table for older
//! servers. Message matching is deliberately not used.

use thiserror::Error;

/// Label attached by newer servers to errors that a change stream may
/// recover from by resuming.
pub const RESUMABLE_CHANGE_STREAM_LABEL: &str = "ResumableChangeStreamError";

/// Label attached to errors that must never be recovered by resuming, such
/// as a resume token that has aged out of the oplog.
pub const NON_RESUMABLE_CHANGE_STREAM_LABEL: &str = "NonResumableChangeStreamError";

/// Label attached to transient transaction failures; forces a session unpin
/// on load-balanced topologies.
pub const TRANSIENT_TRANSACTION_LABEL: &str = "TransientTransactionError";

/// Wire version at which servers classify change-stream resumability with
/// explicit error labels instead of error codes.
pub const RESUME_LABEL_WIRE_VERSION: i32 = 9;

/// Server error codes that permit a change-stream resume on servers that
/// predate [`RESUME_LABEL_WIRE_VERSION`]: host unreachable/not found,
/// cursor-not-found, the not-primary and node-is-recovering families,
/// shutdown and interruption during failover, and stale shard metadata.
const GET_MORE_RESUMABLE_CODES: &[i32] = &[
    6,     // HostUnreachable
    7,     // HostNotFound
    43,    // CursorNotFound
    63,    // StaleShardVersion
    89,    // NetworkTimeout
    91,    // ShutdownInProgress
    133,   // FailedToSatisfyReadPreference
    150,   // PrimarySteppedDown
    189,   // PrimarySteppedDown (legacy)
    234,   // RetryChangeStream
    262,   // ExceededTimeLimit
    9001,  // SocketException
    10107, // NotWritablePrimary
    11600, // InterruptedAtShutdown
    11602, // InterruptedDueToReplStateChange
    13388, // StaleConfig
    13435, // NotPrimaryNoSecondaryOk
    13436, // NotPrimaryOrSecondary
];

/// Errors produced by cursors, change streams, and the transport seams they
/// depend on.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An operation was attempted on a closed change stream.
    #[error("change stream is closed")]
    ChangeStreamClosed,

    /// The server delivered a change document without an `_id`, so the
    /// stream has no token to resume from past this point.
    #[error("change document has no _id resume token")]
    NoResumeToken,

    /// The engine has no cursor to operate on.
    #[error("change stream has no active cursor")]
    NoCursor,

    /// Pull and push consumption were mixed on one change stream.
    #[error("change stream is already being consumed in the other mode")]
    ModeConflict,

    /// The selected server does not support a requested feature.
    #[error("incompatible server: {message}")]
    Compatibility { message: String },

    /// A transport-level failure. `handshake` marks errors raised before the
    /// connection handshake completed; those are never resumable.
    #[error("network error: {message}")]
    Network { message: String, handshake: bool },

    /// A transport-level timeout.
    #[error("network timeout: {message}")]
    NetworkTimeout { message: String },

    /// The server reported a command failure.
    #[error("command failed with code {code} ({code_name}): {message}")]
    Server {
        code: i32,
        code_name: String,
        message: String,
        labels: Vec<String>,
    },

    /// An internal invariant failed, such as a malformed server response.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// A caller-supplied option was invalid; raised synchronously at the API
    /// boundary.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A cursor option was mutated after the cursor had been initialized.
    #[error("cursor is already in use; options can no longer be changed")]
    CursorInUse,

    /// `next` was called on a cursor that already reported exhaustion.
    #[error("cursor is exhausted")]
    CursorExhausted,

    /// An operation that tailable cursors do not support.
    #[error("tailable cursors do not support {operation}")]
    TailableCursor { operation: &'static str },

    /// No suitable server became available within the selection timeout.
    #[error("server selection timed out after {waited_ms}ms")]
    ServerSelection { waited_ms: u64 },
}

impl Error {
    /// Convenience constructor for a post-handshake network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            handshake: false,
        }
    }

    /// Convenience constructor for a network error raised during the
    /// connection handshake.
    pub fn network_handshake(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            handshake: true,
        }
    }

    /// The server error code, if this error carries one.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Server { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Error labels attached by the server. Empty for local errors.
    pub fn labels(&self) -> &[String] {
        match self {
            Self::Server { labels, .. } => labels,
            _ => &[],
        }
    }

    /// Whether the server attached the given error label.
    pub fn has_label(&self, label: &str) -> bool {
        self.labels().iter().any(|l| l == label)
    }

    /// Whether this is a transport-level failure.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::NetworkTimeout { .. })
    }

    /// Short category tag for logs and diagnostics.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::ChangeStreamClosed => "closed",
            Self::NoResumeToken => "no_resume_token",
            Self::NoCursor => "no_cursor",
            Self::ModeConflict => "mode_conflict",
            Self::Compatibility { .. } => "compatibility",
            Self::Network { .. } => "network",
            Self::NetworkTimeout { .. } => "network_timeout",
            Self::Server { .. } => "server",
            Self::Runtime(_) => "runtime",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::CursorInUse => "cursor_in_use",
            Self::CursorExhausted => "cursor_exhausted",
            Self::TailableCursor { .. } => "tailable",
            Self::ServerSelection { .. } => "server_selection",
        }
    }

    /// Decides whether a change stream may recover from this error by
    /// resuming against `wire_version`, the protocol version of the server
    /// that produced the failing cursor.
    ///
    /// Network errors are resumable unless they happened during the
    /// connection handshake. Server errors are resumable per the
    /// [`RESUMABLE_CHANGE_STREAM_LABEL`] on servers at wire version
    /// [`RESUME_LABEL_WIRE_VERSION`] or newer, and per the getMore code table
    /// on older servers. An explicit
    /// [`NON_RESUMABLE_CHANGE_STREAM_LABEL`] always wins. Everything else is
    /// terminal.
    #[must_use]
    pub fn is_resumable(&self, wire_version: i32) -> bool {
        if self.has_label(NON_RESUMABLE_CHANGE_STREAM_LABEL) {
            return false;
        }

        match self {
            Self::Network { handshake, .. } => !handshake,
            Self::NetworkTimeout { .. } => true,
            Self::Server { code, labels, .. } => {
                if wire_version >= RESUME_LABEL_WIRE_VERSION {
                    labels.iter().any(|l| l == RESUMABLE_CHANGE_STREAM_LABEL)
                } else {
                    GET_MORE_RESUMABLE_CODES.contains(code)
                }
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_error(code: i32, labels: &[&str]) -> Error {
        Error::Server {
            code,
            code_name: String::new(),
            message: "test".to_string(),
            labels: labels.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn network_errors_are_resumable() {
        assert!(Error::network("connection reset").is_resumable(8));
        assert!(Error::network("connection reset").is_resumable(9));
        assert!(Error::NetworkTimeout {
            message: "timed out".to_string()
        }
        .is_resumable(8));
    }

    #[test]
    fn handshake_network_errors_are_not_resumable() {
        assert!(!Error::network_handshake("tls failure").is_resumable(9));
    }

    #[test]
    fn old_servers_use_the_code_table() {
        assert!(server_error(43, &[]).is_resumable(8));
        assert!(server_error(10107, &[]).is_resumable(8));
        assert!(server_error(13436, &[]).is_resumable(8));
        // Authentication failure is never in the table.
        assert!(!server_error(18, &[]).is_resumable(8));
    }

    #[test]
    fn new_servers_use_labels_only() {
        // Code 6 is in the table, but wire 9 servers must label explicitly.
        assert!(!server_error(6, &[]).is_resumable(9));
        assert!(server_error(6, &[RESUMABLE_CHANGE_STREAM_LABEL]).is_resumable(9));
        assert!(server_error(9999, &[RESUMABLE_CHANGE_STREAM_LABEL]).is_resumable(9));
    }

    #[test]
    fn non_resumable_label_always_wins() {
        let error = server_error(
            43,
            &[RESUMABLE_CHANGE_STREAM_LABEL, NON_RESUMABLE_CHANGE_STREAM_LABEL],
        );
        assert!(!error.is_resumable(8));
        assert!(!error.is_resumable(9));
    }

    #[test]
    fn local_errors_are_terminal() {
        assert!(!Error::ChangeStreamClosed.is_resumable(9));
        assert!(!Error::NoResumeToken.is_resumable(9));
        assert!(!Error::InvalidArgument("bad".to_string()).is_resumable(9));
        assert!(!Error::Runtime("broken".to_string()).is_resumable(9));
    }

    #[test]
    fn categories_are_stable() {
        assert_eq!(Error::ChangeStreamClosed.category(), "closed");
        assert_eq!(Error::network("x").category(), "network");
        assert_eq!(server_error(1, &[]).category(), "server");
    }
}
