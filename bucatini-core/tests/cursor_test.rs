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

//! Integration tests for the generic cursor lifecycle: initialization,
//! batch draining, exhaustion, cleanup, mutator guards, transforms, and the
//! push-style stream adapter. All server traffic is scripted through the
//! crate's mock transport.

use bson::{doc, Document};
use bucatini_core::cursor::Cursor;
use bucatini_core::error::Error;
use bucatini_core::event::Namespace;
use bucatini_core::options::{CursorOptions, ReadPreference};
use bucatini_core::testing::{
    command_error, cursor_response, CommandSource, MockServer, MockTopology,
};
use futures::StreamExt;
use std::sync::Arc;

fn namespace() -> Namespace {
    Namespace::new("shop", "orders")
}

fn find_cursor(topology: Arc<MockTopology>, options: CursorOptions) -> Cursor {
    Cursor::new(
        topology,
        namespace(),
        options,
        Box::new(CommandSource::new("shop", doc! { "find": "orders" })),
    )
}

#[tokio::test]
async fn drains_batches_and_reports_exhaustion() {
    let server = MockServer::primary(8);
    server.enqueue_ok(cursor_response(
        42,
        "shop.orders",
        true,
        vec![doc! { "x": 1 }, doc! { "x": 2 }],
    ));
    // A zero id alongside a non-empty batch still drains before ending.
    server.enqueue_ok(cursor_response(0, "shop.orders", false, vec![doc! { "x": 3 }]));
    let topology = MockTopology::new(Arc::clone(&server));
    let mut cursor = find_cursor(topology, CursorOptions::default());

    assert_eq!(cursor.next().await.unwrap(), Some(doc! { "x": 1 }));
    assert_eq!(cursor.next().await.unwrap(), Some(doc! { "x": 2 }));
    assert_eq!(cursor.next().await.unwrap(), Some(doc! { "x": 3 }));
    assert_eq!(cursor.next().await.unwrap(), None);

    assert!(cursor.is_closed());
    assert!(cursor.is_exhausted());
    // The cursor ended naturally, so no killCursors went out.
    assert!(server.commands_named("killCursors").is_empty());

    // Iterating past a reported exhaustion is a caller bug.
    assert!(matches!(cursor.next().await, Err(Error::CursorExhausted)));
    assert_eq!(cursor.try_next().await.unwrap(), None);
}

#[tokio::test]
async fn try_next_returns_none_on_an_empty_batch() {
    let server = MockServer::primary(8);
    server.enqueue_ok(cursor_response(42, "shop.orders", true, vec![]));
    server.enqueue_ok(cursor_response(42, "shop.orders", false, vec![]));
    server.enqueue_ok(cursor_response(42, "shop.orders", false, vec![doc! { "x": 1 }]));
    let topology = MockTopology::new(Arc::clone(&server));
    let mut cursor = find_cursor(topology, CursorOptions::default());

    assert_eq!(cursor.try_next().await.unwrap(), None);
    assert!(!cursor.is_closed());
    assert_eq!(cursor.try_next().await.unwrap(), Some(doc! { "x": 1 }));
}

#[tokio::test]
async fn mutators_fail_once_the_cursor_is_in_use() {
    let server = MockServer::primary(8);
    server.enqueue_ok(cursor_response(42, "shop.orders", true, vec![doc! { "x": 1 }]));
    let topology = MockTopology::new(server);
    let mut cursor = find_cursor(topology, CursorOptions::default());

    cursor.set_batch_size(10).unwrap();
    cursor.set_read_preference(ReadPreference::SecondaryPreferred).unwrap();

    cursor.next().await.unwrap();

    assert!(matches!(cursor.set_batch_size(20), Err(Error::CursorInUse)));
    assert!(matches!(
        cursor.set_read_concern(doc! { "level": "majority" }),
        Err(Error::CursorInUse)
    ));
    assert!(matches!(cursor.map(Ok), Err(Error::CursorInUse)));
}

#[tokio::test]
async fn tailable_cursors_reject_batch_size_changes() {
    let server = MockServer::primary(8);
    let topology = MockTopology::new(server);
    let options = CursorOptions {
        tailable: true,
        await_data: true,
        ..Default::default()
    };
    let mut cursor = find_cursor(topology, options);

    assert!(matches!(
        cursor.set_batch_size(10),
        Err(Error::TailableCursor { .. })
    ));
}

#[tokio::test]
async fn transforms_compose_in_application_order() {
    let server = MockServer::primary(8);
    server.enqueue_ok(cursor_response(0, "shop.orders", true, vec![doc! { "x": 1 }]));
    let topology = MockTopology::new(server);
    let mut cursor = find_cursor(topology, CursorOptions::default());

    cursor
        .map(|mut document| {
            document.insert("first", true);
            Ok(document)
        })
        .unwrap();
    cursor
        .map(|mut document| {
            let saw_first = document.contains_key("first");
            document.insert("second", saw_first);
            Ok(document)
        })
        .unwrap();

    let document = cursor.next().await.unwrap().unwrap();
    assert_eq!(document.get_bool("first").unwrap(), true);
    assert_eq!(document.get_bool("second").unwrap(), true);
}

#[tokio::test]
async fn has_next_applies_transforms_exactly_once() {
    let server = MockServer::primary(8);
    server.enqueue_ok(cursor_response(0, "shop.orders", true, vec![doc! { "n": 0 }]));
    let topology = MockTopology::new(server);
    let mut cursor = find_cursor(topology, CursorOptions::default());

    cursor
        .map(|mut document| {
            let n = document.get_i32("n").unwrap_or(0);
            document.insert("n", n + 1);
            Ok(document)
        })
        .unwrap();

    assert!(cursor.has_next().await.unwrap());
    let document = cursor.next().await.unwrap().unwrap();
    assert_eq!(document.get_i32("n").unwrap(), 1);
}

#[tokio::test]
async fn close_kills_a_live_cursor_exactly_once() {
    let server = MockServer::primary(8);
    server.enqueue_ok(cursor_response(42, "shop.orders", true, vec![doc! { "x": 1 }]));
    server.enqueue_ok(doc! { "ok": 1 });
    let topology = MockTopology::new(Arc::clone(&server));
    let mut cursor = find_cursor(topology, CursorOptions::default());

    cursor.next().await.unwrap();
    cursor.close().await;
    cursor.close().await;

    let kills = server.commands_named("killCursors");
    assert_eq!(kills.len(), 1);
    assert_eq!(kills[0].get_str("killCursors").unwrap(), "orders");
    assert_eq!(
        kills[0].get_array("cursors").unwrap(),
        &vec![bson::Bson::Int64(42)]
    );
    assert!(cursor.is_closed());
    assert!(cursor.is_killed());
}

#[tokio::test]
async fn closed_cursors_end_iteration_without_draining() {
    let server = MockServer::primary(8);
    server.enqueue_ok(cursor_response(
        42,
        "shop.orders",
        true,
        vec![doc! { "x": 1 }, doc! { "x": 2 }],
    ));
    server.enqueue_ok(doc! { "ok": 1 });
    let topology = MockTopology::new(server);
    let mut cursor = find_cursor(topology, CursorOptions::default());

    assert_eq!(cursor.next().await.unwrap(), Some(doc! { "x": 1 }));
    cursor.close().await;

    // One document is still buffered, but iteration after close ends.
    assert_eq!(cursor.buffered_count(), 1);
    assert_eq!(cursor.next().await.unwrap(), None);
}

#[tokio::test]
async fn network_errors_on_load_balanced_topologies_skip_kill_cursors() {
    let server = MockServer::load_balanced(8);
    server.enqueue_ok(cursor_response(42, "shop.orders", true, vec![]));
    server.enqueue_error(Error::network("connection reset by peer"));
    let topology = MockTopology::load_balanced(Arc::clone(&server));
    let mut cursor = find_cursor(topology, CursorOptions::default());

    let error = cursor.next().await.unwrap_err();
    assert!(matches!(error, Error::Network { .. }));
    assert!(cursor.is_closed());
    assert!(!cursor.is_killed());
    assert!(server.commands_named("killCursors").is_empty());
}

#[tokio::test]
async fn network_errors_on_plain_topologies_still_kill() {
    let server = MockServer::primary(8);
    server.enqueue_ok(cursor_response(42, "shop.orders", true, vec![]));
    server.enqueue_error(Error::network("connection reset by peer"));
    server.enqueue_ok(doc! { "ok": 1 });
    let topology = MockTopology::new(Arc::clone(&server));
    let mut cursor = find_cursor(topology, CursorOptions::default());

    cursor.next().await.unwrap_err();
    assert_eq!(server.commands_named("killCursors").len(), 1);
}

#[tokio::test]
async fn cursorless_responses_are_buffered_whole() {
    let server = MockServer::primary(8);
    server.enqueue_ok(doc! { "ok": 1, "queryPlanner": { "winningPlan": "COLLSCAN" } });
    let topology = MockTopology::new(server);
    let mut cursor = find_cursor(topology, CursorOptions::default());

    let document = cursor.next().await.unwrap().unwrap();
    assert!(document.contains_key("queryPlanner"));
    assert_eq!(cursor.next().await.unwrap(), None);
}

#[tokio::test]
async fn rewind_resets_for_a_fresh_execution() {
    let server = MockServer::primary(8);
    server.enqueue_ok(cursor_response(0, "shop.orders", true, vec![doc! { "run": 1 }]));
    server.enqueue_ok(cursor_response(0, "shop.orders", true, vec![doc! { "run": 2 }]));
    let topology = MockTopology::new(Arc::clone(&server));
    let mut cursor = find_cursor(Arc::clone(&topology), CursorOptions::default());

    assert_eq!(cursor.next().await.unwrap(), Some(doc! { "run": 1 }));
    assert_eq!(cursor.next().await.unwrap(), None);

    cursor.rewind();
    assert!(!cursor.is_initialized());
    assert!(!cursor.is_closed());

    assert_eq!(cursor.next().await.unwrap(), Some(doc! { "run": 2 }));
    // Each execution acquired its own implicit session.
    assert_eq!(topology.sessions_started(), 2);
}

#[tokio::test]
async fn implicit_sessions_end_with_the_cursor() {
    let server = MockServer::primary(8);
    server.enqueue_ok(cursor_response(0, "shop.orders", true, vec![doc! { "x": 1 }]));
    let topology = MockTopology::new(server);
    let mut cursor = find_cursor(Arc::clone(&topology), CursorOptions::default());

    cursor.next().await.unwrap();
    let session = cursor.session().expect("implicit session acquired");
    assert!(session.is_implicit());
    assert!(!session.is_ended());

    cursor.close().await;
    assert!(cursor.session().unwrap().is_ended());
    assert_eq!(topology.sessions_started(), 1);
}

#[tokio::test]
async fn failed_initialization_surfaces_and_closes() {
    let server = MockServer::primary(8);
    server.enqueue_error(Error::network_handshake("tls negotiation failed"));
    let topology = MockTopology::new(server);
    let mut cursor = find_cursor(topology, CursorOptions::default());

    let error = cursor.next().await.unwrap_err();
    assert!(matches!(error, Error::Network { handshake: true, .. }));
    assert!(cursor.is_initialized());
    assert!(cursor.is_closed());
    assert_eq!(cursor.next().await.unwrap(), None);
}

#[tokio::test]
async fn get_more_server_errors_surface_with_their_code() {
    let server = MockServer::primary(8);
    server.enqueue_ok(cursor_response(42, "shop.orders", true, vec![]));
    server.enqueue_ok(command_error(96, "OperationFailed", "boom", &[]));
    let topology = MockTopology::new(server);
    let mut cursor = find_cursor(topology, CursorOptions::default());

    let error = cursor.next().await.unwrap_err();
    assert_eq!(error.code(), Some(96));
}

#[tokio::test]
async fn stream_adapter_yields_documents_then_ends() {
    let server = MockServer::primary(8);
    server.enqueue_ok(cursor_response(42, "shop.orders", true, vec![doc! { "x": 1 }]));
    server.enqueue_ok(cursor_response(0, "shop.orders", false, vec![]));
    let topology = MockTopology::new(server);
    let cursor = find_cursor(topology, CursorOptions::default());

    let mut stream = cursor.stream();
    assert_eq!(stream.next().await.unwrap().unwrap(), doc! { "x": 1 });
    assert!(stream.next().await.is_none());
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn stream_adapter_ends_silently_when_the_server_interrupts() {
    let server = MockServer::primary(8);
    server.enqueue_ok(cursor_response(42, "shop.orders", true, vec![]));
    server.enqueue_ok(command_error(11601, "Interrupted", "operation was interrupted", &[]));
    let topology = MockTopology::new(server);
    let cursor = find_cursor(topology, CursorOptions::default());

    let mut stream = cursor.stream();
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn stream_adapter_propagates_real_failures() {
    let server = MockServer::primary(8);
    server.enqueue_ok(cursor_response(42, "shop.orders", true, vec![]));
    server.enqueue_ok(command_error(18, "AuthenticationFailed", "auth failed", &[]));
    let topology = MockTopology::new(server);
    let cursor = find_cursor(topology, CursorOptions::default());

    let mut stream = cursor.stream();
    let error = stream.next().await.unwrap().unwrap_err();
    assert_eq!(error.code(), Some(18));
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn collect_all_drains_to_completion() {
    let server = MockServer::primary(8);
    server.enqueue_ok(cursor_response(42, "shop.orders", true, vec![doc! { "x": 1 }]));
    server.enqueue_ok(cursor_response(
        0,
        "shop.orders",
        false,
        vec![doc! { "x": 2 }, doc! { "x": 3 }],
    ));
    let topology = MockTopology::new(server);
    let mut cursor = find_cursor(topology, CursorOptions::default());

    let documents = cursor.collect_all().await.unwrap();
    assert_eq!(documents.len(), 3);
    assert_eq!(documents[2], doc! { "x": 3 });
}

#[tokio::test]
async fn for_each_stops_when_the_callback_says_so() {
    let server = MockServer::primary(8);
    server.enqueue_ok(cursor_response(
        42,
        "shop.orders",
        true,
        vec![doc! { "x": 1 }, doc! { "x": 2 }, doc! { "x": 3 }],
    ));
    let topology = MockTopology::new(server);
    let mut cursor = find_cursor(topology, CursorOptions::default());

    let mut seen: Vec<Document> = Vec::new();
    cursor
        .for_each(|document| {
            seen.push(document);
            seen.len() < 2
        })
        .await
        .unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(cursor.buffered_count(), 1);
}
