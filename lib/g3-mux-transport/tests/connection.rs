/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use g3_mux_transport::native::StreamDirection;
use g3_mux_transport::pipe::PipeError;
use g3_mux_transport::{
    ConnectionError, DirectionOutcome, DiscardReason, ErrorCode, InvalidErrorCode, StreamDisposition,
    StreamError,
};

mod common;

#[tokio::test]
async fn connection_error_code() {
    let pair = common::connect_default();
    let conn = &pair.client;

    assert_eq!(conn.error_code(), ErrorCode::ZERO);
    assert_eq!(conn.set_error_code(-1).unwrap_err(), InvalidErrorCode(-1));
    assert_eq!(
        conn.set_error_code(1 << 62).unwrap_err(),
        InvalidErrorCode(1 << 62)
    );
    conn.set_error_code(258).unwrap();
    assert_eq!(conn.error_code(), ErrorCode::from_u32(258));
}

#[tokio::test]
async fn accept_cancelled() {
    let pair = common::connect_default();
    let cancel = CancellationToken::new();

    let c = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        c.cancel();
    });
    let r = pair.server.accept_inbound_stream(&cancel).await.unwrap();
    assert!(r.is_none());
    assert!(!pair.server.is_closed());
}

#[tokio::test]
async fn peer_close_with_code() {
    let pair = common::connect_default();
    let cancel = CancellationToken::new();

    pair.client.set_error_code(0x10c).unwrap();
    pair.client.close();

    let e = pair
        .server
        .accept_inbound_stream(&cancel)
        .await
        .unwrap_err();
    assert_eq!(
        e,
        ConnectionError::ConnectionReset(ErrorCode::from_u32(0x10c))
    );
    assert_eq!(pair.server.closed().await, e);
    assert!(
        pair.server
            .open_outbound_stream(StreamDirection::Bidirectional)
            .await
            .is_err()
    );
}

#[tokio::test]
async fn use_after_local_close() {
    let pair = common::connect_default();
    let cancel = CancellationToken::new();

    pair.server.close();
    assert_eq!(pair.server.close_reason(), Some(ConnectionError::Closed));
    assert_eq!(
        pair.server
            .accept_inbound_stream(&cancel)
            .await
            .unwrap_err(),
        ConnectionError::Disposed
    );
    assert_eq!(
        pair.server
            .open_outbound_stream(StreamDirection::Unidirectional)
            .await
            .unwrap_err(),
        ConnectionError::Disposed
    );
}

#[tokio::test]
async fn close_signal_fires_once() {
    let pair = common::connect_default();
    let count = Arc::new(AtomicUsize::new(0));

    let c = count.clone();
    pair.client.on_closed(move || {
        c.fetch_add(1, Ordering::Relaxed);
    });

    pair.client.abort("going away");
    pair.client.close();
    pair.client.abort("again");
    pair.client.dispose().await;
    pair.client.dispose().await;

    assert_eq!(count.load(Ordering::Relaxed), 1);
    assert_eq!(
        pair.client.close_reason(),
        Some(ConnectionError::ConnectionAborted(Arc::from("going away")))
    );
    assert!(pair.client.is_closed());
}

#[tokio::test]
async fn heartbeat_unregistered_on_close() {
    let pair = common::connect_default();
    assert_eq!(pair.heartbeat.registered_count(), 2);

    pair.client.dispose().await;
    assert_eq!(pair.heartbeat.registered_count(), 1);

    // the server side is closed by the peer
    let e = pair.server.closed().await;
    assert_eq!(e, ConnectionError::ConnectionReset(ErrorCode::ZERO));
    assert_eq!(pair.heartbeat.registered_count(), 0);
}

#[tokio::test]
async fn abort_propagates_to_streams() {
    let pair = common::connect_default();

    let mut s = pair
        .client
        .open_outbound_stream(StreamDirection::Bidirectional)
        .await
        .unwrap();
    let read = tokio::spawn(async move {
        let e = s.input().read().await.unwrap_err();
        (e, s)
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    pair.client.abort("going away");
    let (e, s) = read.await.unwrap();
    assert_eq!(
        e,
        PipeError::Failed(StreamError::ConnectionAborted(Arc::from("going away")))
    );
    s.closed().await;
    assert!(s.is_aborted());
    assert!(s.dispose().await != StreamDisposition::Pooled);
}

#[tokio::test]
async fn drop_disposes() {
    let pair = common::connect_default();
    let server = pair.server;
    let stats = pair.stats;
    assert_eq!(stats.alive_connection_count(), 2);

    drop(pair.client);
    let e = server.closed().await;
    assert_eq!(e.reset_code(), Some(ErrorCode::ZERO));

    drop(server);
    // the watcher task releases the connection once the signal fired
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(stats.alive_connection_count(), 0);
    assert_eq!(stats.snapshot().connection_total, 2);
}

#[tokio::test]
async fn dispose_waits_for_stream_loops() {
    let pair = common::connect_default();

    let s = pair
        .client
        .open_outbound_stream(StreamDirection::Bidirectional)
        .await
        .unwrap();
    assert_eq!(pair.client.running_stream_loops(), 2);
    assert_eq!(s.read_outcome(), None);

    pair.client.dispose().await;
    assert_eq!(pair.client.running_stream_loops(), 0);
    assert_eq!(s.read_outcome(), Some(DirectionOutcome::Aborted));
    assert_eq!(s.write_outcome(), Some(DirectionOutcome::Aborted));
    assert_eq!(
        s.dispose().await,
        StreamDisposition::Discarded(DiscardReason::NotReusable)
    );
}
