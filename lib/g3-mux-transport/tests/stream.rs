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
    DirectionOutcome, DiscardReason, ErrorCode, InvalidErrorCode, StreamDisposition, StreamError,
};

mod common;

#[tokio::test]
async fn graceful_close_and_reuse() {
    let pair = common::connect_default();
    let cancel = CancellationToken::new();

    let mut s = pair
        .client
        .open_outbound_stream(StreamDirection::Bidirectional)
        .await
        .unwrap();
    assert_eq!(s.id(), 0);
    assert_eq!(
        s.connection_id(),
        format!("{}:{}", pair.client.id(), s.id())
    );
    let slot_id = s.slot_id();

    let flush = s.output().write(b"Hello world").await.unwrap();
    assert!(!flush.completed);
    s.output().complete(None);

    let mut t = pair
        .server
        .accept_inbound_stream(&cancel)
        .await
        .unwrap()
        .unwrap();
    let data = t.input().read_to_end().await.unwrap();
    assert_eq!(data.as_ref(), b"Hello world");
    t.output().complete(None);
    assert_eq!(t.dispose().await, StreamDisposition::Pooled);
    assert_eq!(pair.server.pooled_stream_count(), 1);

    let data = s.input().read_to_end().await.unwrap();
    assert!(data.is_empty());
    s.closed().await;
    assert!(s.is_gracefully_closed());
    assert_eq!(s.dispose().await, StreamDisposition::Pooled);
    assert_eq!(pair.client.pooled_stream_count(), 1);

    let s = pair
        .client
        .open_outbound_stream(StreamDirection::Bidirectional)
        .await
        .unwrap();
    assert_eq!(s.slot_id(), slot_id);
    assert_eq!(s.id(), 4);
    assert_eq!(pair.client.pooled_stream_count(), 0);

    let snapshot = pair.stats.snapshot();
    assert_eq!(snapshot.stream_created, 2);
    assert_eq!(snapshot.stream_reused, 1);
    assert_eq!(snapshot.stream_pooled, 2);
}

#[tokio::test]
async fn persistent_state_survives_reuse() {
    let pair = common::connect_default();

    let mut s = pair
        .client
        .open_outbound_stream(StreamDirection::Unidirectional)
        .await
        .unwrap();
    s.persistent_state_mut().insert("k", "v".to_string());
    s.items_mut().insert("request", 1u32);
    s.output().complete(None);
    assert_eq!(s.dispose().await, StreamDisposition::Pooled);

    let s = pair
        .client
        .open_outbound_stream(StreamDirection::Bidirectional)
        .await
        .unwrap();
    assert_eq!(
        s.persistent_state().get::<String>("k").map(|s| s.as_str()),
        Some("v")
    );
    assert!(s.items().is_empty());
    assert_eq!(s.direction(), StreamDirection::Bidirectional);
    assert!(s.can_read());
}

#[tokio::test]
async fn abort_write_resets_peer_read() {
    let pair = common::connect_default();
    let cancel = CancellationToken::new();
    let code = ErrorCode::from_u32(0x10c);

    let mut s = pair
        .client
        .open_outbound_stream(StreamDirection::Bidirectional)
        .await
        .unwrap();
    let mut t = pair
        .server
        .accept_inbound_stream(&cancel)
        .await
        .unwrap()
        .unwrap();

    s.abort_write(code);
    let e = t.input().read().await.unwrap_err();
    assert_eq!(e, PipeError::Failed(StreamError::ResetByPeer(code)));

    // the other direction is not affected
    t.output().write(b"still open").await.unwrap();
    t.output().complete(None);
    let data = s.input().read_to_end().await.unwrap();
    assert_eq!(data.as_ref(), b"still open");

    s.closed().await;
    assert_eq!(s.write_outcome(), Some(DirectionOutcome::Aborted));
    assert_eq!(s.read_outcome(), Some(DirectionOutcome::Graceful));
    assert!(s.is_aborted());
    assert_eq!(
        s.dispose().await,
        StreamDisposition::Discarded(DiscardReason::NotReusable)
    );
    assert_eq!(
        t.dispose().await,
        StreamDisposition::Discarded(DiscardReason::NotReusable)
    );
    assert_eq!(pair.client.pooled_stream_count(), 0);
    assert_eq!(pair.server.pooled_stream_count(), 0);
    assert!(pair.stats.snapshot().stream_aborted >= 2);
}

#[tokio::test]
async fn abort_read_keeps_write_open() {
    let pair = common::connect_default();
    let cancel = CancellationToken::new();

    let mut s = pair
        .client
        .open_outbound_stream(StreamDirection::Bidirectional)
        .await
        .unwrap();
    let mut t = pair
        .server
        .accept_inbound_stream(&cancel)
        .await
        .unwrap()
        .unwrap();

    s.abort_read(ErrorCode::from_u32(9), "not interested");
    let e = s.input().read().await.unwrap_err();
    assert_eq!(
        e,
        PipeError::Failed(StreamError::Aborted(Arc::from("not interested")))
    );

    s.output().write(b"data").await.unwrap();
    s.output().complete(None);
    let data = t.input().read_to_end().await.unwrap();
    assert_eq!(data.as_ref(), b"data");

    // the peer has been asked to stop sending
    let r = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match t.output().write(b"x").await {
                Ok(_) => tokio::time::sleep(Duration::from_millis(1)).await,
                Err(e) => break e,
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(
        r,
        PipeError::Failed(StreamError::StoppedByPeer(ErrorCode::from_u32(9)))
    );
}

#[tokio::test]
async fn abort_unblocks_pending_read() {
    let pair = common::connect_default();

    let mut s = pair
        .client
        .open_outbound_stream(StreamDirection::Bidirectional)
        .await
        .unwrap();
    let handle = s.abort_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.abort_read(ErrorCode::ZERO, "cancelled");
    });

    let e = s.input().read().await.unwrap_err();
    assert_eq!(
        e,
        PipeError::Failed(StreamError::Aborted(Arc::from("cancelled")))
    );
}

#[tokio::test]
async fn stream_error_code() {
    let pair = common::connect_default();
    let s = pair
        .client
        .open_outbound_stream(StreamDirection::Bidirectional)
        .await
        .unwrap();

    assert_eq!(s.error_code(), ErrorCode::ZERO);
    assert_eq!(s.set_error_code(-1).unwrap_err(), InvalidErrorCode(-1));
    assert!(s.set_error_code(1 << 62).is_err());
    assert_eq!(s.error_code(), ErrorCode::ZERO);
    s.set_error_code(258).unwrap();
    assert_eq!(s.error_code(), ErrorCode::from_u32(258));
}

#[tokio::test]
async fn unidirectional() {
    let pair = common::connect_default();
    let cancel = CancellationToken::new();

    let mut s = pair
        .client
        .open_outbound_stream(StreamDirection::Unidirectional)
        .await
        .unwrap();
    assert!(s.can_write());
    assert!(!s.can_read());
    assert_eq!(s.id() & 0b11, 0b10);
    let r = s.input().read().await.unwrap();
    assert!(r.completed);

    s.output().write(b"uni").await.unwrap();
    s.output().complete(None);

    let mut t = pair
        .server
        .accept_inbound_stream(&cancel)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(t.direction(), StreamDirection::Unidirectional);
    assert!(t.can_read());
    assert!(!t.can_write());
    let flush = t.output().write(b"ignored").await.unwrap();
    assert!(flush.completed);
    let data = t.input().read_to_end().await.unwrap();
    assert_eq!(data.as_ref(), b"uni");

    assert_eq!(s.dispose().await, StreamDisposition::Pooled);
    assert_eq!(t.dispose().await, StreamDisposition::Pooled);
}

#[tokio::test]
async fn closed_callback() {
    let pair = common::connect_default();
    let cancel = CancellationToken::new();
    let count = Arc::new(AtomicUsize::new(0));

    let mut s = pair
        .client
        .open_outbound_stream(StreamDirection::Bidirectional)
        .await
        .unwrap();
    let c = count.clone();
    s.on_closed(move || {
        c.fetch_add(1, Ordering::Relaxed);
    });
    s.output().complete(None);

    let mut t = pair
        .server
        .accept_inbound_stream(&cancel)
        .await
        .unwrap()
        .unwrap();
    t.output().complete(None);

    s.closed().await;
    assert_eq!(count.load(Ordering::Relaxed), 1);

    // registered after close
    let c = count.clone();
    s.on_closed(move || {
        c.fetch_add(1, Ordering::Relaxed);
    });
    assert_eq!(count.load(Ordering::Relaxed), 2);
    drop(t);
}

#[tokio::test]
async fn dispose_active_stream() {
    let pair = common::connect_default();
    let cancel = CancellationToken::new();

    let mut s = pair
        .client
        .open_outbound_stream(StreamDirection::Bidirectional)
        .await
        .unwrap();
    s.output().write(b"partial").await.unwrap();
    let mut t = pair
        .server
        .accept_inbound_stream(&cancel)
        .await
        .unwrap()
        .unwrap();

    // the read side is not finished, so it is aborted
    assert_eq!(
        s.dispose().await,
        StreamDisposition::Discarded(DiscardReason::NotReusable)
    );
    let data = t.input().read_to_end().await.unwrap();
    assert_eq!(data.as_ref(), b"partial");
    assert_eq!(pair.client.pooled_stream_count(), 0);
}

#[tokio::test]
async fn abort_read_after_write_finished() {
    let pair = common::connect_default();
    let cancel = CancellationToken::new();

    let mut s = pair
        .client
        .open_outbound_stream(StreamDirection::Bidirectional)
        .await
        .unwrap();
    s.output().write(b"request").await.unwrap();
    s.output().complete(None);

    let mut t = pair
        .server
        .accept_inbound_stream(&cancel)
        .await
        .unwrap()
        .unwrap();
    let data = t.input().read_to_end().await.unwrap();
    assert_eq!(data.as_ref(), b"request");
    assert_eq!(s.write_outcome(), Some(DirectionOutcome::Graceful));

    s.abort_read(ErrorCode::from_u32(5), "no response needed");
    s.closed().await;
    assert_eq!(s.write_outcome(), Some(DirectionOutcome::Graceful));
    assert_eq!(s.read_outcome(), Some(DirectionOutcome::Aborted));
    drop(t);
}

#[tokio::test]
async fn abort_write_after_read_finished() {
    let pair = common::connect_default();
    let cancel = CancellationToken::new();

    let mut s = pair
        .client
        .open_outbound_stream(StreamDirection::Bidirectional)
        .await
        .unwrap();
    let mut t = pair
        .server
        .accept_inbound_stream(&cancel)
        .await
        .unwrap()
        .unwrap();
    t.output().write(b"response").await.unwrap();
    t.output().complete(None);

    let data = s.input().read_to_end().await.unwrap();
    assert_eq!(data.as_ref(), b"response");

    let code = ErrorCode::from_u32(6);
    s.abort_write(code);
    let e = t.input().read().await.unwrap_err();
    assert_eq!(e, PipeError::Failed(StreamError::ResetByPeer(code)));

    s.closed().await;
    assert_eq!(s.read_outcome(), Some(DirectionOutcome::Graceful));
    assert_eq!(s.write_outcome(), Some(DirectionOutcome::Aborted));
}

#[tokio::test]
async fn abort_after_graceful_close_not_pooled() {
    let pair = common::connect_default();
    let cancel = CancellationToken::new();

    let mut s = pair
        .client
        .open_outbound_stream(StreamDirection::Bidirectional)
        .await
        .unwrap();
    s.output().write(b"Hello world").await.unwrap();
    s.output().complete(None);

    let mut t = pair
        .server
        .accept_inbound_stream(&cancel)
        .await
        .unwrap()
        .unwrap();
    t.input().read_to_end().await.unwrap();
    t.output().complete(None);
    assert_eq!(t.dispose().await, StreamDisposition::Pooled);

    s.input().read_to_end().await.unwrap();
    s.closed().await;
    assert!(s.is_gracefully_closed());

    s.abort_read(ErrorCode::from_u32(7), "late");
    s.abort_write(ErrorCode::from_u32(8));
    assert!(s.is_aborted());
    assert!(!s.is_gracefully_closed());
    assert_eq!(
        s.dispose().await,
        StreamDisposition::Discarded(DiscardReason::NotReusable)
    );
    assert_eq!(pair.client.pooled_stream_count(), 0);
    assert_eq!(pair.stats.snapshot().stream_aborted, 1);
}

#[tokio::test]
async fn zero_recv_chunk_size() {
    let mut config = g3_mux_transport::MuxTransportConfig::default();
    config.set_recv_chunk_size(0);
    let pair = common::connect(config);
    let cancel = CancellationToken::new();

    let mut s = pair
        .client
        .open_outbound_stream(StreamDirection::Unidirectional)
        .await
        .unwrap();
    s.output().write(b"abc").await.unwrap();
    s.output().complete(None);

    let mut t = pair
        .server
        .accept_inbound_stream(&cancel)
        .await
        .unwrap()
        .unwrap();
    let data = tokio::time::timeout(Duration::from_secs(5), t.input().read_to_end())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(data.as_ref(), b"abc");
}
