/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

//! An in-process engine connecting two endpoints directly.
//!
//! Stream ids follow the QUIC layout: the lowest bit is set for streams
//! opened by the server side, the second bit for unidirectional streams.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use super::{
    NativeConnection, NativeConnectionError, NativeListener, NativeRecvStream, NativeSendStream,
    NativeStream, NativeStreamError, StreamDirection,
};
use crate::ErrorCode;

const STREAM_WINDOW: usize = 256 * 1024;

const CLIENT_SIDE: usize = 0;
const SERVER_SIDE: usize = 1;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub type LoopbackStream = NativeStream<LoopbackSendStream, LoopbackRecvStream>;

struct Link {
    token: CancellationToken,
    errors: Mutex<[Option<NativeConnectionError>; 2]>,
}

impl Link {
    fn new() -> Self {
        Link {
            token: CancellationToken::new(),
            errors: Mutex::new([None, None]),
        }
    }

    fn close(&self, side: usize, code: ErrorCode) {
        let mut errors = self.errors.lock().unwrap();
        if errors[side].is_some() {
            return;
        }
        errors[side] = Some(NativeConnectionError::LocallyClosed);
        errors[1 - side] = Some(NativeConnectionError::ApplicationClosed(code));
        drop(errors);
        self.token.cancel();
    }

    fn error(&self, side: usize) -> Option<NativeConnectionError> {
        self.errors.lock().unwrap()[side].clone()
    }
}

#[derive(Default)]
struct HalfState {
    data: BytesMut,
    finished: bool,
    reset: Option<ErrorCode>,
    stopped: Option<ErrorCode>,
}

#[derive(Default)]
struct HalfChannel {
    state: Mutex<HalfState>,
    readable: Notify,
    writable: Notify,
}

pub struct LoopbackSendStream {
    chan: Arc<HalfChannel>,
    link: Arc<Link>,
    side: usize,
    done: bool,
}

impl LoopbackSendStream {
    fn set_finished(&mut self) {
        self.done = true;
        self.chan.state.lock().unwrap().finished = true;
        self.chan.readable.notify_one();
    }
}

#[async_trait]
impl NativeSendStream for LoopbackSendStream {
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), NativeStreamError> {
        if self.done {
            return Err(NativeStreamError::Closed);
        }
        if buf.is_empty() {
            return Ok(());
        }

        let mut offset = 0;
        loop {
            {
                if let Some(e) = self.link.error(self.side) {
                    return Err(NativeStreamError::ConnectionLost(e));
                }
                let mut state = self.chan.state.lock().unwrap();
                if let Some(code) = state.stopped {
                    return Err(NativeStreamError::Stopped(code));
                }
                let room = STREAM_WINDOW.saturating_sub(state.data.len());
                if room > 0 {
                    let n = room.min(buf.len() - offset);
                    state.data.extend_from_slice(&buf[offset..offset + n]);
                    offset += n;
                    drop(state);
                    self.chan.readable.notify_one();
                    if offset == buf.len() {
                        return Ok(());
                    }
                    continue;
                }
            }

            tokio::select! {
                _ = self.link.token.cancelled() => {}
                _ = self.chan.writable.notified() => {}
            }
        }
    }

    fn finish(&mut self) -> Result<(), NativeStreamError> {
        if self.done {
            return Err(NativeStreamError::Closed);
        }
        self.set_finished();
        Ok(())
    }

    fn reset(&mut self, code: ErrorCode) {
        if self.done {
            return;
        }
        self.done = true;
        {
            let mut state = self.chan.state.lock().unwrap();
            state.reset = Some(code);
            state.data.clear();
        }
        self.chan.readable.notify_one();
    }
}

impl Drop for LoopbackSendStream {
    fn drop(&mut self) {
        if !self.done {
            self.set_finished();
        }
    }
}

pub struct LoopbackRecvStream {
    chan: Arc<HalfChannel>,
    link: Arc<Link>,
    side: usize,
    eof: bool,
    stopped: bool,
}

#[async_trait]
impl NativeRecvStream for LoopbackRecvStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>, NativeStreamError> {
        if self.stopped {
            return Err(NativeStreamError::Closed);
        }
        if self.eof {
            return Ok(None);
        }

        loop {
            {
                if let Some(e) = self.link.error(self.side) {
                    return Err(NativeStreamError::ConnectionLost(e));
                }
                let mut state = self.chan.state.lock().unwrap();
                if let Some(code) = state.reset {
                    return Err(NativeStreamError::Reset(code));
                }
                if !state.data.is_empty() {
                    let n = buf.len().min(state.data.len());
                    buf[..n].copy_from_slice(&state.data[..n]);
                    state.data.advance(n);
                    drop(state);
                    self.chan.writable.notify_one();
                    return Ok(Some(n));
                }
                if state.finished {
                    self.eof = true;
                    return Ok(None);
                }
            }

            tokio::select! {
                _ = self.link.token.cancelled() => {}
                _ = self.chan.readable.notified() => {}
            }
        }
    }

    fn stop(&mut self, code: ErrorCode) {
        if self.stopped || self.eof {
            return;
        }
        self.stopped = true;
        {
            let mut state = self.chan.state.lock().unwrap();
            state.stopped = Some(code);
            state.data.clear();
        }
        self.chan.writable.notify_one();
    }
}

impl Drop for LoopbackRecvStream {
    fn drop(&mut self) {
        self.stop(ErrorCode::ZERO);
    }
}

pub struct LoopbackConnection {
    id: u64,
    side: usize,
    link: Arc<Link>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<LoopbackStream>>,
    peer: mpsc::UnboundedSender<LoopbackStream>,
    next_bidi: AtomicU64,
    next_uni: AtomicU64,
}

/// Create two connected endpoints, the client side first.
pub fn pair() -> (LoopbackConnection, LoopbackConnection) {
    let link = Arc::new(Link::new());
    let (client_sender, client_receiver) = mpsc::unbounded_channel();
    let (server_sender, server_receiver) = mpsc::unbounded_channel();

    let client = LoopbackConnection::new(CLIENT_SIDE, Arc::clone(&link), client_receiver, server_sender);
    let server = LoopbackConnection::new(SERVER_SIDE, link, server_receiver, client_sender);
    (client, server)
}

impl LoopbackConnection {
    fn new(
        side: usize,
        link: Arc<Link>,
        incoming: mpsc::UnboundedReceiver<LoopbackStream>,
        peer: mpsc::UnboundedSender<LoopbackStream>,
    ) -> Self {
        LoopbackConnection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            side,
            link,
            incoming: tokio::sync::Mutex::new(incoming),
            peer,
            next_bidi: AtomicU64::new(0),
            next_uni: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn is_server(&self) -> bool {
        self.side == SERVER_SIDE
    }

    fn closed_error(&self) -> NativeConnectionError {
        self.link
            .error(self.side)
            .unwrap_or(NativeConnectionError::LocallyClosed)
    }

    fn send_half(&self, chan: &Arc<HalfChannel>, side: usize) -> LoopbackSendStream {
        LoopbackSendStream {
            chan: Arc::clone(chan),
            link: Arc::clone(&self.link),
            side,
            done: false,
        }
    }

    fn recv_half(&self, chan: &Arc<HalfChannel>, side: usize) -> LoopbackRecvStream {
        LoopbackRecvStream {
            chan: Arc::clone(chan),
            link: Arc::clone(&self.link),
            side,
            eof: false,
            stopped: false,
        }
    }
}

#[async_trait]
impl NativeConnection for LoopbackConnection {
    type SendStream = LoopbackSendStream;
    type RecvStream = LoopbackRecvStream;

    fn id(&self) -> u64 {
        self.id
    }

    async fn accept_stream(&self) -> Result<LoopbackStream, NativeConnectionError> {
        let mut incoming = tokio::select! {
            biased;

            _ = self.link.token.cancelled() => return Err(self.closed_error()),
            guard = self.incoming.lock() => guard,
        };
        tokio::select! {
            biased;

            _ = self.link.token.cancelled() => Err(self.closed_error()),
            r = incoming.recv() => r.ok_or_else(|| self.closed_error()),
        }
    }

    async fn open_stream(
        &self,
        direction: StreamDirection,
    ) -> Result<LoopbackStream, NativeConnectionError> {
        if let Some(e) = self.link.error(self.side) {
            return Err(e);
        }

        let peer_side = 1 - self.side;
        let outgoing = Arc::new(HalfChannel::default());
        let (local, remote) = match direction {
            StreamDirection::Bidirectional => {
                let id = (self.next_bidi.fetch_add(1, Ordering::Relaxed) << 2) | self.side as u64;
                let incoming = Arc::new(HalfChannel::default());
                (
                    NativeStream::new(
                        id,
                        Some(self.send_half(&outgoing, self.side)),
                        Some(self.recv_half(&incoming, self.side)),
                    ),
                    NativeStream::new(
                        id,
                        Some(self.send_half(&incoming, peer_side)),
                        Some(self.recv_half(&outgoing, peer_side)),
                    ),
                )
            }
            StreamDirection::Unidirectional => {
                let id = (self.next_uni.fetch_add(1, Ordering::Relaxed) << 2)
                    | 0b10
                    | self.side as u64;
                (
                    NativeStream::new(id, Some(self.send_half(&outgoing, self.side)), None),
                    NativeStream::new(id, None, Some(self.recv_half(&outgoing, peer_side))),
                )
            }
        };

        if self.peer.send(remote).is_err() {
            return Err(NativeConnectionError::Other(Arc::from(
                "peer connection has gone",
            )));
        }
        Ok(local)
    }

    fn close(&self, code: ErrorCode, _reason: &[u8]) {
        self.link.close(self.side, code);
    }

    async fn closed(&self) -> NativeConnectionError {
        self.link.token.cancelled().await;
        self.closed_error()
    }
}

impl Drop for LoopbackConnection {
    fn drop(&mut self) {
        self.link.close(self.side, ErrorCode::ZERO);
    }
}

pub struct LoopbackListener {
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<LoopbackConnection>>,
    token: CancellationToken,
}

#[derive(Clone)]
pub struct LoopbackConnector {
    sender: mpsc::UnboundedSender<LoopbackConnection>,
    token: CancellationToken,
}

/// Create a listener and the connector used to reach it.
pub fn listener() -> (LoopbackListener, LoopbackConnector) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let token = CancellationToken::new();
    (
        LoopbackListener {
            incoming: tokio::sync::Mutex::new(receiver),
            token: token.clone(),
        },
        LoopbackConnector { sender, token },
    )
}

impl LoopbackConnector {
    /// Connect to the listener, returning the client side connection.
    pub fn connect(&self) -> Result<LoopbackConnection, NativeConnectionError> {
        if self.token.is_cancelled() {
            return Err(NativeConnectionError::Other(Arc::from("connection refused")));
        }
        let (client, server) = pair();
        self.sender
            .send(server)
            .map_err(|_| NativeConnectionError::Other(Arc::from("connection refused")))?;
        Ok(client)
    }
}

#[async_trait]
impl NativeListener for LoopbackListener {
    type Connection = LoopbackConnection;

    async fn accept(&self) -> Option<Result<LoopbackConnection, NativeConnectionError>> {
        let mut incoming = tokio::select! {
            biased;

            _ = self.token.cancelled() => return None,
            guard = self.incoming.lock() => guard,
        };
        tokio::select! {
            biased;

            _ = self.token.cancelled() => None,
            r = incoming.recv() => r.map(Ok),
        }
    }

    fn close(&self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_to_end(recv: &mut LoopbackRecvStream) -> Result<Vec<u8>, NativeStreamError> {
        let mut data = Vec::new();
        let mut buf = [0u8; 1024];
        while let Some(n) = recv.read(&mut buf).await? {
            data.extend_from_slice(&buf[..n]);
        }
        Ok(data)
    }

    #[tokio::test]
    async fn bidirectional() {
        let (client, server) = pair();

        let mut stream = client
            .open_stream(StreamDirection::Bidirectional)
            .await
            .unwrap();
        assert_eq!(stream.id, 0);
        assert_eq!(stream.direction(), StreamDirection::Bidirectional);
        let mut send = stream.send.take().unwrap();
        send.write_all(b"ping").await.unwrap();
        send.finish().unwrap();
        assert_eq!(send.finish().unwrap_err(), NativeStreamError::Closed);

        let mut peer = server.accept_stream().await.unwrap();
        assert_eq!(peer.id, 0);
        let mut recv = peer.recv.take().unwrap();
        assert_eq!(read_to_end(&mut recv).await.unwrap(), b"ping");

        let mut peer_send = peer.send.take().unwrap();
        peer_send.write_all(b"pong").await.unwrap();
        drop(peer_send);
        let mut recv = stream.recv.take().unwrap();
        assert_eq!(read_to_end(&mut recv).await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn stream_ids() {
        let (client, server) = pair();
        let s = client.open_stream(StreamDirection::Bidirectional).await.unwrap();
        assert_eq!(s.id, 0);
        let s = client.open_stream(StreamDirection::Bidirectional).await.unwrap();
        assert_eq!(s.id, 4);
        let s = client.open_stream(StreamDirection::Unidirectional).await.unwrap();
        assert_eq!(s.id, 2);
        assert!(s.can_write());
        assert!(!s.can_read());
        let s = server.open_stream(StreamDirection::Bidirectional).await.unwrap();
        assert_eq!(s.id, 1);
        let s = server.open_stream(StreamDirection::Unidirectional).await.unwrap();
        assert_eq!(s.id, 3);
    }

    #[tokio::test]
    async fn reset_and_stop() {
        let (client, server) = pair();
        let mut stream = client
            .open_stream(StreamDirection::Bidirectional)
            .await
            .unwrap();
        let mut peer = server.accept_stream().await.unwrap();

        let mut send = stream.send.take().unwrap();
        send.write_all(b"discarded").await.unwrap();
        send.reset(ErrorCode::from_u32(7));
        let mut peer_recv = peer.recv.take().unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(
            peer_recv.read(&mut buf).await.unwrap_err(),
            NativeStreamError::Reset(ErrorCode::from_u32(7))
        );

        let mut recv = stream.recv.take().unwrap();
        recv.stop(ErrorCode::from_u32(9));
        let mut peer_send = peer.send.take().unwrap();
        assert_eq!(
            peer_send.write_all(b"data").await.unwrap_err(),
            NativeStreamError::Stopped(ErrorCode::from_u32(9))
        );
    }

    #[tokio::test]
    async fn close() {
        let (client, server) = pair();
        let mut stream = server
            .open_stream(StreamDirection::Unidirectional)
            .await
            .unwrap();
        let mut peer = client.accept_stream().await.unwrap();

        client.close(ErrorCode::from_u32(3), b"bye");
        assert_eq!(client.closed().await, NativeConnectionError::LocallyClosed);
        assert_eq!(
            server.closed().await,
            NativeConnectionError::ApplicationClosed(ErrorCode::from_u32(3))
        );
        assert!(server.accept_stream().await.is_err());
        assert!(server.open_stream(StreamDirection::Bidirectional).await.is_err());

        let mut send = stream.send.take().unwrap();
        assert!(matches!(
            send.write_all(b"data").await,
            Err(NativeStreamError::ConnectionLost(_))
        ));
        let mut recv = peer.recv.take().unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(
            recv.read(&mut buf).await.unwrap_err(),
            NativeStreamError::ConnectionLost(NativeConnectionError::LocallyClosed)
        );
    }

    #[tokio::test]
    async fn flow_control() {
        let (client, server) = pair();
        let mut stream = client
            .open_stream(StreamDirection::Unidirectional)
            .await
            .unwrap();
        let mut send = stream.send.take().unwrap();
        let writer = tokio::spawn(async move {
            let data = vec![0x5au8; STREAM_WINDOW * 3];
            send.write_all(&data).await.unwrap();
            send.finish().unwrap();
        });

        let mut peer = server.accept_stream().await.unwrap();
        let mut recv = peer.recv.take().unwrap();
        let data = read_to_end(&mut recv).await.unwrap();
        assert_eq!(data.len(), STREAM_WINDOW * 3);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn listener_connect() {
        let (listener, connector) = listener();
        let client = connector.connect().unwrap();
        let server = listener.accept().await.unwrap().unwrap();
        assert!(server.is_server());
        assert!(!client.is_server());

        listener.close();
        assert!(listener.accept().await.is_none());
        assert!(connector.connect().is_err());
    }
}
