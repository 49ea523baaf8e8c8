/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

//! The capabilities this crate needs from a multiplexed transport engine.
//!
//! The engine owns handshake, congestion control, loss recovery and
//! encryption. Streams are handed over as independent send and receive
//! halves, so that each half can be driven by its own task.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::ErrorCode;

pub mod loopback;

#[cfg(feature = "quic")]
pub mod quinn;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamDirection {
    Bidirectional,
    Unidirectional,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NativeConnectionError {
    #[error("closed by peer application with code {0}")]
    ApplicationClosed(ErrorCode),
    #[error("closed locally")]
    LocallyClosed,
    #[error("reset by peer")]
    Reset,
    #[error("timed out")]
    TimedOut,
    #[error("engine error: {0}")]
    Other(Arc<str>),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NativeStreamError {
    #[error("reset by peer with code {0}")]
    Reset(ErrorCode),
    #[error("stopped by peer with code {0}")]
    Stopped(ErrorCode),
    #[error("connection lost: {0}")]
    ConnectionLost(NativeConnectionError),
    #[error("stream already closed")]
    Closed,
    #[error("engine error: {0}")]
    Other(Arc<str>),
}

#[async_trait]
pub trait NativeRecvStream: Send + 'static {
    /// Read the next chunk into `buf`, `None` means the peer finished the stream.
    async fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>, NativeStreamError>;

    /// Ask the peer to stop sending, discarding anything not yet read.
    fn stop(&mut self, code: ErrorCode);
}

#[async_trait]
pub trait NativeSendStream: Send + 'static {
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), NativeStreamError>;

    /// Mark the end of data after everything written so far.
    fn finish(&mut self) -> Result<(), NativeStreamError>;

    /// Abandon the send side, the peer will observe a reset with `code`.
    fn reset(&mut self, code: ErrorCode);
}

/// A native stream split into halves, a half is absent if the stream
/// can not be used in that direction.
pub struct NativeStream<S, R> {
    pub id: u64,
    pub send: Option<S>,
    pub recv: Option<R>,
}

impl<S, R> NativeStream<S, R> {
    pub fn new(id: u64, send: Option<S>, recv: Option<R>) -> Self {
        NativeStream { id, send, recv }
    }

    #[inline]
    pub fn can_read(&self) -> bool {
        self.recv.is_some()
    }

    #[inline]
    pub fn can_write(&self) -> bool {
        self.send.is_some()
    }

    pub fn direction(&self) -> StreamDirection {
        if self.can_read() && self.can_write() {
            StreamDirection::Bidirectional
        } else {
            StreamDirection::Unidirectional
        }
    }
}

pub type NativeStreamOf<C> =
    NativeStream<<C as NativeConnection>::SendStream, <C as NativeConnection>::RecvStream>;

#[async_trait]
pub trait NativeConnection: Send + Sync + 'static {
    type SendStream: NativeSendStream;
    type RecvStream: NativeRecvStream;

    fn id(&self) -> u64;

    async fn accept_stream(
        &self,
    ) -> Result<NativeStream<Self::SendStream, Self::RecvStream>, NativeConnectionError>;

    async fn open_stream(
        &self,
        direction: StreamDirection,
    ) -> Result<NativeStream<Self::SendStream, Self::RecvStream>, NativeConnectionError>;

    fn close(&self, code: ErrorCode, reason: &[u8]);

    /// Resolve once the connection is gone, for whatever reason.
    async fn closed(&self) -> NativeConnectionError;
}

#[async_trait]
pub trait NativeListener: Send + Sync + 'static {
    type Connection: NativeConnection;

    /// Wait for the next established connection, `None` if the listener is closed.
    async fn accept(&self) -> Option<Result<Self::Connection, NativeConnectionError>>;

    fn close(&self);
}
