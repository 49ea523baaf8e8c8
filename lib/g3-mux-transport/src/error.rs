/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::sync::Arc;

use thiserror::Error;

use crate::ErrorCode;
use crate::native::{NativeConnectionError, NativeStreamError};

/// The cause latched into a stream direction when it did not end gracefully.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream reset by peer with code {0}")]
    ResetByPeer(ErrorCode),
    #[error("stream stopped by peer with code {0}")]
    StoppedByPeer(ErrorCode),
    #[error("stream aborted: {0}")]
    Aborted(Arc<str>),
    #[error("connection reset by peer with code {0}")]
    ConnectionReset(ErrorCode),
    #[error("connection aborted: {0}")]
    ConnectionAborted(Arc<str>),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("transport error: {0}")]
    Transport(Arc<str>),
}

impl StreamError {
    pub fn get_type(&self) -> &'static str {
        match self {
            StreamError::ResetByPeer(_) => "ResetByPeer",
            StreamError::StoppedByPeer(_) => "StoppedByPeer",
            StreamError::Aborted(_) => "Aborted",
            StreamError::ConnectionReset(_) => "ConnectionReset",
            StreamError::ConnectionAborted(_) => "ConnectionAborted",
            StreamError::ConnectionClosed => "ConnectionClosed",
            StreamError::Transport(_) => "Transport",
        }
    }

    /// The application error code sent by the peer, if this is a reset style error.
    pub fn reset_code(&self) -> Option<ErrorCode> {
        match self {
            StreamError::ResetByPeer(code)
            | StreamError::StoppedByPeer(code)
            | StreamError::ConnectionReset(code) => Some(*code),
            _ => None,
        }
    }
}

impl From<NativeStreamError> for StreamError {
    fn from(e: NativeStreamError) -> Self {
        match e {
            NativeStreamError::Reset(code) => StreamError::ResetByPeer(code),
            NativeStreamError::Stopped(code) => StreamError::StoppedByPeer(code),
            NativeStreamError::ConnectionLost(e) => StreamError::from(ConnectionError::from(e)),
            NativeStreamError::Closed => StreamError::Transport(Arc::from("stream already closed")),
            NativeStreamError::Other(s) => StreamError::Transport(s),
        }
    }
}

impl From<ConnectionError> for StreamError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::ConnectionReset(code) => StreamError::ConnectionReset(code),
            ConnectionError::ConnectionAborted(reason) => StreamError::ConnectionAborted(reason),
            ConnectionError::Closed | ConnectionError::Disposed => StreamError::ConnectionClosed,
            ConnectionError::Transport(s) => StreamError::Transport(s),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection reset by peer with code {0}")]
    ConnectionReset(ErrorCode),
    #[error("connection aborted: {0}")]
    ConnectionAborted(Arc<str>),
    #[error("connection closed")]
    Closed,
    #[error("connection already disposed")]
    Disposed,
    #[error("transport error: {0}")]
    Transport(Arc<str>),
}

impl ConnectionError {
    pub fn get_type(&self) -> &'static str {
        match self {
            ConnectionError::ConnectionReset(_) => "ConnectionReset",
            ConnectionError::ConnectionAborted(_) => "ConnectionAborted",
            ConnectionError::Closed => "Closed",
            ConnectionError::Disposed => "Disposed",
            ConnectionError::Transport(_) => "Transport",
        }
    }

    pub fn reset_code(&self) -> Option<ErrorCode> {
        match self {
            ConnectionError::ConnectionReset(code) => Some(*code),
            _ => None,
        }
    }

    /// Whether the connection went away because of the peer or the engine,
    /// rather than a local close or abort.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            ConnectionError::ConnectionReset(_) | ConnectionError::Transport(_)
        )
    }
}

impl From<NativeConnectionError> for ConnectionError {
    fn from(e: NativeConnectionError) -> Self {
        match e {
            NativeConnectionError::ApplicationClosed(code) => ConnectionError::ConnectionReset(code),
            NativeConnectionError::Reset => ConnectionError::ConnectionReset(ErrorCode::ZERO),
            NativeConnectionError::LocallyClosed => ConnectionError::Closed,
            NativeConnectionError::TimedOut => {
                ConnectionError::Transport(Arc::from("connection timed out"))
            }
            NativeConnectionError::Other(s) => ConnectionError::Transport(s),
        }
    }
}
