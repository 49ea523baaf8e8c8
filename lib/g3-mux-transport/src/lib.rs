/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

//! Byte stream transport over multiplexed connections.
//!
//! Each native stream of a QUIC-style connection is exposed as a [`Stream`]
//! with an input and an output pipe. Gracefully closed streams are kept in
//! a per connection pool and reused for later streams.

mod code;
pub use code::{ErrorCode, InvalidErrorCode, MAX_ERROR_CODE};

mod error;
pub use error::{ConnectionError, StreamError};

mod config;
pub use config::MuxTransportConfig;

mod stats;
pub use stats::{MuxTransportSnapshot, MuxTransportStats};

pub mod native;
pub mod pipe;

mod signal;

mod stream;
pub use stream::{
    DirectionOutcome, DiscardReason, StateMap, Stream, StreamAbortHandle, StreamDisposition,
};

mod pool;
pub use pool::StreamPool;

mod heartbeat;
pub use heartbeat::{Heartbeat, HeartbeatRegistration};

mod connection;
pub use connection::Connection;

mod listener;
pub use listener::TransportListener;

#[cfg(feature = "yaml")]
pub mod yaml;
