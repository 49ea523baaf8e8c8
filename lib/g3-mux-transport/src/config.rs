/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::time::Duration;

use anyhow::anyhow;

use crate::ErrorCode;
use crate::pipe::PipeConfig;

const DEFAULT_STREAM_POOL_CAPACITY: usize = 100;
const DEFAULT_STREAM_POOL_TTL: Duration = Duration::from_secs(5);
const DEFAULT_MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;
const DEFAULT_MAX_WRITE_BUFFER_SIZE: usize = 64 * 1024;
const DEFAULT_RECV_CHUNK_SIZE: usize = 16 * 1024;
const DEFAULT_LOOP_EXIT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_ACCEPT_BACKLOG: usize = 512;
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MuxTransportConfig {
    stream_pool_capacity: usize,
    stream_pool_ttl: Duration,
    max_read_buffer_size: usize,
    max_write_buffer_size: usize,
    recv_chunk_size: usize,
    default_stream_error_code: ErrorCode,
    default_close_error_code: ErrorCode,
    loop_exit_timeout: Duration,
    accept_backlog: usize,
    heartbeat_interval: Duration,
}

impl Default for MuxTransportConfig {
    fn default() -> Self {
        MuxTransportConfig {
            stream_pool_capacity: DEFAULT_STREAM_POOL_CAPACITY,
            stream_pool_ttl: DEFAULT_STREAM_POOL_TTL,
            max_read_buffer_size: DEFAULT_MAX_READ_BUFFER_SIZE,
            max_write_buffer_size: DEFAULT_MAX_WRITE_BUFFER_SIZE,
            recv_chunk_size: DEFAULT_RECV_CHUNK_SIZE,
            default_stream_error_code: ErrorCode::ZERO,
            default_close_error_code: ErrorCode::ZERO,
            loop_exit_timeout: DEFAULT_LOOP_EXIT_TIMEOUT,
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

impl MuxTransportConfig {
    pub fn check(&self) -> anyhow::Result<()> {
        if self.recv_chunk_size == 0 {
            return Err(anyhow!("recv chunk size should not be zero"));
        }
        if self.loop_exit_timeout.is_zero() {
            return Err(anyhow!("loop exit timeout should not be zero"));
        }
        if self.accept_backlog == 0 {
            return Err(anyhow!("accept backlog should not be zero"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(anyhow!("heartbeat interval should not be zero"));
        }
        if self.stream_pool_capacity > 0 && self.stream_pool_ttl.is_zero() {
            return Err(anyhow!(
                "stream pool ttl should not be zero if stream pool is enabled"
            ));
        }
        Ok(())
    }

    #[inline]
    pub fn set_stream_pool_capacity(&mut self, capacity: usize) {
        self.stream_pool_capacity = capacity;
    }

    /// Zero disables stream reuse.
    #[inline]
    pub fn stream_pool_capacity(&self) -> usize {
        self.stream_pool_capacity
    }

    #[inline]
    pub fn set_stream_pool_ttl(&mut self, ttl: Duration) {
        self.stream_pool_ttl = ttl;
    }

    #[inline]
    pub fn stream_pool_ttl(&self) -> Duration {
        self.stream_pool_ttl
    }

    #[inline]
    pub fn set_max_read_buffer_size(&mut self, size: usize) {
        self.max_read_buffer_size = size;
    }

    #[inline]
    pub fn max_read_buffer_size(&self) -> usize {
        self.max_read_buffer_size
    }

    #[inline]
    pub fn set_max_write_buffer_size(&mut self, size: usize) {
        self.max_write_buffer_size = size;
    }

    #[inline]
    pub fn max_write_buffer_size(&self) -> usize {
        self.max_write_buffer_size
    }

    #[inline]
    pub fn set_recv_chunk_size(&mut self, size: usize) {
        self.recv_chunk_size = size;
    }

    #[inline]
    pub fn recv_chunk_size(&self) -> usize {
        self.recv_chunk_size
    }

    #[inline]
    pub fn set_default_stream_error_code(&mut self, code: ErrorCode) {
        self.default_stream_error_code = code;
    }

    #[inline]
    pub fn default_stream_error_code(&self) -> ErrorCode {
        self.default_stream_error_code
    }

    #[inline]
    pub fn set_default_close_error_code(&mut self, code: ErrorCode) {
        self.default_close_error_code = code;
    }

    #[inline]
    pub fn default_close_error_code(&self) -> ErrorCode {
        self.default_close_error_code
    }

    #[inline]
    pub fn set_loop_exit_timeout(&mut self, timeout: Duration) {
        self.loop_exit_timeout = timeout;
    }

    #[inline]
    pub fn loop_exit_timeout(&self) -> Duration {
        self.loop_exit_timeout
    }

    #[inline]
    pub fn set_accept_backlog(&mut self, backlog: usize) {
        self.accept_backlog = backlog;
    }

    #[inline]
    pub fn accept_backlog(&self) -> usize {
        self.accept_backlog
    }

    #[inline]
    pub fn set_heartbeat_interval(&mut self, interval: Duration) {
        self.heartbeat_interval = interval;
    }

    #[inline]
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// The pipe carrying data received from the peer to the application.
    pub fn input_pipe_config(&self) -> PipeConfig {
        PipeConfig::new(self.max_read_buffer_size)
    }

    /// The pipe carrying data written by the application to the peer.
    pub fn output_pipe_config(&self) -> PipeConfig {
        PipeConfig::new(self.max_write_buffer_size)
    }
}
