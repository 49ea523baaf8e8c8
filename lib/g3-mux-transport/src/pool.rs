/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::Stream;
use crate::native::NativeConnection;

/// Idle streams of one connection, ordered by the time they were pooled.
pub struct StreamPool<C: NativeConnection> {
    capacity: usize,
    ttl: Duration,
    streams: Mutex<VecDeque<Stream<C>>>,
}

impl<C: NativeConnection> StreamPool<C> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        StreamPool {
            capacity,
            ttl,
            streams: Mutex::new(VecDeque::with_capacity(capacity.min(16))),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Add a gracefully closed stream, which expires at `now` + ttl.
    ///
    /// The stream is handed back if it is not reusable or the pool is full.
    pub fn try_add(&self, mut stream: Stream<C>, now: Instant) -> Result<(), Stream<C>> {
        if !stream.is_reusable() {
            return Err(stream);
        }
        let mut streams = self.streams.lock().unwrap();
        if streams.len() >= self.capacity {
            return Err(stream);
        }
        stream.set_pool_expiration(now + self.ttl);
        streams.push_back(stream);
        Ok(())
    }

    /// Take the most recently pooled stream.
    pub fn try_take(&self) -> Option<Stream<C>> {
        self.streams.lock().unwrap().pop_back()
    }

    /// Remove all streams with expiration <= `now`, returning how many.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut expired = Vec::new();
        {
            let mut streams = self.streams.lock().unwrap();
            while let Some(stream) = streams.front() {
                if stream.pool_expiration().is_some_and(|t| t > now) {
                    break;
                }
                if let Some(stream) = streams.pop_front() {
                    expired.push(stream);
                }
            }
        }
        // dropped out of the lock
        expired.len()
    }

    /// The earliest expiration among pooled streams.
    pub fn next_expiration(&self) -> Option<Instant> {
        self.streams
            .lock()
            .unwrap()
            .front()
            .and_then(|s| s.pool_expiration())
    }

    pub fn len(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) -> usize {
        let streams = std::mem::take(&mut *self.streams.lock().unwrap());
        streams.len()
    }
}
