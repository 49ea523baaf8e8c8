/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::sync::Arc;
use std::sync::atomic::{AtomicIsize, AtomicU64, Ordering};

#[derive(Default)]
pub struct MuxTransportStats {
    connection_total: AtomicU64,
    connection_alive: AtomicIsize,
    stream_created: AtomicU64,
    stream_reused: AtomicU64,
    stream_pooled: AtomicU64,
    stream_expired: AtomicU64,
    stream_discarded_pool_full: AtomicU64,
    stream_discarded_not_reusable: AtomicU64,
    stream_aborted: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MuxTransportSnapshot {
    pub connection_total: u64,
    pub connection_alive: usize,
    pub stream_created: u64,
    pub stream_reused: u64,
    pub stream_pooled: u64,
    pub stream_expired: u64,
    pub stream_discarded_pool_full: u64,
    pub stream_discarded_not_reusable: u64,
    pub stream_aborted: u64,
}

impl MuxTransportStats {
    pub fn snapshot(&self) -> MuxTransportSnapshot {
        MuxTransportSnapshot {
            connection_total: self.connection_total.load(Ordering::Relaxed),
            connection_alive: self.alive_connection_count(),
            stream_created: self.stream_created.load(Ordering::Relaxed),
            stream_reused: self.stream_reused.load(Ordering::Relaxed),
            stream_pooled: self.stream_pooled.load(Ordering::Relaxed),
            stream_expired: self.stream_expired.load(Ordering::Relaxed),
            stream_discarded_pool_full: self.stream_discarded_pool_full.load(Ordering::Relaxed),
            stream_discarded_not_reusable: self
                .stream_discarded_not_reusable
                .load(Ordering::Relaxed),
            stream_aborted: self.stream_aborted.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn add_connection(self: &Arc<Self>) -> AliveConnectionGuard {
        self.connection_total.fetch_add(1, Ordering::Relaxed);
        self.connection_alive.fetch_add(1, Ordering::Relaxed);
        AliveConnectionGuard {
            stats: Arc::clone(self),
        }
    }

    pub fn alive_connection_count(&self) -> usize {
        self.connection_alive
            .load(Ordering::Relaxed)
            .try_into()
            .unwrap_or_default()
    }

    pub(crate) fn add_stream_created(&self) {
        self.stream_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_stream_reused(&self) {
        self.stream_reused.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_stream_pooled(&self) {
        self.stream_pooled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_stream_expired_n(&self, n: usize) {
        if n > 0 {
            self.stream_expired.fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn add_stream_discarded_pool_full(&self) {
        self.stream_discarded_pool_full
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_stream_discarded_not_reusable(&self) {
        self.stream_discarded_not_reusable
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_stream_aborted(&self) {
        self.stream_aborted.fetch_add(1, Ordering::Relaxed);
    }
}

pub(crate) struct AliveConnectionGuard {
    stats: Arc<MuxTransportStats>,
}

impl Drop for AliveConnectionGuard {
    fn drop(&mut self) {
        self.stats.connection_alive.fetch_sub(1, Ordering::Relaxed);
    }
}
