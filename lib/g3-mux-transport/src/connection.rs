/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::heartbeat::{Heartbeat, HeartbeatRegistration};
use crate::native::{NativeConnection, NativeStreamOf, StreamDirection};
use crate::pool::StreamPool;
use crate::signal::CloseSignal;
use crate::stats::AliveConnectionGuard;
use crate::stream::{DiscardReason, StreamDisposition};
use crate::{
    ConnectionError, ErrorCode, InvalidErrorCode, MuxTransportConfig, MuxTransportStats, Stream,
};

pub(crate) struct ConnectionInner<C: NativeConnection> {
    id: u64,
    native: C,
    config: Arc<MuxTransportConfig>,
    stats: Arc<MuxTransportStats>,
    signal: Arc<CloseSignal<ConnectionError>>,
    pool: StreamPool<C>,
    error_code: AtomicU64,
    next_slot_id: AtomicU64,
    heartbeat: Mutex<Option<HeartbeatRegistration>>,
    loop_tracker: TaskTracker,
    _alive_guard: AliveConnectionGuard,
}

impl<C: NativeConnection> ConnectionInner<C> {
    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub(crate) fn config(&self) -> &Arc<MuxTransportConfig> {
        &self.config
    }

    #[inline]
    pub(crate) fn stats(&self) -> &Arc<MuxTransportStats> {
        &self.stats
    }

    #[inline]
    pub(crate) fn signal(&self) -> &Arc<CloseSignal<ConnectionError>> {
        &self.signal
    }

    /// All stream loops of this connection are spawned on this tracker.
    #[inline]
    pub(crate) fn loop_tracker(&self) -> &TaskTracker {
        &self.loop_tracker
    }

    pub(crate) fn next_slot_id(&self) -> u64 {
        self.next_slot_id.fetch_add(1, Ordering::Relaxed)
    }

    fn error_code(&self) -> ErrorCode {
        ErrorCode::new(self.error_code.load(Ordering::Relaxed)).unwrap_or(ErrorCode::MAX)
    }

    /// The error to return to callers once the close signal has fired.
    fn closed_error(&self) -> Option<ConnectionError> {
        let reason = self.signal.reason()?;
        let e = match reason {
            ConnectionError::ConnectionReset(code) => ConnectionError::ConnectionReset(code),
            ConnectionError::Transport(s) => ConnectionError::Transport(s),
            ConnectionError::Closed
            | ConnectionError::Disposed
            | ConnectionError::ConnectionAborted(_) => ConnectionError::Disposed,
        };
        Some(e)
    }

    fn bind_stream(self: &Arc<Self>, native: NativeStreamOf<C>) -> Stream<C> {
        if let Some(mut stream) = self.pool.try_take() {
            let slot_id = stream.slot_id();
            stream.rebind(native, self);
            self.stats.add_stream_reused();
            debug!(
                "MUX[{}] reuse pooled stream wrapper {slot_id}",
                stream.connection_id()
            );
            stream
        } else {
            self.stats.add_stream_created();
            Stream::new(native, self)
        }
    }

    pub(crate) fn return_stream(&self, stream: Stream<C>) -> StreamDisposition {
        if self.signal.is_fired() {
            return StreamDisposition::Discarded(DiscardReason::ConnectionClosed);
        }

        let log_id = stream.connection_id().to_string();
        if self.pool.try_add(stream, Instant::now()).is_err() {
            debug!("MUX[{log_id}] stream discarded as the pool is full");
            self.stats.add_stream_discarded_pool_full();
            return StreamDisposition::Discarded(DiscardReason::PoolFull);
        }
        if self.signal.is_fired() {
            // raced with shutdown, which may have drained the pool already
            self.pool.clear();
            return StreamDisposition::Discarded(DiscardReason::ConnectionClosed);
        }

        debug!("MUX[{log_id}] stream returned to pool");
        self.stats.add_stream_pooled();
        StreamDisposition::Pooled
    }

    fn on_heartbeat(&self, now: Instant) {
        if self.signal.is_fired() {
            return;
        }
        let expired = self.pool.sweep(now);
        if expired > 0 {
            debug!("MUX[{}] {expired} pooled streams expired", self.id);
            self.stats.add_stream_expired_n(expired);
        }
    }

    /// Fire the close signal, and close the native connection if `local`.
    fn shutdown(&self, reason: ConnectionError, local: bool) -> bool {
        let close_reason = match &reason {
            ConnectionError::ConnectionAborted(s) => s.to_string(),
            _ => String::new(),
        };
        if !self.signal.fire(reason) {
            return false;
        }
        if local {
            self.native.close(self.error_code(), close_reason.as_bytes());
        }
        let registration = self.heartbeat.lock().unwrap().take();
        drop(registration);
        self.loop_tracker.close();
        let n = self.pool.clear();
        debug!("MUX[{}] connection closed, {n} pooled streams dropped", self.id);
        true
    }

    fn on_native_closed(&self, e: ConnectionError) {
        if self.shutdown(e.clone(), false) {
            debug!("MUX[{}] connection lost: {e}", self.id);
        }
    }
}

/// A multiplexed connection, handing out [`Stream`]s for its native streams.
///
/// The connection is disposed when this handle is dropped.
pub struct Connection<C: NativeConnection> {
    inner: Arc<ConnectionInner<C>>,
}

impl<C: NativeConnection> Connection<C> {
    pub fn new(
        native: C,
        config: Arc<MuxTransportConfig>,
        heartbeat: &Heartbeat,
        stats: Arc<MuxTransportStats>,
    ) -> Self {
        let signal = Arc::new(CloseSignal::new(CancellationToken::new()));
        let inner = Arc::new(ConnectionInner {
            id: native.id(),
            native,
            pool: StreamPool::new(config.stream_pool_capacity(), config.stream_pool_ttl()),
            error_code: AtomicU64::new(config.default_close_error_code().into_inner()),
            next_slot_id: AtomicU64::new(0),
            heartbeat: Mutex::new(None),
            loop_tracker: TaskTracker::new(),
            _alive_guard: stats.add_connection(),
            config,
            stats,
            signal,
        });

        let weak = Arc::downgrade(&inner);
        let registration = heartbeat.register(move |now| {
            if let Some(inner) = weak.upgrade() {
                inner.on_heartbeat(now);
            }
        });
        *inner.heartbeat.lock().unwrap() = Some(registration);

        let watcher = Arc::clone(&inner);
        tokio::spawn(async move {
            tokio::select! {
                biased;

                _ = watcher.signal.cancelled() => {}
                e = watcher.native.closed() => {
                    watcher.on_native_closed(ConnectionError::from(e));
                }
            }
        });

        Connection { inner }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Wait for the next stream opened by the peer.
    ///
    /// `Ok(None)` is returned if `cancel` is cancelled first.
    pub async fn accept_inbound_stream(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<Stream<C>>, ConnectionError> {
        if let Some(e) = self.inner.closed_error() {
            return Err(e);
        }

        let r = tokio::select! {
            biased;

            _ = cancel.cancelled() => return Ok(None),
            _ = self.inner.signal.cancelled() => None,
            r = self.inner.native.accept_stream() => Some(r),
        };
        match r {
            Some(Ok(native)) => Ok(Some(self.inner.bind_stream(native))),
            Some(Err(e)) => {
                self.inner.on_native_closed(ConnectionError::from(e));
                Err(self.inner.closed_error().unwrap_or(ConnectionError::Disposed))
            }
            None => Err(self.inner.closed_error().unwrap_or(ConnectionError::Disposed)),
        }
    }

    /// Open a new stream to the peer.
    pub async fn open_outbound_stream(
        &self,
        direction: StreamDirection,
    ) -> Result<Stream<C>, ConnectionError> {
        if let Some(e) = self.inner.closed_error() {
            return Err(e);
        }

        let r = tokio::select! {
            biased;

            _ = self.inner.signal.cancelled() => None,
            r = self.inner.native.open_stream(direction) => Some(r),
        };
        match r {
            Some(Ok(native)) => Ok(self.inner.bind_stream(native)),
            Some(Err(e)) => {
                self.inner.on_native_closed(ConnectionError::from(e));
                Err(self.inner.closed_error().unwrap_or(ConnectionError::Disposed))
            }
            None => Err(self.inner.closed_error().unwrap_or(ConnectionError::Disposed)),
        }
    }

    /// The code used when this side closes the connection.
    pub fn error_code(&self) -> ErrorCode {
        self.inner.error_code()
    }

    pub fn set_error_code(&self, code: i64) -> Result<(), InvalidErrorCode> {
        let code = ErrorCode::try_from(code)?;
        self.inner
            .error_code
            .store(code.into_inner(), Ordering::Relaxed);
        Ok(())
    }

    /// Close the connection with the current error code.
    pub fn close(&self) {
        self.inner.shutdown(ConnectionError::Closed, true);
    }

    /// Abort the connection with the current error code, streams still in
    /// use will observe `reason`.
    pub fn abort(&self, reason: &str) {
        self.inner
            .shutdown(ConnectionError::ConnectionAborted(Arc::from(reason)), true);
    }

    /// Close the connection, and wait a bounded time for the loops of all
    /// its streams to exit and for the engine to confirm the close.
    pub async fn dispose(&self) {
        self.inner.shutdown(ConnectionError::Disposed, true);
        let timeout = self.inner.config.loop_exit_timeout();
        let wait = async {
            self.inner.loop_tracker.wait().await;
            self.inner.native.closed().await;
        };
        if tokio::time::timeout(timeout, wait).await.is_err() {
            warn!(
                "MUX[{}] {} stream loops still running after {timeout:?}",
                self.inner.id,
                self.inner.loop_tracker.len()
            );
        }
    }

    /// Number of stream loops that have not exited yet.
    pub fn running_stream_loops(&self) -> usize {
        self.inner.loop_tracker.len()
    }

    pub async fn closed(&self) -> ConnectionError {
        self.inner.signal.cancelled().await;
        self.inner.signal.reason().unwrap_or(ConnectionError::Closed)
    }

    /// Run `cb` once the connection is closed, or right now if it already is.
    pub fn on_closed<F>(&self, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.signal.on_fired(cb);
    }

    pub fn close_reason(&self) -> Option<ConnectionError> {
        self.inner.signal.reason()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.signal.is_fired()
    }

    pub fn stream_pool(&self) -> &StreamPool<C> {
        &self.inner.pool
    }

    pub fn pooled_stream_count(&self) -> usize {
        self.inner.pool.len()
    }

    pub fn stats(&self) -> &Arc<MuxTransportStats> {
        &self.inner.stats
    }
}

impl<C: NativeConnection> Drop for Connection<C> {
    fn drop(&mut self) {
        self.inner.shutdown(ConnectionError::Disposed, true);
    }
}
