/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use log::{debug, warn};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::connection::ConnectionInner;
use crate::native::{NativeConnection, NativeStreamOf, StreamDirection};
use crate::pipe::{PipeReader, PipeWriter, pipe};
use crate::signal::CloseSignal;
use crate::{ConnectionError, ErrorCode, InvalidErrorCode, MuxTransportConfig, StreamError};

mod pump;

mod state;
pub use state::StateMap;

/// How one direction of a stream ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirectionOutcome {
    Graceful,
    Aborted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscardReason {
    /// At least one direction did not complete gracefully.
    NotReusable,
    PoolFull,
    ConnectionClosed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamDisposition {
    Pooled,
    Discarded(DiscardReason),
}

pub(crate) struct StreamShared {
    log_id: String,
    error_code: AtomicU64,
    read_token: CancellationToken,
    write_token: CancellationToken,
    read_abort: OnceLock<(ErrorCode, StreamError)>,
    write_abort: OnceLock<(ErrorCode, StreamError)>,
    aborted: AtomicBool,
    read_eos: AtomicBool,
    read_outcome: OnceLock<DirectionOutcome>,
    write_outcome: OnceLock<DirectionOutcome>,
    remaining: AtomicUsize,
    closed: CloseSignal<()>,
    connection: Arc<CloseSignal<ConnectionError>>,
}

impl StreamShared {
    fn new(
        log_id: String,
        error_code: ErrorCode,
        connection: Arc<CloseSignal<ConnectionError>>,
        loops: usize,
    ) -> Self {
        StreamShared {
            log_id,
            error_code: AtomicU64::new(error_code.into_inner()),
            read_token: connection.token().child_token(),
            write_token: connection.token().child_token(),
            read_abort: OnceLock::new(),
            write_abort: OnceLock::new(),
            aborted: AtomicBool::new(false),
            read_eos: AtomicBool::new(false),
            read_outcome: OnceLock::new(),
            write_outcome: OnceLock::new(),
            remaining: AtomicUsize::new(loops),
            closed: CloseSignal::new(CancellationToken::new()),
            connection,
        }
    }

    #[inline]
    pub(super) fn log_id(&self) -> &str {
        &self.log_id
    }

    pub(crate) fn error_code(&self) -> ErrorCode {
        // only valid codes are stored
        ErrorCode::new(self.error_code.load(Ordering::Relaxed)).unwrap_or(ErrorCode::MAX)
    }

    fn set_error_code(&self, code: ErrorCode) {
        self.error_code.store(code.into_inner(), Ordering::Relaxed);
    }

    fn abort_read(&self, code: ErrorCode, reason: StreamError) {
        if self.read_abort.set((code, reason)).is_ok() {
            self.aborted.store(true, Ordering::Relaxed);
            self.read_token.cancel();
        }
    }

    fn abort_write(&self, code: ErrorCode, reason: StreamError) {
        if self.write_abort.set((code, reason)).is_ok() {
            self.aborted.store(true, Ordering::Relaxed);
            self.write_token.cancel();
        }
    }

    fn cancel_loops(&self) {
        self.read_token.cancel();
        self.write_token.cancel();
    }

    fn abort_reason(&self, slot: &OnceLock<(ErrorCode, StreamError)>) -> (ErrorCode, StreamError) {
        if let Some(v) = slot.get() {
            return v.clone();
        }
        let reason = match self.connection.reason() {
            Some(e) => StreamError::from(e),
            None => StreamError::Aborted(Arc::from("stream dropped")),
        };
        (self.error_code(), reason)
    }

    pub(super) fn read_abort_reason(&self) -> (ErrorCode, StreamError) {
        self.abort_reason(&self.read_abort)
    }

    pub(super) fn write_abort_reason(&self) -> (ErrorCode, StreamError) {
        self.abort_reason(&self.write_abort)
    }

    pub(super) fn set_read_eos(&self) {
        self.read_eos.store(true, Ordering::Release);
    }

    fn read_settled(&self) -> bool {
        self.read_eos.load(Ordering::Acquire) || self.read_outcome.get().is_some()
    }

    fn finish(&self, slot: &OnceLock<DirectionOutcome>, outcome: DirectionOutcome) {
        if slot.set(outcome).is_err() {
            return;
        }
        if outcome == DirectionOutcome::Aborted {
            self.aborted.store(true, Ordering::Relaxed);
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.closed.fire(());
        }
    }

    pub(super) fn finish_read(&self, outcome: DirectionOutcome) {
        self.finish(&self.read_outcome, outcome);
    }

    pub(super) fn finish_write(&self, outcome: DirectionOutcome) {
        self.finish(&self.write_outcome, outcome);
    }

    fn is_gracefully_closed(&self) -> bool {
        // an abort after both directions drained still counts
        !self.aborted.load(Ordering::Relaxed)
            && self.read_outcome.get() == Some(&DirectionOutcome::Graceful)
            && self.write_outcome.get() == Some(&DirectionOutcome::Graceful)
    }
}

/// A handle to abort a stream from another task, while the stream itself
/// is busy reading or writing.
#[derive(Clone)]
pub struct StreamAbortHandle {
    shared: Arc<StreamShared>,
}

impl StreamAbortHandle {
    pub fn abort_read(&self, code: ErrorCode, reason: &str) {
        self.shared
            .abort_read(code, StreamError::Aborted(Arc::from(reason)));
    }

    pub fn abort_write(&self, code: ErrorCode) {
        self.shared.abort_write(
            code,
            StreamError::Aborted(Arc::from("write aborted by application")),
        );
    }
}

/// A byte stream over one native stream of a multiplexed connection.
///
/// Data received from the peer is read from [`input`](Self::input), data
/// to send is written to [`output`](Self::output). Completing the output
/// pipe gracefully finishes the native send side.
///
/// Streams should be released by [`dispose`](Self::dispose), which lets
/// a gracefully closed stream go back to the pool of its connection.
pub struct Stream<C: NativeConnection> {
    slot_id: u64,
    id: u64,
    connection_id: String,
    direction: StreamDirection,
    can_read: bool,
    can_write: bool,
    input: PipeReader,
    output: PipeWriter,
    shared: Arc<StreamShared>,
    recv_task: Option<JoinHandle<Vec<u8>>>,
    send_task: Option<JoinHandle<()>>,
    recv_buf: Vec<u8>,
    persistent_state: StateMap,
    items: StateMap,
    pool_expiration: Option<Instant>,
    connection: Weak<ConnectionInner<C>>,
    config: Arc<MuxTransportConfig>,
}

fn activate_shared<C: NativeConnection>(
    native: &NativeStreamOf<C>,
    conn: &ConnectionInner<C>,
) -> Arc<StreamShared> {
    let loops = usize::from(native.can_read()) + usize::from(native.can_write());
    Arc::new(StreamShared::new(
        format!("{}:{}", conn.id(), native.id),
        conn.config().default_stream_error_code(),
        Arc::clone(conn.signal()),
        loops,
    ))
}

impl<C: NativeConnection> Stream<C> {
    pub(crate) fn new(native: NativeStreamOf<C>, conn: &Arc<ConnectionInner<C>>) -> Self {
        let config = Arc::clone(conn.config());
        let (input_writer, input) = pipe(config.input_pipe_config());
        let (output, output_reader) = pipe(config.output_pipe_config());
        let shared = activate_shared(&native, conn);

        let mut stream = Stream {
            slot_id: conn.next_slot_id(),
            id: native.id,
            connection_id: shared.log_id().to_string(),
            direction: native.direction(),
            can_read: native.can_read(),
            can_write: native.can_write(),
            input,
            output,
            shared,
            recv_task: None,
            send_task: None,
            recv_buf: Vec::new(),
            persistent_state: StateMap::default(),
            items: StateMap::default(),
            pool_expiration: None,
            connection: Arc::downgrade(conn),
            config,
        };
        stream.start_loops(native, input_writer, output_reader, conn.loop_tracker());
        stream
    }

    /// Swap in a new native stream, only allowed on an idle wrapper.
    pub(crate) fn rebind(&mut self, native: NativeStreamOf<C>, conn: &Arc<ConnectionInner<C>>) {
        let input_writer = self.input.reset();
        let output_reader = self.output.reset();
        self.items.clear();
        self.connection = Arc::downgrade(conn);

        self.shared = activate_shared(&native, conn);
        self.id = native.id;
        self.connection_id = self.shared.log_id().to_string();
        self.direction = native.direction();
        self.can_read = native.can_read();
        self.can_write = native.can_write();
        self.pool_expiration = None;
        self.start_loops(native, input_writer, output_reader, conn.loop_tracker());
    }

    fn start_loops(
        &mut self,
        native: NativeStreamOf<C>,
        mut input_writer: PipeWriter,
        mut output_reader: PipeReader,
        tracker: &TaskTracker,
    ) {
        let shared = Arc::clone(&self.shared);

        match native.recv {
            Some(recv) => {
                let mut buf = std::mem::take(&mut self.recv_buf);
                // an empty buffer would never make progress
                buf.resize(self.config.recv_chunk_size().max(1), 0);
                self.recv_task = Some(tracker.spawn(pump::recv_loop(
                    recv,
                    input_writer,
                    Arc::clone(&shared),
                    buf,
                )));
            }
            None => {
                // nothing will ever be received
                input_writer.complete(None);
                shared.set_read_eos();
                let _ = shared.read_outcome.set(DirectionOutcome::Graceful);
            }
        }
        match native.send {
            Some(send) => {
                self.send_task = Some(tracker.spawn(pump::send_loop(send, output_reader, shared)));
            }
            None => {
                output_reader.complete(None);
                let _ = shared.write_outcome.set(DirectionOutcome::Graceful);
            }
        }
    }

    /// The native stream id.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Identity of this wrapper, kept when it is reused from the pool.
    #[inline]
    pub fn slot_id(&self) -> u64 {
        self.slot_id
    }

    /// `{connection id}:{stream id}`
    #[inline]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    #[inline]
    pub fn direction(&self) -> StreamDirection {
        self.direction
    }

    #[inline]
    pub fn can_read(&self) -> bool {
        self.can_read
    }

    #[inline]
    pub fn can_write(&self) -> bool {
        self.can_write
    }

    /// Data received from the peer.
    pub fn input(&mut self) -> &mut PipeReader {
        &mut self.input
    }

    /// Data to be sent to the peer.
    pub fn output(&mut self) -> &mut PipeWriter {
        &mut self.output
    }

    pub fn abort_handle(&self) -> StreamAbortHandle {
        StreamAbortHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Stop receiving. The peer is asked to stop sending with `code`, and
    /// a pending read on the input pipe fails with `reason`.
    pub fn abort_read(&self, code: ErrorCode, reason: &str) {
        self.shared
            .abort_read(code, StreamError::Aborted(Arc::from(reason)));
    }

    /// Stop sending. The peer will see a reset with `code`.
    pub fn abort_write(&self, code: ErrorCode) {
        self.abort_handle().abort_write(code);
    }

    pub fn error_code(&self) -> ErrorCode {
        self.shared.error_code()
    }

    pub fn set_error_code(&self, code: i64) -> Result<(), InvalidErrorCode> {
        let code = ErrorCode::try_from(code)?;
        self.shared.set_error_code(code);
        Ok(())
    }

    /// Values that stay with this wrapper across reuse.
    pub fn persistent_state(&self) -> &StateMap {
        &self.persistent_state
    }

    pub fn persistent_state_mut(&mut self) -> &mut StateMap {
        &mut self.persistent_state
    }

    /// Values for the current use only, cleared on reuse.
    pub fn items(&self) -> &StateMap {
        &self.items
    }

    pub fn items_mut(&mut self) -> &mut StateMap {
        &mut self.items
    }

    /// Run `cb` when both loops of the current use have exited.
    pub fn on_closed<F>(&self, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.closed.on_fired(cb);
    }

    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    pub fn read_outcome(&self) -> Option<DirectionOutcome> {
        self.shared.read_outcome.get().copied()
    }

    pub fn write_outcome(&self) -> Option<DirectionOutcome> {
        self.shared.write_outcome.get().copied()
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.aborted.load(Ordering::Relaxed)
    }

    /// Both directions completed without error, and no abort was requested.
    pub fn is_gracefully_closed(&self) -> bool {
        self.shared.is_gracefully_closed()
    }

    pub(crate) fn is_reusable(&self) -> bool {
        self.recv_task.is_none() && self.send_task.is_none() && self.is_gracefully_closed()
    }

    /// Only set while the stream is in the pool.
    pub fn pool_expiration(&self) -> Option<Instant> {
        self.pool_expiration
    }

    pub(crate) fn set_pool_expiration(&mut self, expiration: Instant) {
        self.pool_expiration = Some(expiration);
    }

    async fn join_loops(&mut self) {
        async fn join<T>(task: &mut Option<JoinHandle<T>>) -> Option<Result<T, JoinError>> {
            let handle = task.as_mut()?;
            let r = handle.await;
            *task = None;
            Some(r)
        }

        let mut recv_task = self.recv_task.take();
        let mut send_task = self.send_task.take();

        let timeout = self.config.loop_exit_timeout();
        let joined = tokio::time::timeout(timeout, async {
            tokio::join!(join(&mut recv_task), join(&mut send_task))
        })
        .await;
        let (recv_r, send_r) = match joined {
            Ok(r) => r,
            Err(_) => {
                warn!(
                    "MUX[{}] stream loops did not exit in {timeout:?}, cancel them",
                    self.connection_id
                );
                self.shared.cancel_loops();
                tokio::join!(join(&mut recv_task), join(&mut send_task))
            }
        };

        match recv_r {
            Some(Ok(buf)) => self.recv_buf = buf,
            Some(Err(e)) => warn!("MUX[{}] recv loop failed: {e}", self.connection_id),
            None => {}
        }
        if let Some(Err(e)) = send_r {
            warn!("MUX[{}] send loop failed: {e}", self.connection_id);
        }
    }

    /// Release the stream and wait for its loops to exit.
    ///
    /// A read side that has not reached the end of stream is aborted with
    /// the stream error code, and the output is completed gracefully. The
    /// wrapper goes back to the pool if both directions ended gracefully.
    pub async fn dispose(mut self) -> StreamDisposition {
        self.input.complete(None);
        self.output.complete(None);
        if !self.shared.read_settled() {
            self.shared.abort_read(
                self.shared.error_code(),
                StreamError::Aborted(Arc::from("stream disposed")),
            );
        }
        self.join_loops().await;

        let Some(conn) = self.connection.upgrade() else {
            return StreamDisposition::Discarded(DiscardReason::ConnectionClosed);
        };
        let stats = conn.stats();
        if self.is_aborted() {
            stats.add_stream_aborted();
        }
        if !self.is_reusable() {
            debug!(
                "MUX[{}] stream discarded as it is not gracefully closed",
                self.connection_id
            );
            stats.add_stream_discarded_not_reusable();
            return StreamDisposition::Discarded(DiscardReason::NotReusable);
        }
        conn.return_stream(self)
    }
}

impl<C: NativeConnection> Drop for Stream<C> {
    fn drop(&mut self) {
        if self.recv_task.is_some() || self.send_task.is_some() {
            self.shared.cancel_loops();
        }
    }
}

impl<C: NativeConnection> fmt::Debug for Stream<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("slot_id", &self.slot_id)
            .field("connection_id", &self.connection_id)
            .field("direction", &self.direction)
            .field("read_outcome", &self.read_outcome())
            .field("write_outcome", &self.write_outcome())
            .finish()
    }
}
