/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::sync::Arc;

use bytes::{Buf, BytesMut};

use super::{Completion, PipeError, PipeWriter, ReadResult, Shared, lock_state};
use crate::StreamError;

pub struct PipeReader {
    shared: Arc<Shared>,
    generation: u64,
    unconsumed: bytes::Bytes,
    examined_all: bool,
    completed: bool,
}

impl PipeReader {
    pub(super) fn new(shared: Arc<Shared>, generation: u64) -> Self {
        PipeReader {
            shared,
            generation,
            unconsumed: bytes::Bytes::new(),
            examined_all: false,
            completed: false,
        }
    }

    fn poll_state(&mut self) -> Result<Option<ReadResult>, PipeError> {
        // a stale end is reported as such even if it was completed
        let mut state = lock_state(&self.shared, self.generation)?;
        if self.completed {
            return Err(PipeError::Completed);
        }
        if state.cancel_read {
            state.cancel_read = false;
            return Ok(Some(ReadResult {
                data: self.unconsumed.clone(),
                completed: false,
                canceled: true,
            }));
        }
        if let Completion::Failed(e) = &state.writer {
            return Err(PipeError::Failed(e.clone()));
        }

        if !state.buffer.is_empty() {
            if self.unconsumed.is_empty() {
                self.unconsumed = state.buffer.split().freeze();
            } else {
                let mut merged =
                    BytesMut::with_capacity(self.unconsumed.len() + state.buffer.len());
                merged.extend_from_slice(&self.unconsumed);
                merged.extend_from_slice(&state.buffer);
                state.buffer.clear();
                self.unconsumed = merged.freeze();
            }
            self.examined_all = false;
        }

        let completed = matches!(state.writer, Completion::Done);
        if completed || (!self.unconsumed.is_empty() && !self.examined_all) {
            Ok(Some(ReadResult {
                data: self.unconsumed.clone(),
                completed,
                canceled: false,
            }))
        } else {
            Ok(None)
        }
    }

    /// Wait until there is data not yet examined, or the writer completed.
    ///
    /// The returned data always starts at the first unconsumed byte, the
    /// caller should call [`advance`](Self::advance) or
    /// [`advance_examined`](Self::advance_examined) before the next read.
    pub async fn read(&mut self) -> Result<ReadResult, PipeError> {
        loop {
            if let Some(result) = self.poll_state()? {
                return Ok(result);
            }
            self.shared.readable.notified().await;
        }
    }

    pub fn try_read(&mut self) -> Result<Option<ReadResult>, PipeError> {
        self.poll_state()
    }

    pub fn advance(&mut self, consumed: usize) {
        self.advance_examined(consumed, consumed);
    }

    /// Release `consumed` bytes, and mark `examined` bytes as seen.
    ///
    /// If all the returned data has been examined, the next read will wait
    /// for more data even if some of it is still unconsumed.
    pub fn advance_examined(&mut self, consumed: usize, examined: usize) {
        let len = self.unconsumed.len();
        let consumed = consumed.min(len);
        let examined = examined.clamp(consumed, len);
        self.examined_all = len > 0 && examined == len;
        self.unconsumed.advance(consumed);
        if consumed == 0 {
            return;
        }

        let Ok(mut state) = lock_state(&self.shared, self.generation) else {
            return;
        };
        state.pending = state.pending.saturating_sub(consumed);
        if state.pending <= self.shared.config.resume_threshold {
            drop(state);
            self.shared.writable.notify_one();
        }
    }

    /// Read until the writer completes, consuming everything.
    pub async fn read_to_end(&mut self) -> Result<BytesMut, PipeError> {
        let mut data = BytesMut::new();
        loop {
            let result = self.read().await?;
            data.extend_from_slice(&result.data);
            self.advance(result.data.len());
            if result.completed {
                return Ok(data);
            }
        }
    }

    /// Stop reading. The writer will get a completed flush result, or the
    /// error if there is one.
    pub fn complete(&mut self, error: Option<StreamError>) {
        if self.completed {
            return;
        }
        self.completed = true;
        self.unconsumed = bytes::Bytes::new();

        let Ok(mut state) = lock_state(&self.shared, self.generation) else {
            return;
        };
        if state.reader.set(error) {
            state.buffer.clear();
            state.pending = 0;
            drop(state);
            self.shared.writable.notify_one();
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Whether the writer side has completed, gracefully or not.
    pub fn is_writer_completed(&self) -> bool {
        match lock_state(&self.shared, self.generation) {
            Ok(state) => !state.writer.is_open(),
            Err(_) => true,
        }
    }

    pub fn cancel_pending_read(&self) {
        self.canceller().cancel();
    }

    /// Get a handle that can wake a pending read from another task.
    pub fn canceller(&self) -> PipeReadCanceller {
        PipeReadCanceller {
            shared: Arc::clone(&self.shared),
            generation: self.generation,
        }
    }

    /// Reuse the pipe, all ends handed out before become stale.
    pub fn reset(&mut self) -> PipeWriter {
        let mut state = self.shared.state.lock().unwrap();
        let generation = state.reset();
        drop(state);

        self.generation = generation;
        self.unconsumed = bytes::Bytes::new();
        self.examined_all = false;
        self.completed = false;
        PipeWriter::new(Arc::clone(&self.shared), generation)
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.complete(None);
    }
}

#[derive(Clone)]
pub struct PipeReadCanceller {
    shared: Arc<Shared>,
    generation: u64,
}

impl PipeReadCanceller {
    pub fn cancel(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if state.generation != self.generation {
            return;
        }
        state.cancel_read = true;
        drop(state);
        self.shared.readable.notify_one();
    }
}
