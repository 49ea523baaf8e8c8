/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::sync::Arc;

use super::{Completion, FlushResult, PipeError, PipeReader, Shared, lock_state};
use crate::StreamError;

pub struct PipeWriter {
    shared: Arc<Shared>,
    generation: u64,
    completed: bool,
}

impl PipeWriter {
    pub(super) fn new(shared: Arc<Shared>, generation: u64) -> Self {
        PipeWriter {
            shared,
            generation,
            completed: false,
        }
    }

    /// Append `data` and flush it.
    ///
    /// Data written after the reader completed is silently dropped, check
    /// [`FlushResult::completed`] to find out.
    pub async fn write(&mut self, data: &[u8]) -> Result<FlushResult, PipeError> {
        {
            let mut state = lock_state(&self.shared, self.generation)?;
            if self.completed {
                return Err(PipeError::Completed);
            }
            match &state.reader {
                Completion::Open => {}
                Completion::Done => {
                    return Ok(FlushResult {
                        completed: true,
                        canceled: false,
                    });
                }
                Completion::Failed(e) => return Err(PipeError::Failed(e.clone())),
            }
            if !data.is_empty() {
                state.buffer.extend_from_slice(data);
                state.pending += data.len();
            }
        }
        if !data.is_empty() {
            self.shared.readable.notify_one();
        }

        self.flush().await
    }

    /// Wait until the reader has caught up if the pipe is paused.
    pub async fn flush(&mut self) -> Result<FlushResult, PipeError> {
        let pause = self.shared.config.pause_threshold;
        let resume = self.shared.config.resume_threshold;
        let mut paused = false;

        loop {
            {
                let mut state = lock_state(&self.shared, self.generation)?;
                if state.cancel_flush {
                    state.cancel_flush = false;
                    return Ok(FlushResult {
                        completed: false,
                        canceled: true,
                    });
                }
                match &state.reader {
                    Completion::Open => {}
                    Completion::Done => {
                        return Ok(FlushResult {
                            completed: true,
                            canceled: false,
                        });
                    }
                    Completion::Failed(e) => return Err(PipeError::Failed(e.clone())),
                }

                if pause == 0 {
                    return Ok(FlushResult::default());
                }
                if paused {
                    if state.pending <= resume {
                        return Ok(FlushResult::default());
                    }
                } else if state.pending < pause {
                    return Ok(FlushResult::default());
                } else {
                    paused = true;
                }
            }
            self.shared.writable.notified().await;
        }
    }

    /// Number of bytes written but not yet consumed by the reader.
    pub fn pending(&self) -> usize {
        lock_state(&self.shared, self.generation)
            .map(|s| s.pending)
            .unwrap_or_default()
    }

    /// Mark the end of data, or fail the reader with `error`.
    pub fn complete(&mut self, error: Option<StreamError>) {
        if self.completed {
            return;
        }
        self.completed = true;

        let Ok(mut state) = lock_state(&self.shared, self.generation) else {
            return;
        };
        if state.writer.set(error) {
            drop(state);
            self.shared.readable.notify_one();
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Whether the reader side has completed, gracefully or not.
    pub fn is_reader_completed(&self) -> bool {
        match lock_state(&self.shared, self.generation) {
            Ok(state) => !state.reader.is_open(),
            Err(_) => true,
        }
    }

    pub fn cancel_pending_flush(&self) {
        self.canceller().cancel();
    }

    pub fn canceller(&self) -> PipeFlushCanceller {
        PipeFlushCanceller {
            shared: Arc::clone(&self.shared),
            generation: self.generation,
        }
    }

    /// Reuse the pipe, all ends handed out before become stale.
    pub fn reset(&mut self) -> PipeReader {
        let mut state = self.shared.state.lock().unwrap();
        let generation = state.reset();
        drop(state);

        self.generation = generation;
        self.completed = false;
        PipeReader::new(Arc::clone(&self.shared), generation)
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        if !self.completed {
            self.complete(Some(StreamError::Transport(Arc::from(
                "pipe writer dropped without completion",
            ))));
        }
    }
}

#[derive(Clone)]
pub struct PipeFlushCanceller {
    shared: Arc<Shared>,
    generation: u64,
}

impl PipeFlushCanceller {
    pub fn cancel(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if state.generation != self.generation {
            return;
        }
        state.cancel_flush = true;
        drop(state);
        self.shared.writable.notify_one();
    }
}
