/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

//! A single producer, single consumer byte pipe with backpressure.
//!
//! The writer appends bytes and is suspended in flush once the amount of
//! unconsumed data reaches the pause threshold, until the reader has
//! consumed enough to drop below the resume threshold. The reader gets
//! all data not yet consumed on each read, and tells the pipe how much
//! it consumed and how much it examined. Each side completes on its own,
//! optionally with an error that the other side will observe.

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::sync::Notify;

use crate::StreamError;

mod reader;
pub use reader::{PipeReadCanceller, PipeReader};

mod writer;
pub use writer::{PipeFlushCanceller, PipeWriter};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipeError {
    #[error("peer side failed: {0}")]
    Failed(StreamError),
    #[error("this side has already been completed")]
    Completed,
    #[error("the pipe has been reset")]
    Stale,
}

impl PipeError {
    pub fn get_type(&self) -> &'static str {
        match self {
            PipeError::Failed(_) => "Failed",
            PipeError::Completed => "Completed",
            PipeError::Stale => "Stale",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipeConfig {
    pause_threshold: usize,
    resume_threshold: usize,
}

impl PipeConfig {
    /// A pause threshold of zero disables backpressure.
    pub fn new(pause_threshold: usize) -> Self {
        PipeConfig {
            pause_threshold,
            resume_threshold: pause_threshold / 2,
        }
    }

    pub fn unbounded() -> Self {
        PipeConfig::new(0)
    }

    pub fn set_resume_threshold(&mut self, threshold: usize) {
        self.resume_threshold = threshold.min(self.pause_threshold);
    }

    #[inline]
    pub fn pause_threshold(&self) -> usize {
        self.pause_threshold
    }

    #[inline]
    pub fn resume_threshold(&self) -> usize {
        self.resume_threshold
    }
}

impl Default for PipeConfig {
    fn default() -> Self {
        PipeConfig::new(64 * 1024)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadResult {
    /// All bytes handed out and not yet consumed.
    pub data: Bytes,
    /// The writer completed gracefully, no more data will follow.
    pub completed: bool,
    /// The read was woken by [`PipeReader::cancel_pending_read`].
    pub canceled: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushResult {
    /// The reader completed, further writes will be discarded.
    pub completed: bool,
    /// The flush was woken by [`PipeWriter::cancel_pending_flush`].
    pub canceled: bool,
}

#[derive(Clone, Debug, Default)]
enum Completion {
    #[default]
    Open,
    Done,
    Failed(StreamError),
}

impl Completion {
    fn is_open(&self) -> bool {
        matches!(self, Completion::Open)
    }

    fn set(&mut self, error: Option<StreamError>) -> bool {
        if !self.is_open() {
            return false;
        }
        *self = match error {
            Some(e) => Completion::Failed(e),
            None => Completion::Done,
        };
        true
    }
}

#[derive(Default)]
struct PipeState {
    generation: u64,
    buffer: BytesMut,
    /// written but not yet consumed, including what the reader holds
    pending: usize,
    writer: Completion,
    reader: Completion,
    cancel_read: bool,
    cancel_flush: bool,
}

impl PipeState {
    fn reset(&mut self) -> u64 {
        let generation = self.generation.wrapping_add(1);
        *self = PipeState {
            generation,
            ..Default::default()
        };
        generation
    }
}

struct Shared {
    config: PipeConfig,
    state: Mutex<PipeState>,
    readable: Notify,
    writable: Notify,
}

/// Lock the state for one end, which must not be from an older generation.
fn lock_state(
    shared: &Shared,
    generation: u64,
) -> Result<MutexGuard<'_, PipeState>, PipeError> {
    let state = shared.state.lock().unwrap();
    if state.generation != generation {
        return Err(PipeError::Stale);
    }
    Ok(state)
}

pub fn pipe(config: PipeConfig) -> (PipeWriter, PipeReader) {
    let shared = Arc::new(Shared {
        config,
        state: Mutex::new(PipeState::default()),
        readable: Notify::new(),
        writable: Notify::new(),
    });
    (
        PipeWriter::new(Arc::clone(&shared), 0),
        PipeReader::new(shared, 0),
    )
}
