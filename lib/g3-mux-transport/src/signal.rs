/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::sync::{Mutex, OnceLock};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

type Callback = Box<dyn FnOnce() + Send>;

/// A signal that fires at most once, with a latched reason.
pub(crate) struct CloseSignal<E> {
    token: CancellationToken,
    reason: OnceLock<E>,
    callbacks: Mutex<(bool, Vec<Callback>)>,
}

impl<E: Clone> CloseSignal<E> {
    pub(crate) fn new(token: CancellationToken) -> Self {
        CloseSignal {
            token,
            reason: OnceLock::new(),
            callbacks: Mutex::new((false, Vec::new())),
        }
    }

    /// Returns true only for the call that actually fired the signal.
    pub(crate) fn fire(&self, reason: E) -> bool {
        if self.reason.set(reason).is_err() {
            return false;
        }
        self.token.cancel();

        let callbacks = {
            let mut guard = self.callbacks.lock().unwrap();
            guard.0 = true;
            std::mem::take(&mut guard.1)
        };
        for cb in callbacks {
            cb();
        }
        true
    }

    /// Run `cb` once the signal fires, or right now if it already has.
    pub(crate) fn on_fired<F>(&self, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut guard = self.callbacks.lock().unwrap();
        if guard.0 {
            drop(guard);
            cb();
        } else {
            guard.1.push(Box::new(cb));
        }
    }

    pub(crate) fn reason(&self) -> Option<E> {
        self.reason.get().cloned()
    }

    #[inline]
    pub(crate) fn is_fired(&self) -> bool {
        self.reason.get().is_some()
    }

    #[inline]
    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}
