/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::time::Instant;

type HeartbeatCallback = Arc<dyn Fn(Instant) + Send + Sync>;

struct HeartbeatInner {
    interval: Duration,
    next_id: Mutex<u64>,
    callbacks: Mutex<HashMap<u64, HeartbeatCallback>>,
}

/// A periodic tick shared by all connections of a transport, used to
/// sweep the expired entries of each stream pool.
#[derive(Clone)]
pub struct Heartbeat {
    inner: Arc<HeartbeatInner>,
}

impl Heartbeat {
    /// Create a heartbeat that is driven manually by [`on_heartbeat`](Self::on_heartbeat).
    pub fn new(interval: Duration) -> Self {
        Heartbeat {
            inner: Arc::new(HeartbeatInner {
                interval,
                next_id: Mutex::new(0),
                callbacks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Create a heartbeat and drive it from a background task.
    ///
    /// The task quits once all handles and registrations are gone.
    pub fn spawn(interval: Duration) -> Self {
        let heartbeat = Heartbeat::new(interval);
        let run = Arc::clone(&heartbeat.inner);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(run.interval);
            // the first tick completes immediately
            interval.tick().await;

            loop {
                let now = interval.tick().await;
                if Arc::strong_count(&run) <= 1 {
                    let has_callback = !run.callbacks.lock().unwrap().is_empty();
                    if !has_callback {
                        break;
                    }
                }
                fire(&run, now);
            }
        });

        heartbeat
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Register a callback to be called on each tick, until the returned
    /// registration is dropped.
    pub fn register<F>(&self, callback: F) -> HeartbeatRegistration
    where
        F: Fn(Instant) + Send + Sync + 'static,
    {
        let id = {
            let mut next_id = self.inner.next_id.lock().unwrap();
            let id = *next_id;
            *next_id += 1;
            id
        };
        self.inner
            .callbacks
            .lock()
            .unwrap()
            .insert(id, Arc::new(callback));
        HeartbeatRegistration {
            id,
            heartbeat: Arc::downgrade(&self.inner),
        }
    }

    pub fn on_heartbeat(&self, now: Instant) {
        fire(&self.inner, now);
    }

    pub fn registered_count(&self) -> usize {
        self.inner.callbacks.lock().unwrap().len()
    }
}

fn fire(inner: &HeartbeatInner, now: Instant) {
    // call out of the lock, so callbacks may register or unregister
    let callbacks: Vec<HeartbeatCallback> =
        inner.callbacks.lock().unwrap().values().cloned().collect();
    for cb in callbacks {
        cb(now);
    }
}

pub struct HeartbeatRegistration {
    id: u64,
    heartbeat: Weak<HeartbeatInner>,
}

impl Drop for HeartbeatRegistration {
    fn drop(&mut self) {
        if let Some(inner) = self.heartbeat.upgrade() {
            inner.callbacks.lock().unwrap().remove(&self.id);
        }
    }
}
