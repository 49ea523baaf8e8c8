/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::sync::Arc;

use log::{info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::heartbeat::Heartbeat;
use crate::native::NativeListener;
use crate::{Connection, MuxTransportConfig, MuxTransportStats};

/// Accepts native connections in the background and queues them as
/// [`Connection`]s, up to the configured backlog.
pub struct TransportListener<L: NativeListener> {
    receiver: mpsc::Receiver<Connection<L::Connection>>,
    token: CancellationToken,
    stats: Arc<MuxTransportStats>,
}

impl<L: NativeListener> TransportListener<L> {
    pub fn bind(
        native: L,
        config: Arc<MuxTransportConfig>,
        heartbeat: Heartbeat,
        stats: Arc<MuxTransportStats>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.accept_backlog().max(1));
        let token = CancellationToken::new();

        let task_token = token.clone();
        let task_stats = Arc::clone(&stats);
        tokio::spawn(async move {
            info!("MUX listener started");
            loop {
                let r = tokio::select! {
                    biased;

                    _ = task_token.cancelled() => break,
                    r = native.accept() => r,
                };
                let native_conn = match r {
                    Some(Ok(c)) => c,
                    Some(Err(e)) => {
                        warn!("MUX listener accept: {e}");
                        continue;
                    }
                    None => break,
                };

                let conn = Connection::new(
                    native_conn,
                    Arc::clone(&config),
                    &heartbeat,
                    Arc::clone(&task_stats),
                );
                tokio::select! {
                    biased;

                    _ = task_token.cancelled() => break,
                    r = sender.send(conn) => {
                        if r.is_err() {
                            break;
                        }
                    }
                }
            }
            native.close();
            info!("MUX listener stopped");
        });

        TransportListener {
            receiver,
            token,
            stats,
        }
    }

    /// Wait for the next connection, `None` once the listener is unbound
    /// and all queued connections have been taken.
    pub async fn accept(&mut self) -> Option<Connection<L::Connection>> {
        self.receiver.recv().await
    }

    /// Stop accepting new connections.
    pub fn unbind(&self) {
        self.token.cancel();
    }

    pub fn stats(&self) -> &Arc<MuxTransportStats> {
        &self.stats
    }
}

impl<L: NativeListener> Drop for TransportListener<L> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
