/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

#![allow(dead_code)]

use std::sync::Arc;

use g3_mux_transport::native::loopback::{self, LoopbackConnection};
use g3_mux_transport::{Connection, Heartbeat, MuxTransportConfig, MuxTransportStats};

pub struct ConnectionPair {
    pub client: Connection<LoopbackConnection>,
    pub server: Connection<LoopbackConnection>,
    pub heartbeat: Heartbeat,
    pub stats: Arc<MuxTransportStats>,
}

pub fn connect(config: MuxTransportConfig) -> ConnectionPair {
    let config = Arc::new(config);
    let heartbeat = Heartbeat::new(config.heartbeat_interval());
    let stats = Arc::new(MuxTransportStats::default());

    let (client, server) = loopback::pair();
    let client = Connection::new(client, config.clone(), &heartbeat, stats.clone());
    let server = Connection::new(server, config, &heartbeat, stats.clone());
    ConnectionPair {
        client,
        server,
        heartbeat,
        stats,
    }
}

pub fn connect_default() -> ConnectionPair {
    connect(MuxTransportConfig::default())
}
