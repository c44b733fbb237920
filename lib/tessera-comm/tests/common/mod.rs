// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tessera_comm::{Communicator, LocalFabric, NodeId, TcpTransport, TensorLocation, Tid};

pub fn node(rank: u32) -> NodeId {
    NodeId::new(rank)
}

pub fn at(tid: i32, rank: u32) -> TensorLocation {
    TensorLocation::new(Tid::new(tid), node(rank))
}

pub async fn local_group(size: u32) -> Vec<Arc<Communicator>> {
    LocalFabric::group(size)
        .await
        .unwrap()
        .into_iter()
        .map(Arc::new)
        .collect()
}

/// Loopback listeners bound to ephemeral ports, one per rank, with their addresses.
pub fn bind_listeners(size: u32) -> (Vec<std::net::TcpListener>, Vec<SocketAddr>) {
    let listeners: Vec<std::net::TcpListener> = (0..size)
        .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    let peers = listeners
        .iter()
        .map(|listener| listener.local_addr().unwrap())
        .collect();
    (listeners, peers)
}

/// A full group of communicators talking over loopback TCP.
pub async fn tcp_group(size: u32) -> Vec<Arc<Communicator>> {
    let (listeners, peers) = bind_listeners(size);
    let mut group = Vec::with_capacity(size as usize);
    for (rank, listener) in listeners.into_iter().enumerate() {
        let transport = TcpTransport::builder()
            .peers(peers.clone())
            .listener(listener)
            .retry_interval(Duration::from_millis(20))
            .build()
            .unwrap();
        let comm = Communicator::new(node(rank as u32), size, Arc::new(transport))
            .await
            .unwrap();
        group.push(Arc::new(comm));
    }
    group
}
