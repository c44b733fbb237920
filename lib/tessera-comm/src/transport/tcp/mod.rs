// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! TCP Transport Module
//!
//! - Zero-copy frame codec
//! - One lazily connected writer task per peer, fed by an unbounded queue
//! - Rendezvous across the wire through `Ack`/`Nack` frames keyed by sequence number
//! - Keep-alive for dead connection detection

mod framing;
mod listener;
mod transport;

use anyhow::{Context, Result};
use std::net::{SocketAddr, ToSocketAddrs};

pub use framing::{FRAME_HEADER_SIZE, Frame, FrameType, MAX_PAYLOAD_SIZE, TcpFrameCodec};
pub use transport::{TcpOptions, TcpTransport, TcpTransportBuilder};

/// Parse a TCP endpoint string into a SocketAddr
///
/// Accepts formats:
/// - "tcp://host:port"
/// - "host:port"
pub fn parse_tcp_endpoint(endpoint: &str) -> Result<SocketAddr> {
    let addr_str = endpoint.strip_prefix("tcp://").unwrap_or(endpoint);

    let mut addrs = addr_str
        .to_socket_addrs()
        .with_context(|| format!("failed to parse socket address {endpoint:?}"))?;

    addrs
        .next()
        .ok_or_else(|| anyhow::anyhow!("no addresses resolved for {endpoint:?}"))
}
