// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Inbound side of the TCP transport
//!
//! Accepts connections from the other ranks, decodes frames with the zero-copy codec
//! and hands them to the transport for routing.

use futures::StreamExt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};

use super::framing::TcpFrameCodec;
use super::transport::{TcpShared, configure_stream};

pub(super) struct TcpListener {
    listener: TokioTcpListener,
    shared: Arc<TcpShared>,
}

impl TcpListener {
    /// Binds `bind_addr`, or adopts `prebound` when given.
    pub(super) async fn bind(
        bind_addr: SocketAddr,
        prebound: Option<std::net::TcpListener>,
        shared: Arc<TcpShared>,
    ) -> io::Result<Self> {
        let listener = if let Some(std_listener) = prebound {
            // Set non-blocking for tokio conversion
            std_listener.set_nonblocking(true)?;
            TokioTcpListener::from_std(std_listener)?
        } else {
            TokioTcpListener::bind(bind_addr).await?
        };

        Ok(Self { listener, shared })
    }

    pub(super) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop; runs until the transport is cancelled.
    pub(super) async fn serve(self) {
        let cancel_token = self.shared.cancel_token().clone();

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            debug!("Accepted TCP connection from {}", peer_addr);

                            let shared = self.shared.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, shared).await {
                                    warn!("Error handling connection from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept TCP connection: {}", e);
                        }
                    }
                }
                _ = cancel_token.cancelled() => {
                    info!("TCP listener shutting down");
                    break;
                }
            }
        }
    }
}

/// Handle a single TCP connection
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    shared: Arc<TcpShared>,
) -> io::Result<()> {
    configure_stream(&stream, shared.options(), peer_addr);

    let mut framed = FramedRead::new(stream, TcpFrameCodec::new());
    let cancel_token = shared.cancel_token().clone();

    loop {
        tokio::select! {
            frame_result = framed.next() => {
                match frame_result {
                    Some(Ok(frame)) => shared.route_frame(frame, peer_addr),
                    Some(Err(e)) => {
                        error!("Frame decode error from {}: {}", peer_addr, e);
                        return Err(e);
                    }
                    None => {
                        // Connection closed gracefully (FIN received)
                        debug!("Connection from {} closed gracefully", peer_addr);
                        break;
                    }
                }
            }
            _ = cancel_token.cancelled() => {
                debug!("Connection handler for {} cancelled", peer_addr);
                break;
            }
        }
    }

    Ok(())
}
