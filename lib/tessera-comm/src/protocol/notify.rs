// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Tensor notifications: a node tells another that tensors it created are now readable.
//!
//! The payload is the bare list of tensor ids, little-endian `i32` each. A list holding
//! [`Tid::NONE`] is the shutdown sentinel a node sends to itself to stop its notification
//! loop.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use tessera_common::{NodeId, Tid};

use crate::channel::Channel;
use crate::communicator::Communicator;
use crate::error::CommError;
use crate::mailbox::Peer;

/// Tensor ids announced by `source`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub source: NodeId,
    pub tids: Vec<Tid>,
}

impl Notification {
    /// Whether this is the sentinel that ends a notification loop.
    pub fn is_shutdown(&self) -> bool {
        self.tids.contains(&Tid::NONE)
    }
}

impl Communicator {
    /// Announces `tids` to `target`. The tensors must already be committed locally.
    pub async fn notify_created(&self, target: NodeId, tids: &[Tid]) -> Result<(), CommError> {
        debug!("{} notifying {} of {} tensor(s)", self.rank(), target, tids.len());
        self.send_sync(encode_tids(tids), target, Channel::Notify)
            .await
    }

    /// Waits for the next notification from any node.
    pub async fn receive_notification(&self) -> Result<Notification, CommError> {
        let receipt = self.probe(Peer::Any, Channel::Notify).await?;
        let source = receipt.source();
        let byte_count = receipt.byte_count();
        if byte_count % Tid::WIDTH != 0 {
            // dropping the receipt fails the sender's rendezvous
            return Err(CommError::MalformedNotification(byte_count));
        }

        let blob = self.receive_bytes(receipt);
        let tids = blob
            .chunks_exact(Tid::WIDTH)
            .map(|chunk| {
                let mut raw = [0u8; Tid::WIDTH];
                raw.copy_from_slice(chunk);
                Tid::from_le_bytes(raw)
            })
            .collect();

        Ok(Notification { source, tids })
    }

    /// Sends the shutdown sentinel to this node's own notification channel.
    pub async fn notify_shutdown(&self) -> Result<(), CommError> {
        self.notify_created(self.rank(), &[Tid::NONE]).await
    }
}

fn encode_tids(tids: &[Tid]) -> Bytes {
    let mut buf = BytesMut::with_capacity(tids.len() * Tid::WIDTH);
    for tid in tids {
        buf.put_slice(&tid.to_le_bytes());
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::timeout;

    use crate::transport::local::LocalFabric;

    use super::*;

    fn tids(raw: &[i32]) -> Vec<Tid> {
        raw.iter().copied().map(Tid::new).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_notification_carries_source_and_order() {
        let group: Vec<Arc<Communicator>> = LocalFabric::group(3)
            .await
            .unwrap()
            .into_iter()
            .map(Arc::new)
            .collect();

        let sender = group[2].clone();
        let send = tokio::spawn(async move {
            sender.notify_created(NodeId::new(0), &tids(&[7, 3, 11])).await?;
            sender.notify_created(NodeId::new(0), &tids(&[42])).await
        });

        let first = group[0].receive_notification().await.unwrap();
        assert_eq!(first.source, NodeId::new(2));
        assert_eq!(first.tids, tids(&[7, 3, 11]));
        assert!(!first.is_shutdown());

        let second = group[0].receive_notification().await.unwrap();
        assert_eq!(second.tids, tids(&[42]));

        send.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_empty_notification() {
        let group = LocalFabric::group(2).await.unwrap();
        let request = group[1].send_async(Bytes::new(), NodeId::new(0), Channel::Notify);
        let notification = group[0].receive_notification().await.unwrap();
        assert!(notification.tids.is_empty());
        request.wait().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_partial_tid_is_rejected() {
        let group = LocalFabric::group(2).await.unwrap();
        let request = group[1].send_async(vec![0u8; 6], NodeId::new(0), Channel::Notify);
        assert!(matches!(
            group[0].receive_notification().await,
            Err(CommError::MalformedNotification(6))
        ));
        assert!(matches!(
            request.wait().await,
            Err(CommError::Unmatched { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_sentinel_ends_loop() {
        let group = LocalFabric::group(1).await.unwrap();
        let comm = Arc::new(group.into_iter().next().unwrap());

        let receiver = comm.clone();
        let notification_loop = tokio::spawn(async move {
            let mut seen = Vec::new();
            loop {
                let notification = receiver.receive_notification().await?;
                if notification.is_shutdown() {
                    return Ok::<_, CommError>(seen);
                }
                seen.extend(notification.tids);
            }
        });

        comm.notify_created(NodeId::new(0), &tids(&[1, 2])).await.unwrap();
        comm.notify_shutdown().await.unwrap();

        let seen = timeout(Duration::from_secs(2), notification_loop)
            .await
            .expect("loop should stop")
            .unwrap()
            .unwrap();
        assert_eq!(seen, tids(&[1, 2]));
    }
}
