// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! A worker node: the communicator plus the local store, and the loops that serve
//! dispatched commands and tensor notifications.
//!
//! Each command channel has its own receive loop. A loop executes the part of every
//! command it receives whose outputs this node owns, reading inputs by tid from the local
//! store, then announces the created tensors to every other node the command references.
//! Tensors are never moved between nodes here; an input that is not in the local store
//! fails the command on this node.

use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tessera_comm::{
    Command, CommandKind, CommError, Communicator, Notification, TcpTransport, TensorLocation,
};
use tessera_common::{NodeId, Tid};
use tessera_ops::{ApplyOp, BinaryReduceOp, KernelLibrary, OpError};
use tessera_storage::{TensorRegistry, TensorStore};

use crate::config::TesseraConfig;

/// Which node announced which tensor.
#[derive(Debug, Default)]
pub struct RemoteTensorIndex {
    owners: DashMap<Tid, NodeId>,
}

impl RemoteTensorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the tensors of a notification. A tid announced again moves to its new owner.
    pub fn record(&self, notification: &Notification) {
        for &tid in &notification.tids {
            self.owners.insert(tid, notification.source);
        }
    }

    pub fn owner(&self, tid: Tid) -> Option<NodeId> {
        self.owners.get(&tid).map(|entry| *entry.value())
    }

    /// Drops `location` if the index still attributes the tid to that node.
    pub fn forget(&self, location: TensorLocation) -> bool {
        self.owners
            .remove_if(&location.tid, |_, owner| *owner == location.node)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
enum CommandSource {
    Dispatch,
    Forward,
}

impl fmt::Display for CommandSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandSource::Dispatch => write!(f, "dispatch"),
            CommandSource::Forward => write!(f, "forward"),
        }
    }
}

pub struct Node {
    comm: Communicator,
    store: TensorStore,
    registry: TensorRegistry,
    library: KernelLibrary,
    remote: RemoteTensorIndex,
}

impl Node {
    pub fn new(
        comm: Communicator,
        store: TensorStore,
        registry: TensorRegistry,
        library: KernelLibrary,
    ) -> Self {
        Self {
            comm,
            store,
            registry,
            library,
            remote: RemoteTensorIndex::new(),
        }
    }

    /// Joins the TCP group described by `config` and waits for every other rank.
    ///
    /// A runtime that cannot drive concurrent sends and receives is unrecoverable: the
    /// error is logged and the process aborts.
    pub async fn launch(config: &TesseraConfig) -> anyhow::Result<Arc<Self>> {
        let transport = TcpTransport::builder()
            .peers(config.node.peer_addrs()?)
            .options(config.tcp.tcp_options())
            .build()?;

        let comm = match Communicator::new(
            config.node.node_id(),
            config.node.group_size(),
            Arc::new(transport),
        )
        .await
        {
            Ok(comm) => comm,
            Err(CommError::Initialization(reason)) => {
                error!("Communicator initialization failed: {}", reason);
                std::process::abort();
            }
            Err(e) => return Err(e.into()),
        };

        comm.barrier().await?;

        let store = match config.storage.capacity_bytes {
            Some(capacity) => TensorStore::with_capacity(capacity),
            None => TensorStore::new(),
        };

        info!("{} ready, group of {}", comm.rank(), comm.group_size());

        Ok(Arc::new(Self::new(
            comm,
            store,
            TensorRegistry::with_defaults(),
            KernelLibrary::with_defaults(),
        )))
    }

    pub fn rank(&self) -> NodeId {
        self.comm.rank()
    }

    pub fn comm(&self) -> &Communicator {
        &self.comm
    }

    pub fn store(&self) -> &TensorStore {
        &self.store
    }

    pub fn registry(&self) -> &TensorRegistry {
        &self.registry
    }

    pub fn library(&self) -> &KernelLibrary {
        &self.library
    }

    pub fn remote(&self) -> &RemoteTensorIndex {
        &self.remote
    }

    /// Dispatches a command this node originates, then runs the local part if it has one.
    ///
    /// Returns the tensors created locally.
    pub async fn submit(&self, command: &Command) -> anyhow::Result<Vec<Tid>> {
        self.comm.dispatch(command).await?;
        self.run_local(command).await
    }

    /// Relays a command to the nodes it touches on the forward channel, then runs the local
    /// part if it has one.
    pub async fn relay(&self, command: &Command) -> anyhow::Result<Vec<Tid>> {
        self.comm.forward(command).await?;
        self.run_local(command).await
    }

    async fn run_local(&self, command: &Command) -> anyhow::Result<Vec<Tid>> {
        if !command.touches(self.rank()) {
            return Ok(Vec::new());
        }
        let created = tokio::task::block_in_place(|| self.execute(command))?;
        self.announce(command, &created).await?;
        Ok(created)
    }

    /// Serves the dispatch channel until a shutdown command arrives.
    pub async fn serve_dispatch(&self) -> Result<(), CommError> {
        self.serve_commands(CommandSource::Dispatch).await
    }

    /// Serves the forward channel until a shutdown command arrives.
    pub async fn serve_forward(&self) -> Result<(), CommError> {
        self.serve_commands(CommandSource::Forward).await
    }

    async fn serve_commands(&self, source: CommandSource) -> Result<(), CommError> {
        info!("{} serving {} channel", self.rank(), source);
        loop {
            let received = match source {
                CommandSource::Dispatch => self.comm.receive_dispatch().await,
                CommandSource::Forward => self.comm.receive_forward().await,
            };

            let command = match received {
                Ok(command) => command,
                Err(e @ CommError::MalformedCommand { .. }) => {
                    warn!("{} dropped {} message: {}", self.rank(), source, e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            if command.is_shutdown() {
                info!("{} {} loop shutting down", self.rank(), source);
                return Ok(());
            }

            debug!(
                "{} received {} ({:?}) on {}",
                self.rank(),
                command.id,
                command.kind,
                source
            );

            match tokio::task::block_in_place(|| self.execute(&command)) {
                Ok(created) => {
                    if let Err(e) = self.announce(&command, &created).await {
                        warn!("{} could not announce {}: {}", self.rank(), command.id, e);
                    }
                }
                Err(e) => warn!("{} failed {}: {}", self.rank(), command.id, e),
            }
        }
    }

    /// Records announced tensors until the shutdown sentinel arrives.
    pub async fn serve_notifications(&self) -> Result<(), CommError> {
        info!("{} serving notifications", self.rank());
        loop {
            let notification = match self.comm.receive_notification().await {
                Ok(notification) => notification,
                Err(e @ CommError::MalformedNotification(_)) => {
                    warn!("{} dropped notification: {}", self.rank(), e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            if notification.is_shutdown() {
                info!("{} notification loop shutting down", self.rank());
                return Ok(());
            }

            debug!(
                "{} learned of {} tensor(s) on {}",
                self.rank(),
                notification.tids.len(),
                notification.source
            );
            self.remote.record(&notification);
        }
    }

    /// Runs the three service loops on the current runtime.
    pub fn spawn_services(self: &Arc<Self>) -> NodeServices {
        let node = self.clone();
        let dispatch = tokio::spawn(async move { node.serve_dispatch().await });
        let node = self.clone();
        let forward = tokio::spawn(async move { node.serve_forward().await });
        let node = self.clone();
        let notifications = tokio::spawn(async move { node.serve_notifications().await });

        NodeServices {
            dispatch,
            forward,
            notifications,
        }
    }

    /// Wakes this node's own service loops with their shutdown messages.
    ///
    /// Completes once all three loops have consumed them, so the loops must be running.
    pub async fn shutdown(&self) -> Result<(), CommError> {
        info!("{} shutting down service loops", self.rank());
        tokio::try_join!(
            self.comm.dispatch_shutdown(),
            self.comm.forward_shutdown(),
            self.comm.notify_shutdown(),
        )?;
        Ok(())
    }

    /// Applies the local part of `command` and returns the tensors it created.
    fn execute(&self, command: &Command) -> Result<Vec<Tid>, OpError> {
        match command.kind {
            CommandKind::Reduce | CommandKind::Apply => self.compute(command),
            CommandKind::Delete => {
                self.delete(command);
                Ok(Vec::new())
            }
            CommandKind::Shutdown => Ok(Vec::new()),
        }
    }

    fn compute(&self, command: &Command) -> Result<Vec<Tid>, OpError> {
        let rank = self.rank();
        let inputs: Vec<Tid> = command.inputs.iter().map(|input| input.tid).collect();
        let mut created = Vec::new();

        for output in command.outputs.iter().filter(|o| o.node == rank) {
            let kernel = self.library.get(command.fun_id)?.clone();

            let tid = if command.kind == CommandKind::Reduce {
                let [lhs, rhs] = inputs[..] else {
                    return Err(OpError::Arity {
                        kernel: kernel.name.clone(),
                        expected: 2,
                        actual: inputs.len(),
                    });
                };
                let mut op =
                    BinaryReduceOp::new(kernel, lhs, rhs).with_params(command.params.clone());
                if output.tid != Tid::NONE {
                    op = op.with_output_tid(output.tid);
                }
                op.apply(&self.store, &self.registry)?
            } else {
                let mut op =
                    ApplyOp::new(kernel, inputs.clone()).with_params(command.params.clone());
                if output.tid != Tid::NONE {
                    op = op.with_output_tid(output.tid);
                }
                op.apply(&self.store, &self.registry)?
            };

            debug!("{} created {} for {}", rank, tid, command.id);
            created.push(tid);
        }

        Ok(created)
    }

    fn delete(&self, command: &Command) {
        let rank = self.rank();
        for &location in &command.inputs {
            if location.node == rank {
                if let Err(e) = self.store.remove(location.tid) {
                    warn!("{} cannot delete {}: {}", rank, location.tid, e);
                }
            } else {
                self.remote.forget(location);
            }
        }
    }

    /// Tells every other node the command references about `created`.
    async fn announce(&self, command: &Command, created: &[Tid]) -> Result<(), CommError> {
        if created.is_empty() {
            return Ok(());
        }
        let rank = self.rank();
        let targets = command.nodes().into_iter().filter(|&node| node != rank);
        futures::future::try_join_all(targets.map(|node| self.comm.notify_created(node, created)))
            .await?;
        Ok(())
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("rank", &self.rank())
            .field("tensors", &self.store.len())
            .field("remote", &self.remote.len())
            .finish()
    }
}

/// Join handles of the loops started by [`Node::spawn_services`].
pub struct NodeServices {
    dispatch: JoinHandle<Result<(), CommError>>,
    forward: JoinHandle<Result<(), CommError>>,
    notifications: JoinHandle<Result<(), CommError>>,
}

impl NodeServices {
    /// Waits for all three loops to stop and returns the first error any of them reported.
    pub async fn join(self) -> anyhow::Result<()> {
        let (dispatch, forward, notifications) =
            tokio::join!(self.dispatch, self.forward, self.notifications);
        dispatch??;
        forward??;
        notifications??;
        Ok(())
    }
}
