// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Commands and their self-describing wire form.
//!
//! Wire format (little-endian, 28-byte fixed header):
//! ```text
//! [u32: total_len][u16: version][u8: kind][u8: 0][u64: id][u32: fun_id]
//! [u16: n_params][u16: n_inputs][u16: n_outputs][u16: 0]
//! [n_params  x (u8 type, 4 byte value)]
//! [n_inputs  x (i32 tid, u32 node)]
//! [n_outputs x (i32 tid, u32 node)]
//! ```
//!
//! `total_len` covers the whole blob, header included, so a receiver that probed the
//! message size can check the blob describes exactly the bytes it received.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use tessera_common::{NodeId, Param, ParamError, Tid};

const WIRE_VERSION: u16 = 1;

/// Size of the fixed header.
pub const HEADER_SIZE: usize = 28;

const LOCATION_SIZE: usize = 8;

/// Errors produced while decoding a command blob.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    #[error("command blob of {0} bytes is shorter than the header")]
    Truncated(usize),

    #[error("command declares {declared} bytes but {actual} were received")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("unsupported command wire version {0}")]
    UnsupportedVersion(u16),

    #[error("unknown command kind {0}")]
    UnknownKind(u8),

    #[error("command has too many {0} to encode")]
    TooMany(&'static str),

    #[error(transparent)]
    Param(#[from] ParamError),
}

/// Unique id of a command, chosen by whoever creates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub u64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cmd-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandKind {
    /// Run a kernel over any number of inputs, producing one output.
    Apply = 1,
    /// Combine two inputs with a binary reduce kernel.
    Reduce = 2,
    /// Drop the listed input tensors on the nodes that own them.
    Delete = 3,
    /// Stop the receiving loop of the addressed node.
    Shutdown = 4,
}

impl CommandKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(CommandKind::Apply),
            2 => Some(CommandKind::Reduce),
            3 => Some(CommandKind::Delete),
            4 => Some(CommandKind::Shutdown),
            _ => None,
        }
    }

    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A tensor and the node whose store holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorLocation {
    pub tid: Tid,
    pub node: NodeId,
}

impl TensorLocation {
    pub const fn new(tid: Tid, node: NodeId) -> Self {
        Self { tid, node }
    }
}

/// A unit of dispatched work.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub id: CommandId,
    pub kind: CommandKind,
    /// Kernel to run; ignored by `Delete` and `Shutdown`.
    pub fun_id: u32,
    pub params: Vec<Param>,
    pub inputs: Vec<TensorLocation>,
    pub outputs: Vec<TensorLocation>,
}

impl Command {
    pub fn reduce(
        id: CommandId,
        fun_id: u32,
        lhs: TensorLocation,
        rhs: TensorLocation,
        output: TensorLocation,
    ) -> Self {
        Self {
            id,
            kind: CommandKind::Reduce,
            fun_id,
            params: Vec::new(),
            inputs: vec![lhs, rhs],
            outputs: vec![output],
        }
    }

    pub fn apply(
        id: CommandId,
        fun_id: u32,
        params: Vec<Param>,
        inputs: Vec<TensorLocation>,
        output: TensorLocation,
    ) -> Self {
        Self {
            id,
            kind: CommandKind::Apply,
            fun_id,
            params,
            inputs,
            outputs: vec![output],
        }
    }

    pub fn delete(id: CommandId, tensors: Vec<TensorLocation>) -> Self {
        Self {
            id,
            kind: CommandKind::Delete,
            fun_id: 0,
            params: Vec::new(),
            inputs: tensors,
            outputs: Vec::new(),
        }
    }

    /// A shutdown command addressed only to `origin`.
    pub fn shutdown(origin: NodeId) -> Self {
        Self {
            id: CommandId(u64::MAX),
            kind: CommandKind::Shutdown,
            fun_id: 0,
            params: Vec::new(),
            inputs: Vec::new(),
            outputs: vec![TensorLocation::new(Tid::NONE, origin)],
        }
    }

    pub fn with_params(mut self, params: Vec<Param>) -> Self {
        self.params = params;
        self
    }

    pub fn is_shutdown(&self) -> bool {
        self.kind == CommandKind::Shutdown
    }

    /// Distinct owning nodes, inputs first then outputs, in first-seen order.
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes = Vec::new();
        for location in self.inputs.iter().chain(&self.outputs) {
            if !nodes.contains(&location.node) {
                nodes.push(location.node);
            }
        }
        nodes
    }

    /// Whether any input or output lives on `node`.
    pub fn touches(&self, node: NodeId) -> bool {
        self.inputs
            .iter()
            .chain(&self.outputs)
            .any(|location| location.node == node)
    }

    /// Length of the encoded blob.
    pub fn num_bytes(&self) -> usize {
        HEADER_SIZE
            + self.params.len() * Param::WIRE_SIZE
            + (self.inputs.len() + self.outputs.len()) * LOCATION_SIZE
    }

    pub fn encode(&self) -> Result<Bytes, CommandError> {
        let n_params = count_u16(self.params.len(), "params")?;
        let n_inputs = count_u16(self.inputs.len(), "inputs")?;
        let n_outputs = count_u16(self.outputs.len(), "outputs")?;
        let total = u32::try_from(self.num_bytes()).map_err(|_| CommandError::TooMany("bytes"))?;

        let mut buf = BytesMut::with_capacity(total as usize);
        buf.put_u32_le(total);
        buf.put_u16_le(WIRE_VERSION);
        buf.put_u8(self.kind.as_u8());
        buf.put_u8(0);
        buf.put_u64_le(self.id.0);
        buf.put_u32_le(self.fun_id);
        buf.put_u16_le(n_params);
        buf.put_u16_le(n_inputs);
        buf.put_u16_le(n_outputs);
        buf.put_u16_le(0);

        for param in &self.params {
            buf.put_u8(param.type_tag());
            buf.put_slice(&param.value_bytes());
        }
        for location in self.inputs.iter().chain(&self.outputs) {
            buf.put_i32_le(location.tid.as_i32());
            buf.put_u32_le(location.node.as_u32());
        }

        debug_assert_eq!(buf.len(), total as usize);
        Ok(buf.freeze())
    }

    /// Decodes a received blob, checking it against the number of bytes actually received.
    pub fn decode(mut blob: Bytes) -> Result<Self, CommandError> {
        let actual = blob.len();
        if actual < HEADER_SIZE {
            return Err(CommandError::Truncated(actual));
        }

        let declared = blob.get_u32_le() as usize;
        if declared != actual {
            return Err(CommandError::LengthMismatch { declared, actual });
        }

        let version = blob.get_u16_le();
        if version != WIRE_VERSION {
            return Err(CommandError::UnsupportedVersion(version));
        }

        let kind_byte = blob.get_u8();
        let kind = CommandKind::from_u8(kind_byte).ok_or(CommandError::UnknownKind(kind_byte))?;
        blob.advance(1);

        let id = CommandId(blob.get_u64_le());
        let fun_id = blob.get_u32_le();
        let n_params = blob.get_u16_le() as usize;
        let n_inputs = blob.get_u16_le() as usize;
        let n_outputs = blob.get_u16_le() as usize;
        blob.advance(2);

        let body = n_params * Param::WIRE_SIZE + (n_inputs + n_outputs) * LOCATION_SIZE;
        if blob.remaining() != body {
            return Err(CommandError::LengthMismatch {
                declared: HEADER_SIZE + body,
                actual,
            });
        }

        let mut params = Vec::with_capacity(n_params);
        for _ in 0..n_params {
            let tag = blob.get_u8();
            let mut value = [0u8; 4];
            blob.copy_to_slice(&mut value);
            params.push(Param::from_wire(tag, value)?);
        }

        let inputs = read_locations(&mut blob, n_inputs);
        let outputs = read_locations(&mut blob, n_outputs);

        Ok(Self {
            id,
            kind,
            fun_id,
            params,
            inputs,
            outputs,
        })
    }
}

fn count_u16(len: usize, what: &'static str) -> Result<u16, CommandError> {
    u16::try_from(len).map_err(|_| CommandError::TooMany(what))
}

fn read_locations(blob: &mut Bytes, count: usize) -> Vec<TensorLocation> {
    (0..count)
        .map(|_| {
            let tid = Tid::new(blob.get_i32_le());
            let node = NodeId::new(blob.get_u32_le());
            TensorLocation::new(tid, node)
        })
        .collect()
}
