// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::fmt;

/// Rank of a process in the group, `0 <= rank < group_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u32);

impl NodeId {
    pub const fn new(rank: u32) -> Self {
        Self(rank)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for NodeId {
    fn from(rank: u32) -> Self {
        Self(rank)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Tensor identifier, unique within one node's store at any instant.
///
/// `-1` is reserved: it means "no tensor" in commands and creation requests, and inside a
/// notification payload it is the shutdown signal. Identifiers travel on the wire as
/// fixed-width little-endian `i32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tid(i32);

impl Tid {
    /// The reserved sentinel.
    pub const NONE: Tid = Tid(-1);

    /// Encoded width of one identifier in bytes.
    pub const WIDTH: usize = std::mem::size_of::<i32>();

    pub const fn new(id: i32) -> Self {
        Self(id)
    }

    pub const fn as_i32(self) -> i32 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == Self::NONE.0
    }

    pub const fn to_le_bytes(self) -> [u8; Self::WIDTH] {
        self.0.to_le_bytes()
    }

    pub const fn from_le_bytes(bytes: [u8; Self::WIDTH]) -> Self {
        Self(i32::from_le_bytes(bytes))
    }
}

impl From<i32> for Tid {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("tid-none")
        } else {
            write!(f, "tid-{}", self.0)
        }
    }
}
