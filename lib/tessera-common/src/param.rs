// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// Errors raised while interpreting a [`Param`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParamError {
    #[error("unknown parameter type tag {0}")]
    UnknownType(u8),

    #[error("parameter {index} missing")]
    Missing { index: usize },

    #[error("parameter {index} has type {actual}, expected {expected}")]
    WrongType {
        index: usize,
        expected: &'static str,
        actual: &'static str,
    },
}

/// One scalar argument of a command, forwarded verbatim to the kernel.
///
/// Every variant is four bytes wide on the wire, preceded by a one-byte type tag.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Param {
    I32(i32),
    U32(u32),
    F32(f32),
}

impl Param {
    /// Encoded width including the type tag.
    pub const WIRE_SIZE: usize = 5;

    pub const fn type_tag(&self) -> u8 {
        match self {
            Param::I32(_) => 1,
            Param::U32(_) => 2,
            Param::F32(_) => 3,
        }
    }

    pub const fn type_name(&self) -> &'static str {
        match self {
            Param::I32(_) => "i32",
            Param::U32(_) => "u32",
            Param::F32(_) => "f32",
        }
    }

    pub fn value_bytes(&self) -> [u8; 4] {
        match self {
            Param::I32(v) => v.to_le_bytes(),
            Param::U32(v) => v.to_le_bytes(),
            Param::F32(v) => v.to_le_bytes(),
        }
    }

    pub fn from_wire(tag: u8, value: [u8; 4]) -> Result<Self, ParamError> {
        match tag {
            1 => Ok(Param::I32(i32::from_le_bytes(value))),
            2 => Ok(Param::U32(u32::from_le_bytes(value))),
            3 => Ok(Param::F32(f32::from_le_bytes(value))),
            other => Err(ParamError::UnknownType(other)),
        }
    }

    /// Reads `params[index]` as an `f32`.
    pub fn f32_at(params: &[Param], index: usize) -> Result<f32, ParamError> {
        match params.get(index) {
            Some(Param::F32(v)) => Ok(*v),
            Some(other) => Err(ParamError::WrongType {
                index,
                expected: "f32",
                actual: other.type_name(),
            }),
            None => Err(ParamError::Missing { index }),
        }
    }
}
