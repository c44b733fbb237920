// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use bytes::{Buf, BufMut};
use std::fmt;

use crate::error::StorageError;

/// Size of the metadata header at the front of every tensor block.
pub const META_SIZE: usize = 12;

/// Registry-assigned id of a tensor format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FormatId(pub u32);

impl fmt::Display for FormatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fmt-{}", self.0)
    }
}

/// Shape and format of a tensor.
///
/// Stored little-endian as `[u32 fmt_id][u32 num_rows][u32 num_cols]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorMeta {
    pub fmt_id: FormatId,
    pub num_rows: u32,
    pub num_cols: u32,
}

impl TensorMeta {
    pub const fn new(fmt_id: FormatId, num_rows: u32, num_cols: u32) -> Self {
        Self {
            fmt_id,
            num_rows,
            num_cols,
        }
    }

    /// Same shape, different format.
    pub fn with_format(self, fmt_id: FormatId) -> Self {
        Self { fmt_id, ..self }
    }

    /// Element count, saturating at `usize::MAX`.
    pub fn num_elements(&self) -> usize {
        (self.num_rows as usize).saturating_mul(self.num_cols as usize)
    }

    /// Payload bytes for `width`-byte elements, or `None` if that overflows `usize`.
    pub fn checked_payload_size(&self, width: usize) -> Option<usize> {
        (self.num_rows as usize)
            .checked_mul(self.num_cols as usize)?
            .checked_mul(width)
    }

    pub fn same_shape(&self, other: &TensorMeta) -> bool {
        self.num_rows == other.num_rows && self.num_cols == other.num_cols
    }

    /// Writes the header into the first [`META_SIZE`] bytes of `buffer`.
    pub fn write_header(&self, buffer: &mut [u8]) -> Result<(), StorageError> {
        let Some(mut header) = buffer.get_mut(..META_SIZE) else {
            return Err(StorageError::TruncatedHeader(buffer.len()));
        };
        header.put_u32_le(self.fmt_id.0);
        header.put_u32_le(self.num_rows);
        header.put_u32_le(self.num_cols);
        Ok(())
    }

    pub fn read_header(buffer: &[u8]) -> Result<Self, StorageError> {
        let Some(mut header) = buffer.get(..META_SIZE) else {
            return Err(StorageError::TruncatedHeader(buffer.len()));
        };
        Ok(Self {
            fmt_id: FormatId(header.get_u32_le()),
            num_rows: header.get_u32_le(),
            num_cols: header.get_u32_le(),
        })
    }
}

impl fmt::Display for TensorMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}x{}]", self.fmt_id, self.num_rows, self.num_cols)
    }
}
