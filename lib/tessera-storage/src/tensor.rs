// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Borrowed views over tensor blocks.

use bytes::{Buf, BufMut};

use tessera_common::Tid;

use crate::error::StorageError;
use crate::meta::{META_SIZE, TensorMeta};

const F32_WIDTH: usize = std::mem::size_of::<f32>();

/// Read-only view of a committed tensor.
#[derive(Debug, Clone, Copy)]
pub struct TensorRef<'a> {
    tid: Tid,
    bytes: &'a [u8],
}

impl<'a> TensorRef<'a> {
    pub fn new(tid: Tid, bytes: &'a [u8]) -> Self {
        Self { tid, bytes }
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// The whole block, header included.
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn num_bytes(&self) -> usize {
        self.bytes.len()
    }

    pub fn meta(&self) -> Result<TensorMeta, StorageError> {
        TensorMeta::read_header(self.bytes)
    }

    /// The block past the metadata header.
    pub fn payload(&self) -> &'a [u8] {
        self.bytes.get(META_SIZE..).unwrap_or_default()
    }

    /// Payload read as little-endian `f32`s.
    pub fn f32_values(&self) -> impl ExactSizeIterator<Item = f32> + 'a {
        self.payload()
            .chunks_exact(F32_WIDTH)
            .map(|mut chunk| chunk.get_f32_le())
    }
}

/// Writable view of a tensor being created.
#[derive(Debug)]
pub struct TensorMut<'a> {
    tid: Tid,
    bytes: &'a mut [u8],
}

impl<'a> TensorMut<'a> {
    pub fn new(tid: Tid, bytes: &'a mut [u8]) -> Self {
        Self { tid, bytes }
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn num_bytes(&self) -> usize {
        self.bytes.len()
    }

    pub fn meta(&self) -> Result<TensorMeta, StorageError> {
        TensorMeta::read_header(self.bytes)
    }

    pub fn view(&self) -> TensorRef<'_> {
        TensorRef::new(self.tid, self.bytes)
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        self.bytes.get_mut(META_SIZE..).unwrap_or_default()
    }

    /// Overwrites the payload with `values` as little-endian `f32`s.
    ///
    /// Fails unless `values` fills the payload exactly.
    pub fn write_f32_values(
        &mut self,
        values: impl ExactSizeIterator<Item = f32>,
    ) -> Result<(), StorageError> {
        let payload = self.payload_mut();
        let expected = values.len() * F32_WIDTH;
        if payload.len() != expected {
            return Err(StorageError::BufferSize {
                expected: expected + META_SIZE,
                actual: payload.len() + META_SIZE,
            });
        }
        let mut out = payload;
        for value in values {
            out.put_f32_le(value);
        }
        Ok(())
    }
}
