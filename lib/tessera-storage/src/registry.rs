// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Tensor format registry.
//!
//! Formats are registered by name at startup and receive consecutive [`FormatId`]s starting
//! at 1. The registry is immutable once shared.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::StorageError;
use crate::meta::{FormatId, META_SIZE, TensorMeta};

/// Name of the built-in dense `f32` matrix format.
pub const DENSE: &str = "dense";

/// Layout rules for one tensor format.
pub trait TensorFormat: Send + Sync {
    fn type_name(&self) -> &str;

    /// Exact block size, header included, of a tensor with `meta`.
    fn byte_size(&self, meta: &TensorMeta) -> Result<usize, StorageError>;

    /// Prepares a zeroed block of exactly [`byte_size`](Self::byte_size) bytes.
    fn initialize(&self, buffer: &mut [u8], meta: &TensorMeta) -> Result<(), StorageError> {
        meta.write_header(buffer)
    }
}

/// Row-major `f32` matrix.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenseFormat;

impl TensorFormat for DenseFormat {
    fn type_name(&self) -> &str {
        DENSE
    }

    fn byte_size(&self, meta: &TensorMeta) -> Result<usize, StorageError> {
        meta.checked_payload_size(std::mem::size_of::<f32>())
            .and_then(|payload| payload.checked_add(META_SIZE))
            .ok_or(StorageError::TooLarge(*meta))
    }
}

#[derive(Default, Clone)]
pub struct TensorRegistry {
    formats: Vec<Arc<dyn TensorFormat>>,
    by_name: HashMap<String, FormatId>,
}

impl TensorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the [`DENSE`] format.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.insert(DENSE.to_string(), Arc::new(DenseFormat));
        registry
    }

    pub fn register(&mut self, format: Arc<dyn TensorFormat>) -> Result<FormatId, StorageError> {
        let name = format.type_name().to_string();
        if self.by_name.contains_key(&name) {
            return Err(StorageError::DuplicateType(name));
        }
        Ok(self.insert(name, format))
    }

    fn insert(&mut self, name: String, format: Arc<dyn TensorFormat>) -> FormatId {
        let id = FormatId(self.formats.len() as u32 + 1);
        self.formats.push(format);
        self.by_name.insert(name, id);
        id
    }

    pub fn format_id_for(&self, type_name: &str) -> Result<FormatId, StorageError> {
        self.by_name
            .get(type_name)
            .copied()
            .ok_or_else(|| StorageError::UnknownType(type_name.to_string()))
    }

    pub fn format(&self, id: FormatId) -> Result<&Arc<dyn TensorFormat>, StorageError> {
        (id.0 as usize)
            .checked_sub(1)
            .and_then(|index| self.formats.get(index))
            .ok_or(StorageError::UnknownFormat(id))
    }

    pub fn tensor_byte_size(&self, meta: &TensorMeta) -> Result<usize, StorageError> {
        self.format(meta.fmt_id)?.byte_size(meta)
    }

    /// Writes a fresh tensor with `meta` into `buffer`, which must be exactly its size.
    pub fn initialize_tensor(
        &self,
        buffer: &mut [u8],
        meta: &TensorMeta,
    ) -> Result<(), StorageError> {
        let format = self.format(meta.fmt_id)?;
        let expected = format.byte_size(meta)?;
        if buffer.len() != expected {
            return Err(StorageError::BufferSize {
                expected,
                actual: buffer.len(),
            });
        }
        format.initialize(buffer, meta)
    }

    pub fn len(&self) -> usize {
        self.formats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }
}

impl std::fmt::Debug for TensorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.by_name.iter().map(|(name, id)| (id, name)))
            .finish()
    }
}
