// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;

use tessera_common::Param;
use tessera_storage::{TensorMeta, TensorMut, TensorRef};

use crate::error::OpError;
use crate::kernels;

/// The computation behind an operator.
pub trait Kernel: Send + Sync {
    /// Metadata of the output produced from inputs with `inputs` metadata.
    ///
    /// The returned format id is replaced by the declared output type's.
    fn output_meta(&self, params: &[Param], inputs: &[TensorMeta]) -> anyhow::Result<TensorMeta>;

    /// Computes `outputs` from `inputs`. Outputs arrive initialized with their metadata.
    fn invoke(
        &self,
        params: &[Param],
        inputs: &[TensorRef<'_>],
        outputs: &mut [TensorMut<'_>],
    ) -> anyhow::Result<()>;
}

/// A kernel together with the tensor types it consumes and produces.
#[derive(Clone)]
pub struct KernelImpl {
    pub name: String,
    pub input_types: Vec<String>,
    pub output_type: String,
    pub kernel: Arc<dyn Kernel>,
}

impl KernelImpl {
    pub fn new(
        name: impl Into<String>,
        input_types: &[&str],
        output_type: impl Into<String>,
        kernel: Arc<dyn Kernel>,
    ) -> Self {
        Self {
            name: name.into(),
            input_types: input_types.iter().map(|t| t.to_string()).collect(),
            output_type: output_type.into(),
            kernel,
        }
    }

    pub fn arity(&self) -> usize {
        self.input_types.len()
    }
}

impl std::fmt::Debug for KernelImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelImpl")
            .field("name", &self.name)
            .field("input_types", &self.input_types)
            .field("output_type", &self.output_type)
            .finish()
    }
}

/// Kernels addressable by the `fun_id` carried in commands.
///
/// Ids are assigned in registration order, so every node must register the same kernels in
/// the same order.
#[derive(Debug, Default, Clone)]
pub struct KernelLibrary {
    kernels: Vec<KernelImpl>,
    by_name: HashMap<String, u32>,
}

impl KernelLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// `dense_add` (0), `dense_scale` (1) and `dense_matmul` (2).
    pub fn with_defaults() -> Self {
        let mut library = Self::new();
        for kernel in kernels::defaults() {
            library.insert(kernel);
        }
        library
    }

    pub fn register(&mut self, kernel: KernelImpl) -> Result<u32, OpError> {
        if self.by_name.contains_key(&kernel.name) {
            return Err(OpError::DuplicateKernel(kernel.name));
        }
        Ok(self.insert(kernel))
    }

    fn insert(&mut self, kernel: KernelImpl) -> u32 {
        let fun_id = self.kernels.len() as u32;
        self.by_name.insert(kernel.name.clone(), fun_id);
        self.kernels.push(kernel);
        fun_id
    }

    pub fn get(&self, fun_id: u32) -> Result<&KernelImpl, OpError> {
        self.kernels
            .get(fun_id as usize)
            .ok_or(OpError::UnknownKernel(fun_id))
    }

    pub fn fun_id_for(&self, name: &str) -> Result<u32, OpError> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| OpError::UnknownKernelName(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::{DENSE_ADD, DENSE_MATMUL, DENSE_SCALE};

    #[test]
    fn test_default_ids_are_stable() {
        let library = KernelLibrary::with_defaults();
        assert_eq!(library.fun_id_for(DENSE_ADD).unwrap(), 0);
        assert_eq!(library.fun_id_for(DENSE_SCALE).unwrap(), 1);
        assert_eq!(library.fun_id_for(DENSE_MATMUL).unwrap(), 2);
        assert_eq!(library.get(1).unwrap().arity(), 1);
        assert!(matches!(library.get(3), Err(OpError::UnknownKernel(3))));
        assert_eq!(library.len(), 3);
    }

    #[test]
    fn test_duplicate_name_is_rejected() {
        let mut library = KernelLibrary::with_defaults();
        let again = library.get(0).unwrap().clone();
        assert!(matches!(
            library.register(again),
            Err(OpError::DuplicateKernel(_))
        ));
        assert_eq!(library.len(), 3);
    }
}
