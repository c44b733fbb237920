// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Two-phase operator execution.
//!
//! Phase 1 reads the inputs' metadata in a transaction without creates and derives the
//! output metadata and its exact byte size. Phase 2 reads the same inputs again, creates
//! one block of that size, initializes it and invokes the kernel. Phase 2 re-derives the
//! metadata and refuses to run when it differs from phase 1, so the block allocated always
//! has the size phase 1 computed.

use tracing::debug;

use tessera_common::{Param, Tid};
use tessera_storage::{CreateSpec, ReadSet, TensorMeta, TensorRef, TensorRegistry, TensorStore};

use crate::error::OpError;
use crate::kernel::KernelImpl;

/// Reduces two tensors into a new one.
#[derive(Debug, Clone)]
pub struct BinaryReduceOp {
    kernel: KernelImpl,
    lhs: Tid,
    rhs: Tid,
    params: Vec<Param>,
    out_tid: Option<Tid>,
    output: Option<Tid>,
}

impl BinaryReduceOp {
    pub fn new(kernel: KernelImpl, lhs: Tid, rhs: Tid) -> Self {
        Self {
            kernel,
            lhs,
            rhs,
            params: Vec::new(),
            out_tid: None,
            output: None,
        }
    }

    pub fn with_params(mut self, params: Vec<Param>) -> Self {
        self.params = params;
        self
    }

    /// Commit the output under `tid` instead of an assigned id.
    pub fn with_output_tid(mut self, tid: Tid) -> Self {
        self.out_tid = Some(tid);
        self
    }

    /// Runs the kernel and records the id of the tensor it produced.
    pub fn apply(
        &mut self,
        store: &TensorStore,
        registry: &TensorRegistry,
    ) -> Result<Tid, OpError> {
        let tid = execute(
            store,
            registry,
            &self.kernel,
            &self.params,
            &[self.lhs, self.rhs],
            self.out_tid,
        )?;
        self.output = Some(tid);
        Ok(tid)
    }

    /// Output of the last successful [`apply`](Self::apply).
    pub fn output(&self) -> Option<Tid> {
        self.output
    }
}

/// Runs a kernel of any arity producing one tensor.
#[derive(Debug, Clone)]
pub struct ApplyOp {
    kernel: KernelImpl,
    inputs: Vec<Tid>,
    params: Vec<Param>,
    out_tid: Option<Tid>,
    output: Option<Tid>,
}

impl ApplyOp {
    pub fn new(kernel: KernelImpl, inputs: Vec<Tid>) -> Self {
        Self {
            kernel,
            inputs,
            params: Vec::new(),
            out_tid: None,
            output: None,
        }
    }

    pub fn with_params(mut self, params: Vec<Param>) -> Self {
        self.params = params;
        self
    }

    pub fn with_output_tid(mut self, tid: Tid) -> Self {
        self.out_tid = Some(tid);
        self
    }

    pub fn apply(
        &mut self,
        store: &TensorStore,
        registry: &TensorRegistry,
    ) -> Result<Tid, OpError> {
        let tid = execute(
            store,
            registry,
            &self.kernel,
            &self.params,
            &self.inputs,
            self.out_tid,
        )?;
        self.output = Some(tid);
        Ok(tid)
    }

    pub fn output(&self) -> Option<Tid> {
        self.output
    }
}

fn execute(
    store: &TensorStore,
    registry: &TensorRegistry,
    kernel: &KernelImpl,
    params: &[Param],
    inputs: &[Tid],
    out_tid: Option<Tid>,
) -> Result<Tid, OpError> {
    if inputs.len() != kernel.arity() {
        return Err(OpError::Arity {
            kernel: kernel.name.clone(),
            expected: kernel.arity(),
            actual: inputs.len(),
        });
    }
    let out_fmt = registry
        .format_id_for(&kernel.output_type)
        .map_err(OpError::Storage)?;

    let derive = |reads: &ReadSet| -> Result<TensorMeta, OpError> {
        let metas = input_metas(reads)?;
        let meta = kernel
            .kernel
            .output_meta(params, &metas)
            .map_err(|source| OpError::Kernel {
                kernel: kernel.name.clone(),
                source,
            })?;
        Ok(meta.with_format(out_fmt))
    };

    let (out_meta, num_bytes) = store.local_transaction(inputs, &[], |txn| {
        let meta = derive(txn.reads())?;
        let num_bytes = registry
            .tensor_byte_size(&meta)
            .map_err(OpError::Storage)?;
        Ok((meta, num_bytes))
    })?;
    debug!(
        "{}: output {} needs {} bytes",
        kernel.name, out_meta, num_bytes
    );

    let create = CreateSpec {
        tid: out_tid,
        num_bytes,
    };
    let output = store.local_transaction(inputs, &[create], |txn| {
        let (reads, creates) = txn.split();
        if derive(reads)? != out_meta {
            return Err(OpError::InputsChanged.into());
        }
        let tensors = input_refs(reads)?;

        let Some(created) = creates.first_mut() else {
            anyhow::bail!("transaction returned no output block");
        };
        registry
            .initialize_tensor(created.bytes_mut(), &out_meta)
            .map_err(OpError::Storage)?;
        let tid = created.tid();

        kernel
            .kernel
            .invoke(params, &tensors, &mut [created.view_mut()])
            .map_err(|source| OpError::Kernel {
                kernel: kernel.name.clone(),
                source,
            })?;
        Ok(tid)
    })?;

    debug!("{} produced {}", kernel.name, output);
    Ok(output)
}

fn input_refs(reads: &ReadSet) -> Result<Vec<TensorRef<'_>>, OpError> {
    (0..reads.len())
        .map(|index| {
            reads
                .get(index)
                .ok_or_else(|| OpError::MissingInput(reads.tid(index).unwrap_or(Tid::NONE)))
        })
        .collect()
}

fn input_metas(reads: &ReadSet) -> Result<Vec<TensorMeta>, OpError> {
    input_refs(reads)?
        .iter()
        .map(|tensor| tensor.meta().map_err(OpError::Storage))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{Kernel, KernelLibrary};
    use crate::kernels::{DENSE_ADD, DENSE_SCALE};
    use std::sync::Arc;
    use tessera_storage::{DENSE, TensorMut};

    fn put_dense(
        store: &TensorStore,
        registry: &TensorRegistry,
        rows: u32,
        cols: u32,
        values: &[f32],
    ) -> Tid {
        let meta = TensorMeta::new(registry.format_id_for(DENSE).unwrap(), rows, cols);
        let size = registry.tensor_byte_size(&meta).unwrap();
        store
            .local_transaction(&[], &[CreateSpec::new(size)], |txn| {
                let tensor = txn.create(0).unwrap();
                registry.initialize_tensor(tensor.bytes_mut(), &meta)?;
                tensor.view_mut().write_f32_values(values.iter().copied())?;
                Ok(tensor.tid())
            })
            .unwrap()
    }

    fn read_values(store: &TensorStore, tid: Tid) -> Vec<f32> {
        store
            .local_transaction(&[tid], &[], |txn| {
                Ok(txn.get(0).unwrap().f32_values().collect())
            })
            .unwrap()
    }

    struct Failing;

    impl Kernel for Failing {
        fn output_meta(&self, _: &[Param], inputs: &[TensorMeta]) -> anyhow::Result<TensorMeta> {
            Ok(inputs[0])
        }

        fn invoke(
            &self,
            _: &[Param],
            _: &[TensorRef<'_>],
            _: &mut [TensorMut<'_>],
        ) -> anyhow::Result<()> {
            anyhow::bail!("device lost")
        }
    }

    #[test]
    fn test_reduce_records_output() {
        let store = TensorStore::new();
        let registry = TensorRegistry::with_defaults();
        let library = KernelLibrary::with_defaults();
        let lhs = put_dense(&store, &registry, 1, 2, &[1.0, 2.0]);
        let rhs = put_dense(&store, &registry, 1, 2, &[0.5, 0.5]);

        let kernel = library.get(library.fun_id_for(DENSE_ADD).unwrap()).unwrap().clone();
        let mut op = BinaryReduceOp::new(kernel, lhs, rhs);
        assert_eq!(op.output(), None);

        let out = op.apply(&store, &registry).unwrap();
        assert_eq!(op.output(), Some(out));
        assert_eq!(read_values(&store, out), vec![1.5, 2.5]);
    }

    #[test]
    fn test_requested_output_tid() {
        let store = TensorStore::new();
        let registry = TensorRegistry::with_defaults();
        let library = KernelLibrary::with_defaults();
        let input = put_dense(&store, &registry, 1, 1, &[3.0]);

        let kernel = library.get(library.fun_id_for(DENSE_SCALE).unwrap()).unwrap().clone();
        let mut op = ApplyOp::new(kernel, vec![input])
            .with_params(vec![Param::F32(2.0)])
            .with_output_tid(Tid::new(500));
        assert_eq!(op.apply(&store, &registry).unwrap(), Tid::new(500));
        assert_eq!(read_values(&store, Tid::new(500)), vec![6.0]);
    }

    #[test]
    fn test_kernel_failure_commits_nothing() {
        let store = TensorStore::new();
        let registry = TensorRegistry::with_defaults();
        let lhs = put_dense(&store, &registry, 1, 1, &[1.0]);
        let rhs = put_dense(&store, &registry, 1, 1, &[1.0]);
        let before = store.tids();

        let kernel = KernelImpl::new("failing", &[DENSE, DENSE], DENSE, Arc::new(Failing));
        let mut op = BinaryReduceOp::new(kernel, lhs, rhs);
        let error = op.apply(&store, &registry).unwrap_err();

        assert!(matches!(
            error,
            OpError::Kernel { ref kernel, .. } if kernel.as_str() == "failing"
        ));
        assert_eq!(op.output(), None);
        assert_eq!(store.tids(), before);
        assert_eq!(store.reserved_bytes(), 0);
    }

    #[test]
    fn test_missing_input() {
        let store = TensorStore::new();
        let registry = TensorRegistry::with_defaults();
        let library = KernelLibrary::with_defaults();
        let lhs = put_dense(&store, &registry, 1, 1, &[1.0]);

        let kernel = library.get(0).unwrap().clone();
        let mut op = BinaryReduceOp::new(kernel, lhs, Tid::new(77));
        assert!(matches!(
            op.apply(&store, &registry),
            Err(OpError::MissingInput(tid)) if tid == Tid::new(77)
        ));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_arity_is_checked() {
        let store = TensorStore::new();
        let registry = TensorRegistry::with_defaults();
        let library = KernelLibrary::with_defaults();
        let kernel = library.get(0).unwrap().clone();
        let mut op = ApplyOp::new(kernel, vec![Tid::new(0)]);
        assert!(matches!(
            op.apply(&store, &registry),
            Err(OpError::Arity { expected: 2, actual: 1, .. })
        ));
    }

    #[test]
    fn test_output_tid_in_use() {
        let store = TensorStore::new();
        let registry = TensorRegistry::with_defaults();
        let library = KernelLibrary::with_defaults();
        let lhs = put_dense(&store, &registry, 1, 1, &[1.0]);
        let rhs = put_dense(&store, &registry, 1, 1, &[2.0]);

        let kernel = library.get(0).unwrap().clone();
        let mut op = BinaryReduceOp::new(kernel, lhs, rhs).with_output_tid(lhs);
        assert!(matches!(
            op.apply(&store, &registry),
            Err(OpError::Storage(tessera_storage::StorageError::TidInUse(_)))
        ));
    }
}
