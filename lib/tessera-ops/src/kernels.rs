// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Built-in kernels over the dense `f32` matrix format.

use anyhow::{Context, bail, ensure};
use std::sync::Arc;

use tessera_common::Param;
use tessera_storage::{DENSE, TensorMeta, TensorMut, TensorRef};

use crate::kernel::{Kernel, KernelImpl};

pub const DENSE_ADD: &str = "dense_add";
pub const DENSE_SCALE: &str = "dense_scale";
pub const DENSE_MATMUL: &str = "dense_matmul";

pub(crate) fn defaults() -> Vec<KernelImpl> {
    vec![
        KernelImpl::new(DENSE_ADD, &[DENSE, DENSE], DENSE, Arc::new(DenseAdd)),
        KernelImpl::new(DENSE_SCALE, &[DENSE], DENSE, Arc::new(DenseScale)),
        KernelImpl::new(DENSE_MATMUL, &[DENSE, DENSE], DENSE, Arc::new(DenseMatmul)),
    ]
}

fn single_output<'o, 'b>(
    outputs: &'o mut [TensorMut<'b>],
) -> anyhow::Result<&'o mut TensorMut<'b>> {
    let count = outputs.len();
    match outputs {
        [output] => Ok(output),
        _ => bail!("expected one output, got {}", count),
    }
}

/// Elementwise sum of two matrices of the same shape.
#[derive(Debug, Default)]
pub struct DenseAdd;

impl Kernel for DenseAdd {
    fn output_meta(&self, _params: &[Param], inputs: &[TensorMeta]) -> anyhow::Result<TensorMeta> {
        let [lhs, rhs] = inputs else {
            bail!("dense_add takes two inputs, got {}", inputs.len());
        };
        ensure!(lhs.same_shape(rhs), "shape mismatch: {} + {}", lhs, rhs);
        Ok(*lhs)
    }

    fn invoke(
        &self,
        _params: &[Param],
        inputs: &[TensorRef<'_>],
        outputs: &mut [TensorMut<'_>],
    ) -> anyhow::Result<()> {
        let [lhs, rhs] = inputs else {
            bail!("dense_add takes two inputs, got {}", inputs.len());
        };
        let sum = lhs.f32_values().zip(rhs.f32_values()).map(|(a, b)| a + b);
        single_output(outputs)?.write_f32_values(sum)?;
        Ok(())
    }
}

/// Multiplies every element by the `f32` in parameter 0.
#[derive(Debug, Default)]
pub struct DenseScale;

impl Kernel for DenseScale {
    fn output_meta(&self, params: &[Param], inputs: &[TensorMeta]) -> anyhow::Result<TensorMeta> {
        let [input] = inputs else {
            bail!("dense_scale takes one input, got {}", inputs.len());
        };
        Param::f32_at(params, 0).context("dense_scale factor")?;
        Ok(*input)
    }

    fn invoke(
        &self,
        params: &[Param],
        inputs: &[TensorRef<'_>],
        outputs: &mut [TensorMut<'_>],
    ) -> anyhow::Result<()> {
        let [input] = inputs else {
            bail!("dense_scale takes one input, got {}", inputs.len());
        };
        let factor = Param::f32_at(params, 0).context("dense_scale factor")?;
        single_output(outputs)?.write_f32_values(input.f32_values().map(|v| v * factor))?;
        Ok(())
    }
}

/// Matrix product `lhs × rhs`.
#[derive(Debug, Default)]
pub struct DenseMatmul;

impl Kernel for DenseMatmul {
    fn output_meta(&self, _params: &[Param], inputs: &[TensorMeta]) -> anyhow::Result<TensorMeta> {
        let [lhs, rhs] = inputs else {
            bail!("dense_matmul takes two inputs, got {}", inputs.len());
        };
        ensure!(
            lhs.num_cols == rhs.num_rows,
            "inner dimensions differ: {} x {}",
            lhs,
            rhs
        );
        Ok(TensorMeta::new(lhs.fmt_id, lhs.num_rows, rhs.num_cols))
    }

    fn invoke(
        &self,
        _params: &[Param],
        inputs: &[TensorRef<'_>],
        outputs: &mut [TensorMut<'_>],
    ) -> anyhow::Result<()> {
        let [lhs, rhs] = inputs else {
            bail!("dense_matmul takes two inputs, got {}", inputs.len());
        };
        let (lhs_meta, rhs_meta) = (lhs.meta()?, rhs.meta()?);
        let (rows, inner, cols) = (
            lhs_meta.num_rows as usize,
            lhs_meta.num_cols as usize,
            rhs_meta.num_cols as usize,
        );

        let a: Vec<f32> = lhs.f32_values().collect();
        let b: Vec<f32> = rhs.f32_values().collect();
        ensure!(
            a.len() == rows * inner && b.len() == inner * cols,
            "payload does not match metadata"
        );

        let mut product = vec![0.0f32; rows * cols];
        for i in 0..rows {
            for k in 0..inner {
                let a_ik = a[i * inner + k];
                for j in 0..cols {
                    product[i * cols + j] += a_ik * b[k * cols + j];
                }
            }
        }
        single_output(outputs)?.write_f32_values(product.into_iter())?;
        Ok(())
    }
}
