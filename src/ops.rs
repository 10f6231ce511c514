//! Reference CPU kernels.
//!
//! These cover the allocation behaviors the planner distinguishes:
//! `Reshape` declares a mandatory alias, `Relu` may run in place, `Add`
//! always allocates and `Identity` aliases its input through. Real
//! deployments register their own kernels; these are enough to run small
//! graphs and the crate's tests.

use ndarray::IxDyn;

use crate::kernel::{
    Kernel, KernelContext, KernelCreateInfo, KernelDef, KernelRegistry, OpError,
};
use crate::provider::CPU_PROVIDER;
use crate::value::Value;

/// Passes its input through unchanged.
#[derive(Debug)]
pub struct Identity;

impl Kernel for Identity {
    fn compute(&self, ctx: &mut KernelContext) -> Result<(), OpError> {
        let input = ctx.take_input(0).ok_or(OpError::MissingInputs)?;
        ctx.set_output(0, input);
        Ok(())
    }
}

/// Elementwise addition of two tensors of the same shape.
#[derive(Debug)]
pub struct Add;

impl Kernel for Add {
    fn compute(&self, ctx: &mut KernelContext) -> Result<(), OpError> {
        let a = ctx.require_input(0)?;
        let b = ctx.require_input(1)?;
        if a.shape() != b.shape() {
            return Err(OpError::IncompatibleInputShapes("input shapes must match"));
        }
        let output = match (a, b) {
            (Value::Float(a), Value::Float(b)) => Value::Float((a + b).into_shared()),
            (Value::Int32(a), Value::Int32(b)) => Value::Int32((a + b).into_shared()),
            _ => return Err(OpError::UnsupportedType),
        };
        ctx.set_output(0, output);
        Ok(())
    }
}

/// Elementwise `max(x, 0)`.
///
/// Takes ownership of its input; when the planner arranged for in-place
/// reuse no other reference remains and the update happens without a copy.
#[derive(Debug)]
pub struct Relu;

impl Kernel for Relu {
    fn compute(&self, ctx: &mut KernelContext) -> Result<(), OpError> {
        let input = ctx.take_input(0).ok_or(OpError::MissingInputs)?;
        let mut tensor = input.into_float().ok_or(OpError::UnsupportedType)?;
        tensor.map_inplace(|x| *x = x.max(0.));
        ctx.set_output(0, Value::Float(tensor));
        Ok(())
    }
}

/// Returns a view of the input with a new shape, sharing its data.
#[derive(Debug)]
pub struct Reshape;

impl Kernel for Reshape {
    fn compute(&self, ctx: &mut KernelContext) -> Result<(), OpError> {
        let spec: Vec<i32> = {
            let shape = ctx
                .require_input(1)?
                .as_int32()
                .ok_or(OpError::UnsupportedType)?;
            if shape.ndim() != 1 {
                return Err(OpError::InvalidValue("shape must be a vector"));
            }
            shape.iter().copied().collect()
        };
        let input = ctx.take_input(0).ok_or(OpError::MissingInputs)?;
        let dims = target_dims(input.len(), &spec)?;

        let contiguous = OpError::InvalidValue("input must be contiguous");
        let output = match input {
            Value::Float(t) => Value::Float(
                t.into_shape_with_order(IxDyn(&dims)).map_err(|_| contiguous)?,
            ),
            Value::Int32(t) => Value::Int32(
                t.into_shape_with_order(IxDyn(&dims)).map_err(|_| contiguous)?,
            ),
        };
        ctx.set_output(0, output);
        Ok(())
    }
}

/// Resolve a reshape's target dims, inferring at most one `-1` dimension.
fn target_dims(len: usize, spec: &[i32]) -> Result<Vec<usize>, OpError> {
    let mut dims = Vec::with_capacity(spec.len());
    let mut inferred = None;
    let mut product = 1usize;
    for (index, &dim) in spec.iter().enumerate() {
        if dim == -1 {
            if inferred.is_some() {
                return Err(OpError::InvalidValue("at most one dim can be -1"));
            }
            inferred = Some(index);
            dims.push(0);
        } else if dim < 0 {
            return Err(OpError::InvalidValue("dims must be >= -1"));
        } else {
            dims.push(dim as usize);
            product = product.saturating_mul(dim as usize);
        }
    }
    if let Some(index) = inferred {
        if product == 0 || len % product != 0 {
            return Err(OpError::InvalidValue("cannot infer -1 dim"));
        }
        dims[index] = len / product;
    } else if product != len {
        return Err(OpError::IncompatibleInputShapes(
            "shape does not match element count",
        ));
    }
    Ok(dims)
}

/// Register the reference kernels with their CPU kernel descriptors.
pub fn register_cpu_kernels(registry: &mut KernelRegistry) {
    registry.register(
        CPU_PROVIDER,
        KernelCreateInfo {
            def: KernelDef::builder("Identity").alias(0, 0).build(),
            kernel: std::sync::Arc::new(Identity),
        },
    );
    registry.register(
        CPU_PROVIDER,
        KernelCreateInfo {
            def: KernelDef::builder("Add").since_version(7).build(),
            kernel: std::sync::Arc::new(Add),
        },
    );
    registry.register(
        CPU_PROVIDER,
        KernelCreateInfo {
            def: KernelDef::builder("Relu").since_version(6).may_inplace(0, 0).build(),
            kernel: std::sync::Arc::new(Relu),
        },
    );
    registry.register(
        CPU_PROVIDER,
        KernelCreateInfo {
            def: KernelDef::builder("Reshape").since_version(5).alias(0, 0).build(),
            kernel: std::sync::Arc::new(Reshape),
        },
    );
}
