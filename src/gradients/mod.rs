//! # Primitive Gradient Registry
//!
//! Per-operator mapping from a forward call to the partial-adjoint
//! expressions of its arguments.
//!
//! ```text
//! reverse walk: x = op(a_0, .., a_{n-1}), out-adjoint g
//!     ↓
//! [GradientRegistry::lookup(op)] -> grad(call, g) -> [partial_0, .., partial_{n-1}]
//! ```
//!
//! Each partial has the structural type of its argument. Broadcast
//! operators route their partials through `collapse_sum_like` so gradients
//! of broadcast inputs collapse back to the input's shape. Backward-only
//! operators (`collapse_sum_like`, `relu_backward`, ..) and the `ones` /
//! `zeros` constructors have no registration; differentiating through them
//! is a missing-gradient error.
//!
//! The process-wide default table is built lazily on first use and is
//! immutable afterwards, so concurrent passes can share it. Custom tables
//! can be assembled with [`GradientRegistry::register`] and passed to
//! [`crate::autodiff::gradient_with_registry`].

use crate::error::{DiffError, DiffResult};
use crate::ir::{Expr, ExprKind, ExprRef, OpKind, VarRef};
use crate::types::{DType, StructuralType};
use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Gradient of one operator: forward call and out-adjoint variable in,
/// one partial-adjoint expression per forward argument out
pub type GradientFn = fn(&ExprRef, &VarRef) -> DiffResult<Vec<ExprRef>>;

/// Lookup table from operator kind to gradient function
#[derive(Debug, Default)]
pub struct GradientRegistry {
    entries: HashMap<OpKind, GradientFn>,
}

impl GradientRegistry {
    /// An empty registry
    pub fn new() -> Self {
        GradientRegistry::default()
    }

    /// The registry with all built-in gradients
    pub fn with_defaults() -> Self {
        let mut registry = GradientRegistry::new();
        registry.register(OpKind::Add, add_grad);
        registry.register(OpKind::Subtract, subtract_grad);
        registry.register(OpKind::Multiply, multiply_grad);
        registry.register(OpKind::Divide, divide_grad);
        registry.register(OpKind::Negative, negative_grad);
        registry.register(OpKind::Exp, exp_grad);
        registry.register(OpKind::Log, log_grad);
        registry.register(OpKind::Relu, relu_grad);
        registry.register(OpKind::Sum, sum_grad);
        registry.register(OpKind::MatMul, matmul_grad);
        registry.register(OpKind::Transpose, transpose_grad);
        registry.register(OpKind::Conv2d, conv2d_grad);
        registry.register(OpKind::MaxPool2d, max_pool2d_grad);
        registry.register(OpKind::SoftmaxCrossEntropy, softmax_cross_entropy_grad);
        registry
    }

    /// Register (or replace) the gradient for `op`
    pub fn register(&mut self, op: OpKind, grad: GradientFn) {
        self.entries.insert(op, grad);
    }

    pub fn lookup(&self, op: OpKind) -> Option<GradientFn> {
        self.entries.get(&op).copied()
    }

    pub fn contains(&self, op: OpKind) -> bool {
        self.entries.contains_key(&op)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

static DEFAULT: Lazy<GradientRegistry> = Lazy::new(GradientRegistry::with_defaults);

/// The process-wide default registry
pub fn default_registry() -> &'static GradientRegistry {
    &DEFAULT
}

// ============================================================================
// Argument destructuring
// ============================================================================

fn call_args(call: &ExprRef) -> DiffResult<&[ExprRef]> {
    match call.kind() {
        ExprKind::Call { args, .. } => Ok(args),
        _ => Err(DiffError::UnsupportedBinding(call.to_string())),
    }
}

fn unary_arg(call: &ExprRef) -> DiffResult<&ExprRef> {
    match call_args(call)? {
        [a] => Ok(a),
        _ => Err(DiffError::UnsupportedBinding(call.to_string())),
    }
}

fn binary_args(call: &ExprRef) -> DiffResult<(&ExprRef, &ExprRef)> {
    match call_args(call)? {
        [a, b] => Ok((a, b)),
        _ => Err(DiffError::UnsupportedBinding(call.to_string())),
    }
}

/// Known shape and dtype of an argument, for `ones` / `zeros` construction
fn spec_of(arg: &ExprRef) -> DiffResult<(Vec<i64>, DType)> {
    arg.ty()
        .and_then(StructuralType::tensor_spec)
        .map(|(shape, dtype)| (shape.to_vec(), dtype))
        .ok_or_else(|| match arg.ty() {
            Some(ty) => DiffError::UnknownTensorSpec(ty.to_string()),
            None => DiffError::MissingType(arg.to_string()),
        })
}

// ============================================================================
// Expression construction helpers
// ============================================================================

/// An elementwise call shaped like the forward output (= the out-adjoint)
fn elemwise(op: OpKind, args: Vec<ExprRef>, g: &VarRef) -> ExprRef {
    Expr::call_typed(op, args, Some(g.ty().clone()))
}

/// `collapse_sum_like(partial, arg)`: reduce a broadcast partial back to
/// the argument's shape
fn collapse(partial: ExprRef, arg: &ExprRef) -> ExprRef {
    Expr::call_typed(
        OpKind::CollapseSumLike,
        vec![partial, arg.clone()],
        arg.ty().cloned(),
    )
}

/// `transpose(e)`, with the shape metadata reversed when known
fn transpose(e: &ExprRef) -> ExprRef {
    let ty = match e.ty() {
        Some(StructuralType::Tensor { ndim, dtype, shape }) => Some(StructuralType::Tensor {
            ndim: *ndim,
            dtype: *dtype,
            shape: shape
                .as_ref()
                .map(|s| s.iter().rev().copied().collect::<Vec<_>>()),
        }),
        _ => None,
    };
    Expr::call_typed(OpKind::Transpose, vec![e.clone()], ty)
}

// ============================================================================
// Built-in gradients
// ============================================================================

fn add_grad(call: &ExprRef, g: &VarRef) -> DiffResult<Vec<ExprRef>> {
    let (a, b) = binary_args(call)?;
    Ok(vec![collapse(Expr::var(g), a), collapse(Expr::var(g), b)])
}

fn subtract_grad(call: &ExprRef, g: &VarRef) -> DiffResult<Vec<ExprRef>> {
    let (a, b) = binary_args(call)?;
    let negated = elemwise(OpKind::Negative, vec![Expr::var(g)], g);
    Ok(vec![collapse(Expr::var(g), a), collapse(negated, b)])
}

fn multiply_grad(call: &ExprRef, g: &VarRef) -> DiffResult<Vec<ExprRef>> {
    let (a, b) = binary_args(call)?;
    let da = elemwise(OpKind::Multiply, vec![Expr::var(g), b.clone()], g);
    let db = elemwise(OpKind::Multiply, vec![Expr::var(g), a.clone()], g);
    Ok(vec![collapse(da, a), collapse(db, b)])
}

fn divide_grad(call: &ExprRef, g: &VarRef) -> DiffResult<Vec<ExprRef>> {
    let (a, b) = binary_args(call)?;
    let da = elemwise(OpKind::Divide, vec![Expr::var(g), b.clone()], g);

    // d/db (a / b) = -(g * a) / (b * b)
    let numerator = elemwise(OpKind::Multiply, vec![Expr::var(g), a.clone()], g);
    let denominator = Expr::call_typed(
        OpKind::Multiply,
        vec![b.clone(), b.clone()],
        b.ty().cloned(),
    );
    let fraction = elemwise(OpKind::Divide, vec![numerator, denominator], g);
    let db = elemwise(OpKind::Negative, vec![fraction], g);

    Ok(vec![collapse(da, a), collapse(db, b)])
}

fn negative_grad(call: &ExprRef, g: &VarRef) -> DiffResult<Vec<ExprRef>> {
    unary_arg(call)?;
    Ok(vec![elemwise(OpKind::Negative, vec![Expr::var(g)], g)])
}

fn exp_grad(call: &ExprRef, g: &VarRef) -> DiffResult<Vec<ExprRef>> {
    let a = unary_arg(call)?;
    let forward = Expr::call_typed(OpKind::Exp, vec![a.clone()], a.ty().cloned());
    Ok(vec![elemwise(OpKind::Multiply, vec![Expr::var(g), forward], g)])
}

fn log_grad(call: &ExprRef, g: &VarRef) -> DiffResult<Vec<ExprRef>> {
    let a = unary_arg(call)?;
    Ok(vec![elemwise(OpKind::Divide, vec![Expr::var(g), a.clone()], g)])
}

fn relu_grad(call: &ExprRef, g: &VarRef) -> DiffResult<Vec<ExprRef>> {
    let a = unary_arg(call)?;
    Ok(vec![Expr::call_typed(
        OpKind::ReluBackward,
        vec![Expr::var(g), a.clone()],
        a.ty().cloned(),
    )])
}

/// d/da sum(a) = g broadcast to a's shape
fn sum_grad(call: &ExprRef, g: &VarRef) -> DiffResult<Vec<ExprRef>> {
    let a = unary_arg(call)?;
    let (shape, dtype) = spec_of(a)?;
    let ones = Expr::ones(shape, dtype);
    Ok(vec![Expr::call_typed(
        OpKind::Multiply,
        vec![Expr::var(g), ones],
        a.ty().cloned(),
    )])
}

fn matmul_grad(call: &ExprRef, g: &VarRef) -> DiffResult<Vec<ExprRef>> {
    let (a, b) = binary_args(call)?;
    let da = Expr::call_typed(
        OpKind::MatMul,
        vec![Expr::var(g), transpose(b)],
        a.ty().cloned(),
    );
    let db = Expr::call_typed(
        OpKind::MatMul,
        vec![transpose(a), Expr::var(g)],
        b.ty().cloned(),
    );
    Ok(vec![da, db])
}

fn transpose_grad(call: &ExprRef, g: &VarRef) -> DiffResult<Vec<ExprRef>> {
    let a = unary_arg(call)?;
    Ok(vec![Expr::call_typed(
        OpKind::Transpose,
        vec![Expr::var(g)],
        a.ty().cloned(),
    )])
}

fn conv2d_grad(call: &ExprRef, g: &VarRef) -> DiffResult<Vec<ExprRef>> {
    let (data, weight) = binary_args(call)?;
    let dd = Expr::call_typed(
        OpKind::Conv2dBackwardData,
        vec![Expr::var(g), weight.clone()],
        data.ty().cloned(),
    );
    let dw = Expr::call_typed(
        OpKind::Conv2dBackwardWeight,
        vec![Expr::var(g), data.clone()],
        weight.ty().cloned(),
    );
    Ok(vec![dd, dw])
}

fn max_pool2d_grad(call: &ExprRef, g: &VarRef) -> DiffResult<Vec<ExprRef>> {
    let data = unary_arg(call)?;
    Ok(vec![Expr::call_typed(
        OpKind::MaxPool2dBackward,
        vec![Expr::var(g), data.clone()],
        data.ty().cloned(),
    )])
}

/// The label argument gets a materialized zero, not a structural one: it is
/// a real partial of the loss, constantly zero
fn softmax_cross_entropy_grad(call: &ExprRef, g: &VarRef) -> DiffResult<Vec<ExprRef>> {
    let (logits, labels) = binary_args(call)?;
    let dz = Expr::call_typed(
        OpKind::SoftmaxCrossEntropyBackward,
        vec![Expr::var(g), logits.clone(), labels.clone()],
        logits.ty().cloned(),
    );
    let (shape, dtype) = spec_of(labels)?;
    Ok(vec![dz, Expr::zeros(shape, dtype)])
}
