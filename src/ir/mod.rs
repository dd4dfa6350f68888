//! # Tensor Dataflow IR
//!
//! Intermediate representation for straight-line tensor programs: immutable
//! expression nodes, variables with unique identities, bindings, dataflow
//! regions, functions, and modules.
//!
//! ```text
//! FunctionBuilder -> Function { params, SeqBody { DataflowRegion, result } }
//!     ↓
//! [BlockBuilder / autodiff pass] -> new Function -> Module
//! ```
//!
//! Expression nodes are reference-counted and immutable; programs share
//! sub-expressions freely by identity. Two syntactically equal but
//! independently constructed nodes are distinct (they may carry different
//! type metadata), so tables that must not conflate them key by [`ExprId`],
//! which compares node addresses rather than structure.

use crate::types::{DType, StructuralType};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub mod builders;

// ============================================================================
// Variables
// ============================================================================

/// Visibility of a bound variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarKind {
    /// Scoped to the dataflow region it is bound in
    Intermediate,
    /// Escapes the region; function parameters and region results are output
    Output,
}

static NEXT_VAR_ID: AtomicUsize = AtomicUsize::new(0);

/// An IR variable: unique identity, display name, structural type, kind
///
/// Identity is the numeric id; two variables with the same name are still
/// distinct. Equality and hashing go through the id so variables can key
/// the pass's adjoint tables directly.
#[derive(Debug)]
pub struct Var {
    id: usize,
    name: String,
    ty: StructuralType,
    kind: VarKind,
}

/// Shared handle on a variable
pub type VarRef = Arc<Var>;

impl Var {
    /// Allocate a fresh variable with a unique id
    pub fn new(name: impl Into<String>, ty: StructuralType, kind: VarKind) -> VarRef {
        Arc::new(Var {
            id: NEXT_VAR_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            ty,
            kind,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> &StructuralType {
        &self.ty
    }

    pub fn kind(&self) -> VarKind {
        self.kind
    }
}

impl PartialEq for Var {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Var {}

impl Hash for Var {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

// ============================================================================
// Operators
// ============================================================================

/// Operator vocabulary
///
/// Forward operators have gradient registrations (see [`crate::gradients`]);
/// the backward operators and the `ones` / `zeros` constructors appear only
/// in adjoint code and have none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    // Elementwise broadcast operators
    Add,
    Subtract,
    Multiply,
    Divide,
    Negative,
    Exp,
    Log,
    Relu,

    // Reductions and linear algebra
    Sum,
    MatMul,
    Transpose,

    // Convolution and pooling
    Conv2d,
    MaxPool2d,

    // Losses
    SoftmaxCrossEntropy,

    // Backward operators (adjoint code only)
    CollapseSumLike,
    ReluBackward,
    Conv2dBackwardData,
    Conv2dBackwardWeight,
    MaxPool2dBackward,
    SoftmaxCrossEntropyBackward,

    // Tensor constructors; carry a `TensorSpec` instead of arguments
    Ones,
    Zeros,
}

impl OpKind {
    /// Canonical operator name
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Add => "add",
            OpKind::Subtract => "subtract",
            OpKind::Multiply => "multiply",
            OpKind::Divide => "divide",
            OpKind::Negative => "negative",
            OpKind::Exp => "exp",
            OpKind::Log => "log",
            OpKind::Relu => "relu",
            OpKind::Sum => "sum",
            OpKind::MatMul => "matmul",
            OpKind::Transpose => "transpose",
            OpKind::Conv2d => "conv2d",
            OpKind::MaxPool2d => "max_pool2d",
            OpKind::SoftmaxCrossEntropy => "softmax_cross_entropy",
            OpKind::CollapseSumLike => "collapse_sum_like",
            OpKind::ReluBackward => "relu_backward",
            OpKind::Conv2dBackwardData => "conv2d_backward_data",
            OpKind::Conv2dBackwardWeight => "conv2d_backward_weight",
            OpKind::MaxPool2dBackward => "max_pool2d_backward",
            OpKind::SoftmaxCrossEntropyBackward => "softmax_cross_entropy_backward",
            OpKind::Ones => "ones",
            OpKind::Zeros => "zeros",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Shape and dtype attribute for `ones` / `zeros` calls
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub shape: Vec<i64>,
    pub dtype: DType,
}

// ============================================================================
// Expressions
// ============================================================================

/// Expression node forms
#[derive(Debug)]
pub enum ExprKind {
    /// Reference to a variable
    Var(VarRef),
    /// Tuple construction
    Tuple(Vec<ExprRef>),
    /// Tuple projection: `tuple.index`
    TupleGetItem { tuple: ExprRef, index: usize },
    /// Operator call; `spec` is set only for `ones` / `zeros`
    Call {
        op: OpKind,
        args: Vec<ExprRef>,
        spec: Option<TensorSpec>,
    },
}

/// An immutable expression node with late-stamped type metadata
///
/// The type cell can be filled once after construction without changing the
/// node's identity, which the identity-keyed tables in the autodiff pass
/// rely on.
#[derive(Debug)]
pub struct Expr {
    kind: ExprKind,
    ty: OnceCell<StructuralType>,
}

/// Shared handle on an expression node
pub type ExprRef = Arc<Expr>;

impl Expr {
    fn with_ty(kind: ExprKind, ty: Option<StructuralType>) -> ExprRef {
        let cell = OnceCell::new();
        if let Some(ty) = ty {
            let _ = cell.set(ty);
        }
        Arc::new(Expr { kind, ty: cell })
    }

    /// A reference to `v`, typed with `v`'s structural type
    pub fn var(v: &VarRef) -> ExprRef {
        Expr::with_ty(ExprKind::Var(v.clone()), Some(v.ty().clone()))
    }

    /// A tuple literal; typed when every field is typed
    pub fn tuple(fields: Vec<ExprRef>) -> ExprRef {
        let ty = fields
            .iter()
            .map(|f| f.ty().cloned())
            .collect::<Option<Vec<_>>>()
            .map(StructuralType::Tuple);
        Expr::with_ty(ExprKind::Tuple(fields), ty)
    }

    /// A projection of `tuple` at `index`; typed when the base's tuple type
    /// is known and the index is in range
    pub fn tuple_get_item(tuple: ExprRef, index: usize) -> ExprRef {
        let ty = match tuple.ty() {
            Some(StructuralType::Tuple(fields)) => fields.get(index).cloned(),
            _ => None,
        };
        Expr::with_ty(ExprKind::TupleGetItem { tuple, index }, ty)
    }

    /// An untyped operator call; the type is stamped when the call is bound
    pub fn call(op: OpKind, args: Vec<ExprRef>) -> ExprRef {
        Expr::with_ty(ExprKind::Call { op, args, spec: None }, None)
    }

    /// An operator call with an explicit result type
    pub fn call_typed(op: OpKind, args: Vec<ExprRef>, ty: Option<StructuralType>) -> ExprRef {
        Expr::with_ty(ExprKind::Call { op, args, spec: None }, ty)
    }

    /// `ones(shape, dtype)`
    pub fn ones(shape: Vec<i64>, dtype: DType) -> ExprRef {
        Expr::constructor(OpKind::Ones, shape, dtype)
    }

    /// `zeros(shape, dtype)`
    pub fn zeros(shape: Vec<i64>, dtype: DType) -> ExprRef {
        Expr::constructor(OpKind::Zeros, shape, dtype)
    }

    fn constructor(op: OpKind, shape: Vec<i64>, dtype: DType) -> ExprRef {
        let ty = StructuralType::tensor(shape.clone(), dtype);
        Expr::with_ty(
            ExprKind::Call {
                op,
                args: Vec::new(),
                spec: Some(TensorSpec { shape, dtype }),
            },
            Some(ty),
        )
    }

    pub fn kind(&self) -> &ExprKind {
        &self.kind
    }

    /// Structural type, if one has been stamped
    pub fn ty(&self) -> Option<&StructuralType> {
        self.ty.get()
    }

    /// Stamp the structural type if none is present yet
    pub fn stamp_ty(&self, ty: &StructuralType) {
        let _ = self.ty.set(ty.clone());
    }

    /// The referenced variable, when this is a variable reference
    pub fn as_var(&self) -> Option<&VarRef> {
        match &self.kind {
            ExprKind::Var(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExprKind::Var(v) => write!(f, "{}", v),
            ExprKind::Tuple(fields) => {
                write!(f, "(")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", field)?;
                }
                write!(f, ")")
            }
            ExprKind::TupleGetItem { tuple, index } => write!(f, "{}.{}", tuple, index),
            ExprKind::Call { op, args, spec } => {
                write!(f, "{}(", op)?;
                let mut first = true;
                if let Some(spec) = spec {
                    write!(f, "(")?;
                    for (i, d) in spec.shape.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{}", d)?;
                    }
                    write!(f, "), {}", spec.dtype)?;
                    first = false;
                }
                for arg in args {
                    if !first {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                    first = false;
                }
                write!(f, ")")
            }
        }
    }
}

/// Identity key for expression nodes
///
/// Two keys are equal only when they wrap the same allocation; structurally
/// equal but independently constructed nodes compare unequal. The wrapped
/// handle keeps the node alive for the lifetime of the key.
#[derive(Debug, Clone)]
pub struct ExprId(ExprRef);

impl ExprId {
    pub fn of(expr: &ExprRef) -> Self {
        ExprId(expr.clone())
    }

    fn ptr(&self) -> *const Expr {
        Arc::as_ptr(&self.0)
    }
}

impl PartialEq for ExprId {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.ptr(), other.ptr())
    }
}

impl Eq for ExprId {}

impl Hash for ExprId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.ptr() as usize).hash(state);
    }
}

// ============================================================================
// Bindings, regions, functions, modules
// ============================================================================

/// A variable bound to an expression inside a dataflow region
#[derive(Debug, Clone)]
pub struct Binding {
    pub var: VarRef,
    pub value: ExprRef,
}

impl Binding {
    /// Bind `value` to `var`, stamping the value with the variable's type
    /// when the value carries none
    pub fn new(var: VarRef, value: ExprRef) -> Self {
        value.stamp_ty(var.ty());
        Binding { var, value }
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.var, self.value)
    }
}

/// A linear sequence of bindings, free of control flow
#[derive(Debug, Clone, Default)]
pub struct DataflowRegion {
    pub bindings: Vec<Binding>,
}

/// A function body: dataflow regions followed by a terminator expression
#[derive(Debug, Clone)]
pub struct SeqBody {
    pub regions: Vec<DataflowRegion>,
    pub result: ExprRef,
}

/// A dataflow function
#[derive(Debug, Clone)]
pub struct Function {
    pub params: Vec<VarRef>,
    pub body: SeqBody,
    pub ret_ty: StructuralType,
    /// External linkage name, when the function is externally visible
    pub global_symbol: Option<String>,
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", p, p.ty())?;
        }
        writeln!(f, ") -> {} {{", self.ret_ty)?;
        for region in &self.body.regions {
            for binding in &region.bindings {
                writeln!(f, "    {}", binding)?;
            }
        }
        writeln!(f, "    return {}", self.body.result)?;
        write!(f, "}}")
    }
}

/// Shared handle on a function
pub type FunctionRef = Arc<Function>;

/// A collection of named functions
///
/// Cloning a module is cheap: function entries are shared. The autodiff
/// pass returns `module.with_function(..)`, leaving the input untouched.
#[derive(Debug, Clone, Default)]
pub struct Module {
    functions: HashMap<String, FunctionRef>,
}

impl Module {
    pub fn new() -> Self {
        Module::default()
    }

    /// Bind `func` to `name`, replacing any previous entry
    pub fn insert(&mut self, name: impl Into<String>, func: Function) {
        self.functions.insert(name.into(), Arc::new(func));
    }

    pub fn get(&self, name: &str) -> Option<&FunctionRef> {
        self.functions.get(name)
    }

    /// Copy-on-write extension: a new module equal to this one plus `func`
    /// bound to `name`; existing entries are shared, not copied
    pub fn with_function(&self, name: impl Into<String>, func: Function) -> Module {
        let mut extended = self.clone();
        extended.insert(name, func);
        extended
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }
}
