//! # TensorGrad
//!
//! A reverse-mode automatic differentiation pass for a typed tensor
//! dataflow IR. Given a module, a function computing a scalar loss, and a
//! set of requires-gradient inputs, the pass derives a new function that
//! returns the original value together with the gradients of that value
//! with respect to the selected inputs.
//!
//! ## Pipeline Architecture
//!
//! ```text
//! StructuralType / DType          (types)
//!     ↓
//! Var / Expr / Binding /
//! Region / Function / Module      (ir)
//!     ↓
//! FunctionBuilder                 (ir::builders)  → forward function
//!     ↓
//! GradientRegistry                (gradients)     → per-operator partials
//!     ↓
//! gradient()                      (autodiff)      → `<name>_adjoint`
//!     │
//!     └── BlockBuilder + normalize (builder)      → A-normal-form output
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use tensorgrad::{gradient, Expr, FunctionBuilder, Module, OpKind};
//! use tensorgrad::types::{DType, StructuralType};
//!
//! // main(x, y) { lv0 = add(x, y); lv1 = sum(lv0); return lv1 }
//! let t = StructuralType::tensor([5, 5], DType::F32);
//! let s = StructuralType::scalar(DType::F32);
//!
//! let mut fb = FunctionBuilder::new();
//! let x = fb.param("x", t.clone());
//! let y = fb.param("y", t.clone());
//! let lv0 = fb.emit("lv0", t, Expr::call(OpKind::Add, vec![Expr::var(&x), Expr::var(&y)]));
//! let lv1 = fb.emit_output("lv1", s, Expr::call(OpKind::Sum, vec![Expr::var(&lv0)]));
//!
//! let mut module = Module::new();
//! module.insert("main", fb.build(&lv1));
//!
//! // main_adjoint(x, y) -> (lv1, (x_adjoint, y_adjoint))
//! let module = gradient(&module, "main", &[x, y]).unwrap();
//! assert!(module.get("main_adjoint").is_some());
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `types` | Structural types: tensors, tuples, shapes, prims |
//! | `ir` | Expression nodes, variables, bindings, regions, functions, modules |
//! | `ir::builders` | Fluent construction of forward functions |
//! | `builder` | Region accumulation and A-normal-form normalization |
//! | `gradients` | Primitive gradient registry and built-in registrations |
//! | `autodiff` | The reverse-mode differentiation pass |
//! | `error` | Error taxonomy shared by the builder and the pass |

pub mod autodiff;
pub mod builder;
pub mod error;
pub mod gradients;
pub mod ir;
pub mod types;

pub use crate::autodiff::{gradient, gradient_with_registry};
pub use crate::builder::BlockBuilder;
pub use crate::error::{DiffError, DiffResult};
pub use crate::gradients::{default_registry, GradientFn, GradientRegistry};
pub use crate::ir::builders::FunctionBuilder;
pub use crate::ir::{
    Binding, DataflowRegion, Expr, ExprId, ExprKind, ExprRef, Function, FunctionRef, Module,
    OpKind, SeqBody, TensorSpec, Var, VarKind, VarRef,
};
pub use crate::types::{DType, StructuralType};
