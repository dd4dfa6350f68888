//! Builder Pattern for Function Construction
//!
//! Fluent API for assembling forward dataflow functions, particularly useful
//! for tests and examples.
//!
//! ## Example
//!
//! ```rust
//! use tensorgrad::ir::builders::FunctionBuilder;
//! use tensorgrad::ir::{Expr, OpKind};
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
//! let func = fb.build(&lv1);
//! assert_eq!(func.params.len(), 2);
//! ```

use super::{Binding, DataflowRegion, Expr, ExprRef, Function, SeqBody, Var, VarKind, VarRef};
use crate::types::StructuralType;

/// Builder for dataflow functions with a single region
#[derive(Debug, Default)]
pub struct FunctionBuilder {
    params: Vec<VarRef>,
    bindings: Vec<Binding>,
}

impl FunctionBuilder {
    pub fn new() -> Self {
        FunctionBuilder::default()
    }

    /// Declare a parameter and return its variable
    pub fn param(&mut self, name: impl Into<String>, ty: StructuralType) -> VarRef {
        let var = Var::new(name, ty, VarKind::Output);
        self.params.push(var.clone());
        var
    }

    /// Bind `value` to a fresh intermediate variable
    pub fn emit(
        &mut self,
        name: impl Into<String>,
        ty: StructuralType,
        value: ExprRef,
    ) -> VarRef {
        self.bind(name, ty, value, VarKind::Intermediate)
    }

    /// Bind `value` to a fresh output variable (visible outside the region)
    pub fn emit_output(
        &mut self,
        name: impl Into<String>,
        ty: StructuralType,
        value: ExprRef,
    ) -> VarRef {
        self.bind(name, ty, value, VarKind::Output)
    }

    fn bind(
        &mut self,
        name: impl Into<String>,
        ty: StructuralType,
        value: ExprRef,
        kind: VarKind,
    ) -> VarRef {
        let var = Var::new(name, ty, kind);
        self.bindings.push(Binding::new(var.clone(), value));
        var
    }

    /// Finish the function, returning `ret` as the region terminator
    pub fn build(self, ret: &VarRef) -> Function {
        Function {
            params: self.params,
            body: SeqBody {
                regions: vec![DataflowRegion {
                    bindings: self.bindings,
                }],
                result: Expr::var(ret),
            },
            ret_ty: ret.ty().clone(),
            global_symbol: None,
        }
    }
}
