//! # Block Builder
//!
//! Accumulates bindings into the dataflow region under construction and
//! normalizes finished functions to A-normal form.
//!
//! ```text
//! begin_region -> emit / emit_output (bindings) -> end_region -> DataflowRegion
//!                                                                     ↓
//! Function ------------------------------------------> [normalize] -> Function
//! ```
//!
//! Normalization rebinds every non-variable sub-expression of a binding
//! value through a fresh intermediate variable and rebinds the region
//! terminator through an output variable, so that call arguments, tuple
//! fields, projection bases, and the terminator are all variable references.
//! A sub-expression node already bound earlier in the region is reused by
//! identity rather than bound again.

use crate::error::{DiffError, DiffResult};
use crate::ir::{
    Binding, DataflowRegion, Expr, ExprId, ExprKind, ExprRef, Function, SeqBody, Var, VarKind,
    VarRef,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Builder for one dataflow region at a time
#[derive(Debug, Default)]
pub struct BlockBuilder {
    bindings: Option<Vec<Binding>>,
}

impl BlockBuilder {
    pub fn new() -> Self {
        BlockBuilder::default()
    }

    /// Open a new region; errors if one is already open
    pub fn begin_region(&mut self) -> DiffResult<()> {
        if self.bindings.is_some() {
            return Err(DiffError::BuilderState(
                "begin_region called while a region is already open",
            ));
        }
        self.bindings = Some(Vec::new());
        Ok(())
    }

    /// Emit a dataflow binding; the bound variable must be intermediate
    pub fn emit(&mut self, binding: Binding) -> DiffResult<()> {
        if binding.var.kind() != VarKind::Intermediate {
            return Err(DiffError::BuilderState(
                "emit requires an intermediate variable; use emit_output",
            ));
        }
        self.push(binding)
    }

    /// Emit an output binding; the bound variable must be output-kind
    pub fn emit_output(&mut self, binding: Binding) -> DiffResult<()> {
        if binding.var.kind() != VarKind::Output {
            return Err(DiffError::BuilderState(
                "emit_output requires an output variable; use emit",
            ));
        }
        self.push(binding)
    }

    fn push(&mut self, binding: Binding) -> DiffResult<()> {
        match &mut self.bindings {
            Some(bindings) => {
                bindings.push(binding);
                Ok(())
            }
            None => Err(DiffError::BuilderState("emit outside an open region")),
        }
    }

    /// Close the open region and return it
    pub fn end_region(&mut self) -> DiffResult<DataflowRegion> {
        match self.bindings.take() {
            Some(bindings) => Ok(DataflowRegion { bindings }),
            None => Err(DiffError::BuilderState("end_region without an open region")),
        }
    }

    /// Canonicalize `func` to A-normal form
    ///
    /// Every non-leaf sub-expression is rebound through a fresh intermediate
    /// variable; the terminator becomes a variable reference. Expression
    /// nodes already bound in the region are reused by identity.
    pub fn normalize(&self, func: Function) -> DiffResult<Function> {
        let mut norm = Normalizer::default();
        let mut regions = Vec::with_capacity(func.body.regions.len().max(1));
        for region in func.body.regions {
            regions.push(norm.region(region)?);
        }

        let result = match func.body.result.kind() {
            ExprKind::Var(_) => func.body.result.clone(),
            _ => {
                let mut extra = Vec::new();
                let flat = norm.flatten_children(&func.body.result, &mut extra)?;
                let ret = Var::new("ret", func.ret_ty.clone(), VarKind::Output);
                extra.push(Binding::new(ret.clone(), flat));
                if regions.is_empty() {
                    regions.push(DataflowRegion::default());
                }
                if let Some(last) = regions.last_mut() {
                    last.bindings.extend(extra);
                }
                Expr::var(&ret)
            }
        };

        let bindings: usize = regions.iter().map(|r| r.bindings.len()).sum();
        debug!(bindings, rebound = norm.fresh, "normalized function body");

        Ok(Function {
            params: func.params,
            body: SeqBody { regions, result },
            ret_ty: func.ret_ty,
            global_symbol: func.global_symbol,
        })
    }
}

/// Region-scoped normalization state
#[derive(Default)]
struct Normalizer {
    /// Expression node identity -> variable already bound to it
    bound: HashMap<ExprId, VarRef>,
    /// Counter for fresh `tmp{n}` names
    fresh: usize,
}

impl Normalizer {
    fn region(&mut self, region: DataflowRegion) -> DiffResult<DataflowRegion> {
        let mut out = Vec::with_capacity(region.bindings.len());
        for binding in region.bindings {
            let value = self.flatten_children(&binding.value, &mut out)?;
            self.bound
                .insert(ExprId::of(&binding.value), binding.var.clone());
            out.push(Binding::new(binding.var.clone(), value));
        }
        Ok(DataflowRegion { bindings: out })
    }

    /// Rebuild `expr` with every non-variable child rebound through a
    /// variable, emitting the child bindings into `out`
    fn flatten_children(&mut self, expr: &ExprRef, out: &mut Vec<Binding>) -> DiffResult<ExprRef> {
        match expr.kind() {
            ExprKind::Var(_) => Ok(expr.clone()),
            ExprKind::Tuple(fields) => {
                let atoms = fields
                    .iter()
                    .map(|f| self.atomize(f, out))
                    .collect::<DiffResult<Vec<_>>>()?;
                if atoms.iter().zip(fields).all(|(a, b)| Arc::ptr_eq(a, b)) {
                    return Ok(expr.clone());
                }
                let rebuilt = Expr::tuple(atoms);
                if let Some(ty) = expr.ty() {
                    rebuilt.stamp_ty(ty);
                }
                Ok(rebuilt)
            }
            ExprKind::TupleGetItem { tuple, index } => {
                let base = self.atomize(tuple, out)?;
                if Arc::ptr_eq(&base, tuple) {
                    return Ok(expr.clone());
                }
                let rebuilt = Expr::tuple_get_item(base, *index);
                if let Some(ty) = expr.ty() {
                    rebuilt.stamp_ty(ty);
                }
                Ok(rebuilt)
            }
            ExprKind::Call { op, args, .. } => {
                let atoms = args
                    .iter()
                    .map(|a| self.atomize(a, out))
                    .collect::<DiffResult<Vec<_>>>()?;
                if atoms.iter().zip(args).all(|(a, b)| Arc::ptr_eq(a, b)) {
                    return Ok(expr.clone());
                }
                Ok(Expr::call_typed(*op, atoms, expr.ty().cloned()))
            }
        }
    }

    /// Reduce `child` to a variable reference, binding it if necessary
    fn atomize(&mut self, child: &ExprRef, out: &mut Vec<Binding>) -> DiffResult<ExprRef> {
        if matches!(child.kind(), ExprKind::Var(_)) {
            return Ok(child.clone());
        }
        if let Some(var) = self.bound.get(&ExprId::of(child)) {
            return Ok(Expr::var(var));
        }
        let flat = self.flatten_children(child, out)?;
        let ty = child
            .ty()
            .or_else(|| flat.ty())
            .cloned()
            .ok_or_else(|| DiffError::MissingType(child.to_string()))?;
        let var = Var::new(format!("tmp{}", self.fresh), ty, VarKind::Intermediate);
        self.fresh += 1;
        out.push(Binding::new(var.clone(), flat));
        self.bound.insert(ExprId::of(child), var.clone());
        Ok(Expr::var(&var))
    }
}
