//! # Reverse-Mode Automatic Differentiation
//!
//! Rewrites a dataflow function into a new function that returns the
//! original value paired with the gradients of that value with respect to a
//! chosen subset of inputs.
//!
//! ```text
//! Module + function name + requires-grad inputs
//!     ↓
//! [forward clone]     re-emit the forward region with fresh identities
//!     ↓
//! [reverse walk]      visit forward bindings in reverse, accumulate and
//!                     emit adjoint bindings
//!     ↓
//! [input finalize]    bind input adjoints; default-zero untouched inputs
//!     ↓
//! [return shaping]    (original_return, (adj_1, .., adj_k)) + normalize
//!     ↓
//! Module + `<name>_adjoint`
//! ```
//!
//! The pass keeps four tables while it runs:
//!
//! | table          | keyed by        | holds                                  |
//! |----------------|-----------------|----------------------------------------|
//! | `adjoint_vars` | variable        | the `<name>_adjoint` variable          |
//! | `adjoint_exprs`| variable        | the accumulated, not-yet-bound adjoint |
//! | `intern`       | node identity   | variable already bound to a node       |
//! | `zeros`        | node identity   | structural zeros from empty tuples     |
//!
//! Interning bounds expression growth: once an adjoint expression has been
//! bound, later occurrences of the same node collapse to a reference to the
//! bound variable instead of re-embedding the expression. Structural zeros
//! are tracked by node identity and absorbed by [`GradientPass::do_add`], so
//! untouched tuple fields never materialize `add` chains.

use crate::builder::BlockBuilder;
use crate::error::{DiffError, DiffResult};
use crate::gradients::{default_registry, GradientRegistry};
use crate::ir::{
    Binding, Expr, ExprId, ExprKind, ExprRef, Function, Module, SeqBody, Var, VarKind, VarRef,
};
use crate::types::StructuralType;
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace};

/// Differentiate `func_name` in `module` with the built-in gradients
///
/// Returns a new module extended with `<func_name>_adjoint`; the input
/// module is not modified. `requires_grad` selects the parameters whose
/// gradients appear in the output; an empty slice selects all of them.
pub fn gradient(
    module: &Module,
    func_name: &str,
    requires_grad: &[VarRef],
) -> DiffResult<Module> {
    gradient_with_registry(module, func_name, requires_grad, default_registry())
}

/// Differentiate with a caller-supplied gradient registry
pub fn gradient_with_registry(
    module: &Module,
    func_name: &str,
    requires_grad: &[VarRef],
    registry: &GradientRegistry,
) -> DiffResult<Module> {
    let func = module
        .get(func_name)
        .ok_or_else(|| DiffError::FunctionNotFound(func_name.to_string()))?;

    let pass = GradientPass::new(registry);
    let adjoint = pass.run(func, func_name, requires_grad)?;

    let name = format!("{}_adjoint", func_name);
    debug!(function = func_name, adjoint = %name, "gradient pass finished");
    Ok(module.with_function(name, adjoint))
}

/// One pass invocation; owns the adjoint tables and the region under
/// construction
struct GradientPass<'r> {
    registry: &'r GradientRegistry,
    builder: BlockBuilder,
    /// Original variable -> fresh variable in the output function
    var_map: HashMap<VarRef, VarRef>,
    /// Variable -> its adjoint variable; created on first emission
    adjoint_vars: HashMap<VarRef, VarRef>,
    /// Variable -> accumulated adjoint expression, not yet bound
    adjoint_exprs: HashMap<VarRef, ExprRef>,
    /// Node identity -> variable the node was bound to
    intern: HashMap<ExprId, VarRef>,
    /// Identities of structural-zero nodes
    zeros: HashSet<ExprId>,
}

impl<'r> GradientPass<'r> {
    fn new(registry: &'r GradientRegistry) -> Self {
        GradientPass {
            registry,
            builder: BlockBuilder::new(),
            var_map: HashMap::new(),
            adjoint_vars: HashMap::new(),
            adjoint_exprs: HashMap::new(),
            intern: HashMap::new(),
            zeros: HashSet::new(),
        }
    }

    fn run(
        mut self,
        func: &Function,
        func_name: &str,
        requires_grad: &[VarRef],
    ) -> DiffResult<Function> {
        for g in requires_grad {
            if !func.params.iter().any(|p| p == g) {
                return Err(DiffError::RequiresGradNotParam(g.name().to_string()));
            }
        }

        let region = match func.body.regions.as_slice() {
            [region] => region,
            other => return Err(DiffError::MultiRegionBody { found: other.len() }),
        };

        let target = func
            .body
            .result
            .as_var()
            .cloned()
            .ok_or_else(|| DiffError::TargetNotVariable(func.body.result.to_string()))?;
        if !target.ty().is_scalar_tensor() {
            return Err(DiffError::TargetNotScalar {
                var: target.name().to_string(),
                ty: target.ty().to_string(),
            });
        }

        let selected: Vec<VarRef> = if requires_grad.is_empty() {
            func.params.clone()
        } else {
            requires_grad.to_vec()
        };
        for input in &selected {
            if !input.ty().is_nested_tensor() {
                return Err(DiffError::NotDifferentiable {
                    var: input.name().to_string(),
                    ty: input.ty().to_string(),
                });
            }
        }

        debug!(
            function = func_name,
            params = func.params.len(),
            bindings = region.bindings.len(),
            "differentiating function"
        );

        // Forward clone: fresh parameters, then the forward bindings with
        // every variable remapped to its fresh identity
        let params: Vec<VarRef> = func
            .params
            .iter()
            .map(|p| {
                let fresh = Var::new(p.name(), p.ty().clone(), p.kind());
                self.var_map.insert(p.clone(), fresh.clone());
                fresh
            })
            .collect();

        self.builder.begin_region()?;
        let mut forward = Vec::with_capacity(region.bindings.len());
        for binding in &region.bindings {
            let value = self.remap(&binding.value);
            let fresh = Var::new(binding.var.name(), binding.var.ty().clone(), binding.var.kind());
            self.var_map.insert(binding.var.clone(), fresh.clone());
            let binding = Binding::new(fresh, value);
            self.emit_binding(&binding)?;
            forward.push(binding);
        }

        // Seed the target adjoint with ones of the target's (scalar) shape
        let target = self
            .var_map
            .get(&target)
            .cloned()
            .ok_or_else(|| DiffError::UndefinedVariable(target.name().to_string()))?;
        let (shape, dtype) = target
            .ty()
            .tensor_spec()
            .map(|(s, d)| (s.to_vec(), d))
            .ok_or_else(|| DiffError::UnknownTensorSpec(target.ty().to_string()))?;
        self.adjoint_exprs
            .insert(target.clone(), Expr::ones(shape, dtype));

        // Reverse walk over the re-emitted forward bindings
        for binding in forward.iter().rev() {
            let x = &binding.var;
            let Some(adjoint) = self.adjoint_exprs.get(x).cloned() else {
                trace!(var = %x, "variable does not reach the target; skipping");
                continue;
            };
            let adj_var = self.adjoint_var(x);
            let adjoint = self.bind_and_emit(&adj_var, adjoint)?;
            self.adjoint_exprs.insert(x.clone(), adjoint.clone());
            trace!(var = %x, adjoint = %adj_var, "emitted adjoint binding");
            self.propagate(binding, &adjoint, &adj_var)?;
        }

        // Input-adjoint finalization: bind accumulated input adjoints first;
        // inputs the walk never touched get default-zero bindings after all
        // other adjoint bindings
        let mut input_adjoints = Vec::with_capacity(selected.len());
        let mut untouched = Vec::new();
        for original in &selected {
            let input = self
                .var_map
                .get(original)
                .cloned()
                .ok_or_else(|| DiffError::UndefinedVariable(original.name().to_string()))?;
            let adj_var = self.adjoint_var(&input);
            match self.adjoint_exprs.get(&input).cloned() {
                Some(expr) => {
                    self.bind_and_emit(&adj_var, expr)?;
                }
                None => untouched.push((input, adj_var.clone())),
            }
            input_adjoints.push(adj_var);
        }
        for (input, adj_var) in untouched {
            let zero = self.build_empty_nested_tuple(input.ty())?;
            self.bind_and_emit(&adj_var, zero)?;
        }

        // Return shaping: (original_return, (adj_1, .., adj_k))
        let adjoint_tuple = Expr::tuple(input_adjoints.iter().map(Expr::var).collect());
        let result = Expr::tuple(vec![Expr::var(&target), adjoint_tuple]);
        let region = self.builder.end_region()?;
        let ret_ty = StructuralType::tuple(vec![
            func.ret_ty.clone(),
            StructuralType::tuple(input_adjoints.iter().map(|v| v.ty().clone()).collect()),
        ]);

        let output = Function {
            params,
            body: SeqBody {
                regions: vec![region],
                result,
            },
            ret_ty,
            global_symbol: Some(format!("{}_adjoint", func_name)),
        };
        self.builder.normalize(output)
    }

    /// Rebuild `expr` with every variable reference remapped through
    /// `var_map`; nodes without variables inside are shared as-is
    fn remap(&self, expr: &ExprRef) -> ExprRef {
        match expr.kind() {
            ExprKind::Var(v) => match self.var_map.get(v) {
                Some(fresh) => Expr::var(fresh),
                None => expr.clone(),
            },
            ExprKind::Tuple(fields) => {
                let rebuilt = Expr::tuple(fields.iter().map(|f| self.remap(f)).collect());
                if let Some(ty) = expr.ty() {
                    rebuilt.stamp_ty(ty);
                }
                rebuilt
            }
            ExprKind::TupleGetItem { tuple, index } => {
                let rebuilt = Expr::tuple_get_item(self.remap(tuple), *index);
                if let Some(ty) = expr.ty() {
                    rebuilt.stamp_ty(ty);
                }
                rebuilt
            }
            ExprKind::Call { args, .. } if args.is_empty() => expr.clone(),
            ExprKind::Call { op, args, .. } => Expr::call_typed(
                *op,
                args.iter().map(|a| self.remap(a)).collect(),
                expr.ty().cloned(),
            ),
        }
    }

    fn emit_binding(&mut self, binding: &Binding) -> DiffResult<()> {
        match binding.var.kind() {
            VarKind::Intermediate => self.builder.emit(binding.clone()),
            VarKind::Output => self.builder.emit_output(binding.clone()),
        }
    }

    /// The adjoint variable of `var`, created on first use with the same
    /// type and kind
    fn adjoint_var(&mut self, var: &VarRef) -> VarRef {
        if let Some(existing) = self.adjoint_vars.get(var) {
            return existing.clone();
        }
        let adjoint = Var::new(format!("{}_adjoint", var.name()), var.ty().clone(), var.kind());
        self.adjoint_vars.insert(var.clone(), adjoint.clone());
        adjoint
    }

    /// Bind `expr` to `v` and emit the binding
    ///
    /// When `expr` was already bound earlier, the binding emitted is an
    /// alias of the previously bound variable; otherwise the node is
    /// interned under `v` and stamped with `v`'s type. Returns the
    /// expression actually bound.
    fn bind_and_emit(&mut self, v: &VarRef, expr: ExprRef) -> DiffResult<ExprRef> {
        let expr = match self.intern.get(&ExprId::of(&expr)) {
            Some(bound) => Expr::var(bound),
            None => {
                expr.stamp_ty(v.ty());
                self.intern.insert(ExprId::of(&expr), v.clone());
                expr
            }
        };
        let binding = Binding::new(v.clone(), expr.clone());
        self.emit_binding(&binding)?;
        Ok(expr)
    }

    /// Back-propagate the emitted adjoint of one binding into the inputs of
    /// its right-hand side
    fn propagate(
        &mut self,
        binding: &Binding,
        adjoint: &ExprRef,
        adj_var: &VarRef,
    ) -> DiffResult<()> {
        match binding.value.kind() {
            ExprKind::Tuple(fields) => {
                for (index, field) in fields.iter().enumerate() {
                    let increment = project_field(adjoint, index)?;
                    self.update_expr_map(field, increment)?;
                }
                Ok(())
            }
            ExprKind::Var(_) | ExprKind::TupleGetItem { .. } => {
                self.update_expr_map(&binding.value, adjoint.clone())
            }
            ExprKind::Call { op, args, .. } => {
                let grad = self
                    .registry
                    .lookup(*op)
                    .ok_or(DiffError::MissingGradient(*op))?;
                let partials = grad(&binding.value, adj_var)?;
                if partials.len() != args.len() {
                    return Err(DiffError::PartialArityMismatch {
                        op: *op,
                        expected: args.len(),
                        got: partials.len(),
                    });
                }
                for (arg, partial) in args.iter().zip(partials) {
                    if arg.as_var().is_none() {
                        return Err(DiffError::UnsupportedBinding(binding.to_string()));
                    }
                    self.update_expr_map(arg, partial)?;
                }
                Ok(())
            }
        }
    }

    /// Accumulate `increment` into the adjoint of `base`
    ///
    /// `base` is a variable, a tuple literal (recursed field-wise), or a
    /// tuple projection (the projected field of the base tuple's adjoint is
    /// updated, zero-initializing the tuple adjoint first).
    fn update_expr_map(&mut self, base: &ExprRef, increment: ExprRef) -> DiffResult<()> {
        match base.kind() {
            ExprKind::Var(v) => {
                if let Some(current) = self.adjoint_exprs.get(v).cloned() {
                    let sum = self.do_add(current, increment)?;
                    self.adjoint_exprs.insert(v.clone(), sum);
                } else {
                    let increment = match self.intern.get(&ExprId::of(&increment)) {
                        Some(bound) => Expr::var(bound),
                        None => increment,
                    };
                    self.adjoint_exprs.insert(v.clone(), increment);
                }
                Ok(())
            }
            ExprKind::Tuple(fields) => {
                let incs = match increment.kind() {
                    ExprKind::Tuple(incs) => incs,
                    _ => {
                        return Err(DiffError::TupleIncrementNotLiteral {
                            base: base.to_string(),
                            increment: increment.to_string(),
                        })
                    }
                };
                if incs.len() != fields.len() {
                    return Err(DiffError::TupleArityMismatch {
                        expected: fields.len(),
                        got: incs.len(),
                    });
                }
                for (field, inc) in fields.iter().zip(incs.iter()) {
                    self.update_expr_map(field, inc.clone())?;
                }
                Ok(())
            }
            ExprKind::TupleGetItem { tuple, index } => {
                let t = tuple
                    .as_var()
                    .cloned()
                    .ok_or_else(|| DiffError::ProjectionBaseNotVariable(tuple.to_string()))?;
                if !matches!(t.ty(), StructuralType::Tuple(_)) {
                    return Err(DiffError::ProjectionBaseNotTuple {
                        var: t.name().to_string(),
                        ty: t.ty().to_string(),
                    });
                }

                let current = match self.adjoint_exprs.get(&t) {
                    Some(expr) => expr.clone(),
                    None => {
                        let empty = self.build_empty_nested_tuple(t.ty())?;
                        self.adjoint_exprs.insert(t.clone(), empty.clone());
                        empty
                    }
                };
                let mut fields = match current.kind() {
                    ExprKind::Tuple(fields) => fields.clone(),
                    _ => return Err(DiffError::TupleAdjointNotLiteral(t.name().to_string())),
                };
                if *index >= fields.len() {
                    return Err(DiffError::TupleIndexOutOfRange {
                        index: *index,
                        expr: current.to_string(),
                    });
                }
                fields[*index] = self.do_add(fields[*index].clone(), increment)?;
                self.adjoint_exprs.insert(t, Expr::tuple(fields));
                Ok(())
            }
            ExprKind::Call { .. } => Err(DiffError::UnsupportedAdjointBase(base.to_string())),
        }
    }

    /// Add two adjoint contributions with zero elimination
    ///
    /// Structural zeros absorb; tuple literals add field-wise; otherwise an
    /// `add` call is built. Only the new contribution `s2` is rewritten
    /// through the intern table: `s1` is the accumulator and has already
    /// been canonicalized by earlier steps.
    fn do_add(&mut self, s1: ExprRef, s2: ExprRef) -> DiffResult<ExprRef> {
        if self.zeros.contains(&ExprId::of(&s1)) {
            return Ok(s2);
        }
        if self.zeros.contains(&ExprId::of(&s2)) {
            return Ok(s1);
        }

        let fields1 = match s1.kind() {
            ExprKind::Tuple(fields) => Some(fields.clone()),
            _ => None,
        };
        let fields2 = match s2.kind() {
            ExprKind::Tuple(fields) => Some(fields.clone()),
            _ => None,
        };
        if let (Some(fields1), Some(fields2)) = (fields1, fields2) {
            if fields1.len() != fields2.len() {
                return Err(DiffError::TupleArityMismatch {
                    expected: fields1.len(),
                    got: fields2.len(),
                });
            }
            let fields = fields1
                .iter()
                .zip(fields2.iter())
                .map(|(a, b)| self.do_add(a.clone(), b.clone()))
                .collect::<DiffResult<Vec<_>>>()?;
            return Ok(Expr::tuple(fields));
        }

        let rhs = match self.intern.get(&ExprId::of(&s2)) {
            Some(bound) => Expr::var(bound),
            None => s2,
        };
        let ty = s1.ty().cloned();
        Ok(Expr::call_typed(crate::ir::OpKind::Add, vec![s1, rhs], ty))
    }

    /// A tuple literal mirroring `ty`'s nesting whose leaves are `zeros`
    /// calls registered as structural zeros
    fn build_empty_nested_tuple(&mut self, ty: &StructuralType) -> DiffResult<ExprRef> {
        match ty {
            StructuralType::Tuple(fields) => {
                let elems = fields
                    .iter()
                    .map(|f| self.build_empty_nested_tuple(f))
                    .collect::<DiffResult<Vec<_>>>()?;
                Ok(Expr::tuple(elems))
            }
            StructuralType::Tensor { .. } => {
                let (shape, dtype) = ty
                    .tensor_spec()
                    .ok_or_else(|| DiffError::UnknownTensorSpec(ty.to_string()))?;
                let zero = Expr::zeros(shape.to_vec(), dtype);
                self.zeros.insert(ExprId::of(&zero));
                Ok(zero)
            }
            other => Err(DiffError::UnknownTensorSpec(other.to_string())),
        }
    }
}

/// The `index`-th field of an accumulated tuple adjoint: structural when
/// the adjoint is a tuple literal, a typed projection node otherwise (the
/// literal may have been collapsed to a bound variable by interning)
fn project_field(adjoint: &ExprRef, index: usize) -> DiffResult<ExprRef> {
    match adjoint.kind() {
        ExprKind::Tuple(fields) => {
            fields
                .get(index)
                .cloned()
                .ok_or_else(|| DiffError::TupleIndexOutOfRange {
                    index,
                    expr: adjoint.to_string(),
                })
        }
        _ => Ok(Expr::tuple_get_item(adjoint.clone(), index)),
    }
}
