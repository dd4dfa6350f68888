//! End-to-End Autodiff Pass Tests
//!
//! Drives `gradient()` over small forward programs and inspects the
//! emitted adjoint function binding by binding.

use std::sync::Arc;
use tensorgrad::types::{DType, StructuralType};
use tensorgrad::{
    gradient, gradient_with_registry, Binding, DataflowRegion, DiffError, Expr, ExprKind,
    Function, FunctionBuilder, GradientRegistry, Module, OpKind, SeqBody, VarRef,
};

fn t55() -> StructuralType {
    StructuralType::tensor([5, 5], DType::F32)
}

fn scalar() -> StructuralType {
    StructuralType::scalar(DType::F32)
}

fn all_bindings(func: &Function) -> Vec<&Binding> {
    func.body
        .regions
        .iter()
        .flat_map(|r| r.bindings.iter())
        .collect()
}

fn find_binding<'a>(func: &'a Function, name: &str) -> &'a Binding {
    all_bindings(func)
        .into_iter()
        .find(|b| b.var.name() == name)
        .unwrap_or_else(|| panic!("no binding named '{}'", name))
}

fn has_binding(func: &Function, name: &str) -> bool {
    all_bindings(func).iter().any(|b| b.var.name() == name)
}

/// Number of bindings whose value is a call to `op`
fn count_op(func: &Function, op: OpKind) -> usize {
    all_bindings(func)
        .iter()
        .filter(|b| matches!(b.value.kind(), ExprKind::Call { op: o, .. } if *o == op))
        .count()
}

fn call_parts<'a>(binding: &'a Binding) -> (OpKind, &'a [tensorgrad::ExprRef]) {
    match binding.value.kind() {
        ExprKind::Call { op, args, .. } => (*op, args.as_slice()),
        other => panic!("expected a call value for '{}', found {:?}", binding.var, other),
    }
}

fn arg_name(binding: &Binding, index: usize) -> String {
    let (_, args) = call_parts(binding);
    args[index]
        .as_var()
        .unwrap_or_else(|| panic!("argument {} of '{}' is not a variable", index, binding.var))
        .name()
        .to_string()
}

/// main(x, y) { lv0 = add(x, y); lv1 = sum(lv0); return lv1 }
fn sum_of_add() -> (Module, VarRef, VarRef) {
    let mut fb = FunctionBuilder::new();
    let x = fb.param("x", t55());
    let y = fb.param("y", t55());
    let lv0 = fb.emit(
        "lv0",
        t55(),
        Expr::call(OpKind::Add, vec![Expr::var(&x), Expr::var(&y)]),
    );
    let lv1 = fb.emit_output("lv1", scalar(), Expr::call(OpKind::Sum, vec![Expr::var(&lv0)]));

    let mut module = Module::new();
    module.insert("main", fb.build(&lv1));
    (module, x, y)
}

// ============================================================================
// S1: sum of add
// ============================================================================

#[test]
fn sum_of_add_emits_collapse_partials() {
    let (module, x, y) = sum_of_add();
    let module = gradient(&module, "main", &[x, y]).unwrap();
    let func = module.get("main_adjoint").unwrap();

    // Seed: lv1_adjoint = ones((), f32)
    let seed = find_binding(func, "lv1_adjoint");
    assert!(matches!(
        seed.value.kind(),
        ExprKind::Call { op: OpKind::Ones, spec: Some(spec), .. } if spec.shape.is_empty()
    ));

    // lv0_adjoint = multiply(lv1_adjoint, tmp) with tmp = ones((5, 5), f32)
    let lv0_adj = find_binding(func, "lv0_adjoint");
    let (op, _) = call_parts(lv0_adj);
    assert_eq!(op, OpKind::Multiply);
    assert_eq!(arg_name(lv0_adj, 0), "lv1_adjoint");
    let ones = find_binding(func, &arg_name(lv0_adj, 1));
    assert!(matches!(
        ones.value.kind(),
        ExprKind::Call { op: OpKind::Ones, spec: Some(spec), .. } if spec.shape == vec![5, 5]
    ));

    // x_adjoint = collapse_sum_like(lv0_adjoint, x); same for y
    for (name, param) in [("x_adjoint", "x"), ("y_adjoint", "y")] {
        let adj = find_binding(func, name);
        let (op, _) = call_parts(adj);
        assert_eq!(op, OpKind::CollapseSumLike);
        assert_eq!(arg_name(adj, 0), "lv0_adjoint");
        assert_eq!(arg_name(adj, 1), param);
    }
}

#[test]
fn return_pairs_value_with_adjoint_tuple() {
    let (module, x, y) = sum_of_add();
    let module = gradient(&module, "main", &[x, y]).unwrap();
    let func = module.get("main_adjoint").unwrap();

    assert_eq!(
        func.ret_ty,
        StructuralType::tuple(vec![scalar(), StructuralType::tuple(vec![t55(), t55()])])
    );

    // Terminator is a variable bound to (lv1, (x_adjoint, y_adjoint))
    let ret = func.body.result.as_var().expect("terminator must be a variable");
    let ret_binding = find_binding(func, ret.name());
    let ExprKind::Tuple(parts) = ret_binding.value.kind() else {
        panic!("return binding must be a tuple literal");
    };
    assert_eq!(parts[0].as_var().unwrap().name(), "lv1");

    let adjoints = find_binding(func, parts[1].as_var().unwrap().name());
    let ExprKind::Tuple(adjs) = adjoints.value.kind() else {
        panic!("adjoint collection must be a tuple literal");
    };
    let names: Vec<_> = adjs
        .iter()
        .map(|a| a.as_var().unwrap().name().to_string())
        .collect();
    assert_eq!(names, ["x_adjoint", "y_adjoint"]);
}

#[test]
fn parameters_are_fresh_but_structurally_equal() {
    let (module, x, y) = sum_of_add();
    let module = gradient(&module, "main", &[x.clone(), y.clone()]).unwrap();
    let func = module.get("main_adjoint").unwrap();

    assert_eq!(func.params.len(), 2);
    for (fresh, original) in func.params.iter().zip([&x, &y]) {
        assert_eq!(fresh.name(), original.name());
        assert_eq!(fresh.ty(), original.ty());
        assert_ne!(fresh, original, "parameter identity must be fresh");
    }
    assert_eq!(func.global_symbol.as_deref(), Some("main_adjoint"));
}

// ============================================================================
// S2: unused input
// ============================================================================

#[test]
fn unused_input_gets_structural_zero_adjoint() {
    let mut fb = FunctionBuilder::new();
    let x = fb.param("x", t55());
    let y = fb.param("y", t55());
    let lv0 = fb.emit_output("lv0", scalar(), Expr::call(OpKind::Sum, vec![Expr::var(&x)]));
    let mut module = Module::new();
    module.insert("main", fb.build(&lv0));

    let module = gradient(&module, "main", &[x, y]).unwrap();
    let func = module.get("main_adjoint").unwrap();

    let y_adj = find_binding(func, "y_adjoint");
    assert!(matches!(
        y_adj.value.kind(),
        ExprKind::Call { op: OpKind::Zeros, spec: Some(spec), .. }
            if spec.shape == vec![5, 5] && spec.dtype == DType::F32
    ));
}

// ============================================================================
// S3: aliasing chain
// ============================================================================

#[test]
fn aliasing_chain_collapses_through_intern() {
    let mut fb = FunctionBuilder::new();
    let x = fb.param("x", t55());
    let a = fb.emit("a", t55(), Expr::var(&x));
    let b = fb.emit("b", t55(), Expr::var(&a));
    let lv = fb.emit_output("lv", scalar(), Expr::call(OpKind::Sum, vec![Expr::var(&b)]));
    let mut module = Module::new();
    module.insert("main", fb.build(&lv));

    let module = gradient(&module, "main", &[x]).unwrap();
    let func = module.get("main_adjoint").unwrap();

    // The sum partial materializes exactly one (5, 5) ones node
    let wide_ones = all_bindings(func)
        .iter()
        .filter(|b| {
            matches!(
                b.value.kind(),
                ExprKind::Call { op: OpKind::Ones, spec: Some(spec), .. } if spec.shape == vec![5, 5]
            )
        })
        .count();
    assert_eq!(wide_ones, 1);

    // Each aliased adjoint is a reference to the previously bound one
    let a_adj = find_binding(func, "a_adjoint");
    assert!(matches!(a_adj.value.kind(), ExprKind::Var(v) if v.name() == "b_adjoint"));
    let x_adj = find_binding(func, "x_adjoint");
    assert!(matches!(x_adj.value.kind(), ExprKind::Var(v) if v.name() == "a_adjoint"));
}

// ============================================================================
// S4: tuple construction and projection
// ============================================================================

#[test]
fn tuple_projection_routes_adjoint_through_empty_tuple() {
    let pair_ty = StructuralType::tuple(vec![t55(), t55()]);

    let mut fb = FunctionBuilder::new();
    let x = fb.param("x", t55());
    let y = fb.param("y", t55());
    let t = fb.emit(
        "t",
        pair_ty,
        Expr::tuple(vec![Expr::var(&x), Expr::var(&y)]),
    );
    let u = fb.emit("u", t55(), Expr::tuple_get_item(Expr::var(&t), 0));
    let lv = fb.emit_output("lv", scalar(), Expr::call(OpKind::Sum, vec![Expr::var(&u)]));
    let mut module = Module::new();
    module.insert("main", fb.build(&lv));

    let module = gradient(&module, "main", &[x, y]).unwrap();
    let func = module.get("main_adjoint").unwrap();

    // t's adjoint is a tuple literal: field 0 holds u's bound adjoint,
    // field 1 is still the untouched zero leaf
    let t_adj = find_binding(func, "t_adjoint");
    let ExprKind::Tuple(fields) = t_adj.value.kind() else {
        panic!("t_adjoint must be a tuple literal");
    };
    assert_eq!(fields[0].as_var().unwrap().name(), "u_adjoint");
    let zero_leaf = find_binding(func, fields[1].as_var().unwrap().name());
    assert!(matches!(
        zero_leaf.value.kind(),
        ExprKind::Call { op: OpKind::Zeros, .. }
    ));

    // x reaches the target through the projection; y does not
    let x_adj = find_binding(func, "x_adjoint");
    assert!(matches!(x_adj.value.kind(), ExprKind::Var(v) if v.name() == "u_adjoint"));
    let y_adj = find_binding(func, "y_adjoint");
    assert!(matches!(
        y_adj.value.kind(),
        ExprKind::Call { op: OpKind::Zeros, spec: Some(spec), .. } if spec.shape == vec![5, 5]
    ));
}

// ============================================================================
// S5: shared intermediate
// ============================================================================

#[test]
fn shared_intermediate_accumulates_one_add_and_interns() {
    let mut fb = FunctionBuilder::new();
    let x = fb.param("x", t55());
    let y = fb.param("y", t55());
    let lv0 = fb.emit(
        "lv0",
        t55(),
        Expr::call(OpKind::Add, vec![Expr::var(&x), Expr::var(&y)]),
    );
    let lv1 = fb.emit(
        "lv1",
        t55(),
        Expr::call(OpKind::Add, vec![Expr::var(&lv0), Expr::var(&lv0)]),
    );
    let lv = fb.emit_output("lv", scalar(), Expr::call(OpKind::Sum, vec![Expr::var(&lv1)]));
    let mut module = Module::new();
    module.insert("main", fb.build(&lv));

    let module = gradient(&module, "main", &[x, y]).unwrap();
    let func = module.get("main_adjoint").unwrap();

    // lv0 is referenced twice, so its accumulated adjoint is exactly one
    // add of the two partials: two forward adds plus one adjoint add
    assert_eq!(count_op(func, OpKind::Add), 3);

    let lv0_adj = find_binding(func, "lv0_adjoint");
    let (op, args) = call_parts(lv0_adj);
    assert_eq!(op, OpKind::Add);
    for arg in args {
        let partial = find_binding(func, arg.as_var().unwrap().name());
        let (op, _) = call_parts(partial);
        assert_eq!(op, OpKind::CollapseSumLike);
        assert_eq!(arg_name(partial, 0), "lv1_adjoint");
    }

    // The input partials reference the bound lv0_adjoint variable instead
    // of re-embedding its defining expression
    for name in ["x_adjoint", "y_adjoint"] {
        let adj = find_binding(func, name);
        let (op, _) = call_parts(adj);
        assert_eq!(op, OpKind::CollapseSumLike);
        assert_eq!(arg_name(adj, 0), "lv0_adjoint");
    }
}

// ============================================================================
// S6: empty requires-grad set
// ============================================================================

#[test]
fn empty_selection_differentiates_every_parameter() {
    let (module, _, _) = sum_of_add();
    let module = gradient(&module, "main", &[]).unwrap();
    let func = module.get("main_adjoint").unwrap();

    let StructuralType::Tuple(parts) = &func.ret_ty else {
        panic!("return type must be a pair");
    };
    assert_eq!(parts[1], StructuralType::tuple(vec![t55(), t55()]));

    let ret = func.body.result.as_var().unwrap();
    let ret_binding = find_binding(func, ret.name());
    let ExprKind::Tuple(pair) = ret_binding.value.kind() else {
        panic!("return binding must be a tuple literal");
    };
    let adjoints = find_binding(func, pair[1].as_var().unwrap().name());
    let ExprKind::Tuple(adjs) = adjoints.value.kind() else {
        panic!("adjoint collection must be a tuple literal");
    };
    let names: Vec<_> = adjs
        .iter()
        .map(|a| a.as_var().unwrap().name().to_string())
        .collect();
    assert_eq!(names, ["x_adjoint", "y_adjoint"], "parameter order preserved");
}

// ============================================================================
// Universal invariants
// ============================================================================

#[test]
fn input_module_is_not_mutated() {
    let (module, x, y) = sum_of_add();
    let before = module.get("main").unwrap().clone();

    let out = gradient(&module, "main", &[x, y]).unwrap();

    assert_eq!(module.len(), 1);
    assert!(Arc::ptr_eq(&before, module.get("main").unwrap()));
    assert_eq!(out.len(), 2);
    assert!(Arc::ptr_eq(&before, out.get("main").unwrap()));
}

#[test]
fn binding_unreachable_from_target_is_skipped() {
    let mut fb = FunctionBuilder::new();
    let x = fb.param("x", t55());
    let y = fb.param("y", t55());
    let lv0 = fb.emit(
        "lv0",
        t55(),
        Expr::call(OpKind::Add, vec![Expr::var(&x), Expr::var(&y)]),
    );
    fb.emit(
        "dead",
        t55(),
        Expr::call(OpKind::Multiply, vec![Expr::var(&x), Expr::var(&y)]),
    );
    let lv1 = fb.emit_output("lv1", scalar(), Expr::call(OpKind::Sum, vec![Expr::var(&lv0)]));
    let mut module = Module::new();
    module.insert("main", fb.build(&lv1));

    let module = gradient(&module, "main", &[x, y]).unwrap();
    let func = module.get("main_adjoint").unwrap();

    assert!(has_binding(func, "dead"), "forward binding is reproduced");
    assert!(
        !has_binding(func, "dead_adjoint"),
        "no adjoint for a binding that does not reach the target"
    );
}

#[test]
fn nested_tuple_input_gets_leaf_by_leaf_zero() {
    let nested = StructuralType::tuple(vec![
        t55(),
        StructuralType::tuple(vec![t55(), StructuralType::tensor([3], DType::F32)]),
    ]);

    let mut fb = FunctionBuilder::new();
    let x = fb.param("x", t55());
    let w = fb.param("w", nested.clone());
    let lv = fb.emit_output("lv", scalar(), Expr::call(OpKind::Sum, vec![Expr::var(&x)]));
    let mut module = Module::new();
    module.insert("main", fb.build(&lv));

    let module = gradient(&module, "main", &[x, w]).unwrap();
    let func = module.get("main_adjoint").unwrap();

    let w_adj = find_binding(func, "w_adjoint");
    assert_eq!(w_adj.var.ty(), &nested);
    // After normalization the literal's leaves are rebound zeros bindings
    let ExprKind::Tuple(fields) = w_adj.value.kind() else {
        panic!("nested zero adjoint must be a tuple literal");
    };
    assert_eq!(fields.len(), 2);
    let leaf = find_binding(func, fields[0].as_var().unwrap().name());
    assert!(matches!(
        leaf.value.kind(),
        ExprKind::Call { op: OpKind::Zeros, spec: Some(spec), .. } if spec.shape == vec![5, 5]
    ));
    let inner = find_binding(func, fields[1].as_var().unwrap().name());
    assert!(matches!(inner.value.kind(), ExprKind::Tuple(_)));
}

// ============================================================================
// Error taxonomy
// ============================================================================

#[test]
fn unknown_function_is_rejected() {
    let (module, x, _) = sum_of_add();
    assert!(matches!(
        gradient(&module, "missing", &[x]),
        Err(DiffError::FunctionNotFound(name)) if name == "missing"
    ));
}

#[test]
fn non_scalar_target_is_rejected() {
    let mut fb = FunctionBuilder::new();
    let x = fb.param("x", t55());
    let y = fb.param("y", t55());
    let lv0 = fb.emit_output(
        "lv0",
        t55(),
        Expr::call(OpKind::Add, vec![Expr::var(&x), Expr::var(&y)]),
    );
    let mut module = Module::new();
    module.insert("main", fb.build(&lv0));

    assert!(matches!(
        gradient(&module, "main", &[x]),
        Err(DiffError::TargetNotScalar { .. })
    ));
}

#[test]
fn foreign_requires_grad_input_is_rejected() {
    let (module, x, _) = sum_of_add();
    let mut fb = FunctionBuilder::new();
    let stranger = fb.param("z", t55());

    let result = gradient(&module, "main", &[x, stranger]);
    assert!(matches!(
        result,
        Err(DiffError::RequiresGradNotParam(name)) if name == "z"
    ));
}

#[test]
fn non_tensor_input_is_rejected() {
    let mut fb = FunctionBuilder::new();
    let x = fb.param("x", t55());
    let s = fb.param("s", StructuralType::Shape);
    let lv = fb.emit_output("lv", scalar(), Expr::call(OpKind::Sum, vec![Expr::var(&x)]));
    let mut module = Module::new();
    module.insert("main", fb.build(&lv));

    assert!(matches!(
        gradient(&module, "main", &[s]),
        Err(DiffError::NotDifferentiable { .. })
    ));
}

#[test]
fn multi_region_body_is_rejected() {
    let mut fb = FunctionBuilder::new();
    let x = fb.param("x", scalar());
    let func = fb.build(&x);

    let split = Function {
        params: func.params.clone(),
        body: SeqBody {
            regions: vec![DataflowRegion::default(), DataflowRegion::default()],
            result: func.body.result.clone(),
        },
        ret_ty: func.ret_ty.clone(),
        global_symbol: None,
    };
    let mut module = Module::new();
    module.insert("main", split);

    assert!(matches!(
        gradient(&module, "main", &[x]),
        Err(DiffError::MultiRegionBody { found: 2 })
    ));
}

#[test]
fn non_variable_terminator_is_rejected() {
    let mut fb = FunctionBuilder::new();
    let x = fb.param("x", scalar());
    let func = fb.build(&x);

    let broken = Function {
        params: func.params.clone(),
        body: SeqBody {
            regions: func.body.regions.clone(),
            result: Expr::call(OpKind::Sum, vec![Expr::var(&x)]),
        },
        ret_ty: func.ret_ty.clone(),
        global_symbol: None,
    };
    let mut module = Module::new();
    module.insert("main", broken);

    assert!(matches!(
        gradient(&module, "main", &[x]),
        Err(DiffError::TargetNotVariable(_))
    ));
}

#[test]
fn missing_gradient_registration_is_rejected() {
    let (module, x, y) = sum_of_add();
    let empty = GradientRegistry::new();

    assert!(matches!(
        gradient_with_registry(&module, "main", &[x, y], &empty),
        Err(DiffError::MissingGradient(_))
    ));
}

#[test]
fn non_anf_call_argument_is_rejected() {
    let mut fb = FunctionBuilder::new();
    let x = fb.param("x", t55());
    let y = fb.param("y", t55());
    let nested = Expr::call_typed(
        OpKind::Add,
        vec![Expr::var(&x), Expr::var(&y)],
        Some(t55()),
    );
    let lv = fb.emit_output("lv", scalar(), Expr::call(OpKind::Sum, vec![nested]));
    let mut module = Module::new();
    module.insert("main", fb.build(&lv));

    assert!(matches!(
        gradient(&module, "main", &[x, y]),
        Err(DiffError::UnsupportedBinding(_))
    ));
}

#[test]
fn failed_pass_leaves_module_intact() {
    let (module, x, _) = sum_of_add();
    let before = module.get("main").unwrap().clone();
    let empty = GradientRegistry::new();

    let result = gradient_with_registry(&module, "main", &[x], &empty);
    assert!(result.is_err());
    assert_eq!(module.len(), 1);
    assert!(Arc::ptr_eq(&before, module.get("main").unwrap()));
}
