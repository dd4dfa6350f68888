//! Differentiation Error Types

use crate::ir::OpKind;
use thiserror::Error;

/// Errors raised by the builder and the autodiff pass
///
/// All errors are fatal: the pass produces no partial results, and the
/// input module is left untouched.
#[derive(Error, Debug)]
pub enum DiffError {
    /// Unknown function name
    #[error("function '{0}' not found in module")]
    FunctionNotFound(String),

    /// Function body is not a single dataflow region
    #[error("function body must contain exactly one dataflow region, found {found}")]
    MultiRegionBody { found: usize },

    /// Region terminator is not a variable reference
    #[error("region terminator must be a variable reference, found '{0}'")]
    TargetNotVariable(String),

    /// Gradient target is not a zero-dimensional tensor
    #[error("gradient target '{var}' must be a scalar tensor, found {ty}")]
    TargetNotScalar { var: String, ty: String },

    /// Requires-gradient entry is not a parameter of the function
    #[error("requires-gradient input '{0}' is not a parameter of the function")]
    RequiresGradNotParam(String),

    /// Selected input does not admit an adjoint
    #[error("input '{var}' of type {ty} does not admit an adjoint")]
    NotDifferentiable { var: String, ty: String },

    /// Terminator references a variable never bound in the region
    #[error("variable '{0}' is neither bound in the region nor a parameter")]
    UndefinedVariable(String),

    /// No gradient registered for a forward operator
    #[error("no gradient registered for operator '{0}'")]
    MissingGradient(OpKind),

    /// Gradient returned the wrong number of partials
    #[error("gradient of '{op}' returned {got} partials for {expected} arguments")]
    PartialArityMismatch {
        op: OpKind,
        expected: usize,
        got: usize,
    },

    /// Binding form the reverse walk cannot differentiate through
    #[error("AD does not support this binding form: '{0}'")]
    UnsupportedBinding(String),

    /// Adjoint contribution directed at a non-assignable expression
    #[error("adjoint cannot flow into expression '{0}'")]
    UnsupportedAdjointBase(String),

    /// Tuple projection whose base is not a variable reference
    #[error("tuple projection base must be a variable reference, found '{0}'")]
    ProjectionBaseNotVariable(String),

    /// Tuple projection whose base variable is not tuple-typed
    #[error("tuple projection base '{var}' has non-tuple type {ty}")]
    ProjectionBaseNotTuple { var: String, ty: String },

    /// Tuple adjoint shape diverged from the tuple it accumulates for
    #[error("tuple adjoint arity mismatch: expected {expected} fields, found {got}")]
    TupleArityMismatch { expected: usize, got: usize },

    /// Tuple-typed adjoint updated with a non-tuple increment
    #[error("tuple adjoint for '{base}' must be updated with a tuple literal, found '{increment}'")]
    TupleIncrementNotLiteral { base: String, increment: String },

    /// Tuple index outside the tuple's field range
    #[error("tuple index {index} out of range for '{expr}'")]
    TupleIndexOutOfRange { index: usize, expr: String },

    /// Accumulated tuple adjoint was collapsed to a variable reference and
    /// can no longer be updated field-wise
    #[error("adjoint of tuple variable '{0}' is no longer a tuple literal")]
    TupleAdjointNotLiteral(String),

    /// Zero or one construction over a type with unknown shape or dtype
    #[error("cannot build a constant tensor for type {0}: shape or dtype unknown")]
    UnknownTensorSpec(String),

    /// Normalization found a sub-expression with no structural type
    #[error("expression '{0}' has no structural type; cannot rebind it")]
    MissingType(String),

    /// Builder misuse (region lifecycle or binding kind)
    #[error("builder state error: {0}")]
    BuilderState(&'static str),
}

/// Result type for builder and autodiff operations
pub type DiffResult<T> = Result<T, DiffError>;
