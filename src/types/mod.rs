//! # Structural Type System
//!
//! Shape-and-dtype metadata for IR values: tensors (with optionally unknown
//! rank, dtype, or shape), arbitrarily nested tuples, and the two
//! non-differentiable leaf kinds `Shape` and `Prim`.
//!
//! ## Usage
//!
//! ```rust
//! use tensorgrad::types::{DType, StructuralType};
//!
//! // A (5, 5) f32 tensor
//! let matrix = StructuralType::tensor([5, 5], DType::F32);
//!
//! // A zero-dimensional (scalar) tensor
//! let loss = StructuralType::scalar(DType::F32);
//! assert!(loss.is_scalar_tensor());
//!
//! // A pair of tensors admits adjoints; a shape does not
//! let pair = StructuralType::tuple(vec![matrix.clone(), matrix.clone()]);
//! assert!(pair.is_nested_tensor());
//! assert!(!StructuralType::Shape.is_nested_tensor());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Tensor element types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
    Bool,
}

impl DType {
    /// True for floating-point element types
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::Bool => "bool",
        };
        write!(f, "{}", name)
    }
}

/// Structural type of an IR value
///
/// Carries the shape and element-type metadata expressions and variables are
/// annotated with. Tensor rank, dtype, and shape may each be independently
/// unknown; a fully known tensor has all three populated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StructuralType {
    /// A tensor with optionally unknown rank, dtype, and shape
    Tensor {
        ndim: Option<usize>,
        dtype: Option<DType>,
        shape: Option<Vec<i64>>,
    },
    /// A tuple of values, nested arbitrarily
    Tuple(Vec<StructuralType>),
    /// A shape value (list of dimensions); not differentiable
    Shape,
    /// A primitive scalar value; not differentiable
    Prim(DType),
}

impl StructuralType {
    /// A tensor type with fully known shape and dtype
    pub fn tensor(shape: impl Into<Vec<i64>>, dtype: DType) -> Self {
        let shape = shape.into();
        StructuralType::Tensor {
            ndim: Some(shape.len()),
            dtype: Some(dtype),
            shape: Some(shape),
        }
    }

    /// A zero-dimensional tensor type
    pub fn scalar(dtype: DType) -> Self {
        StructuralType::tensor(Vec::new(), dtype)
    }

    /// A tuple type over the given field types
    pub fn tuple(fields: Vec<StructuralType>) -> Self {
        StructuralType::Tuple(fields)
    }

    /// True when this is a tensor type of known rank zero
    pub fn is_scalar_tensor(&self) -> bool {
        match self {
            StructuralType::Tensor { ndim, shape, .. } => {
                *ndim == Some(0) || matches!(shape, Some(s) if s.is_empty())
            }
            _ => false,
        }
    }

    /// True when this type admits an adjoint: a tensor, or a tuple all of
    /// whose fields recursively admit adjoints
    pub fn is_nested_tensor(&self) -> bool {
        match self {
            StructuralType::Tensor { .. } => true,
            StructuralType::Tuple(fields) => fields.iter().all(StructuralType::is_nested_tensor),
            StructuralType::Shape | StructuralType::Prim(_) => false,
        }
    }

    /// Shape and dtype of a tensor type, when both are known
    pub fn tensor_spec(&self) -> Option<(&[i64], DType)> {
        match self {
            StructuralType::Tensor {
                dtype: Some(dtype),
                shape: Some(shape),
                ..
            } => Some((shape.as_slice(), *dtype)),
            _ => None,
        }
    }
}

impl fmt::Display for StructuralType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StructuralType::Tensor { ndim, dtype, shape } => {
                write!(f, "Tensor(")?;
                match shape {
                    Some(dims) => {
                        write!(f, "(")?;
                        for (i, d) in dims.iter().enumerate() {
                            if i > 0 {
                                write!(f, ", ")?;
                            }
                            write!(f, "{}", d)?;
                        }
                        write!(f, ")")?;
                    }
                    None => match ndim {
                        Some(n) => write!(f, "ndim={}", n)?,
                        None => write!(f, "?")?,
                    },
                }
                match dtype {
                    Some(dt) => write!(f, ", {})", dt),
                    None => write!(f, ", ?)"),
                }
            }
            StructuralType::Tuple(fields) => {
                write!(f, "(")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", field)?;
                }
                write!(f, ")")
            }
            StructuralType::Shape => write!(f, "Shape"),
            StructuralType::Prim(dt) => write!(f, "Prim({})", dt),
        }
    }
}
