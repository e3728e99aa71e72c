//! lmm-linalg: Linear algebra wrappers for the LMM association engine.
//!
//! Provides the dense matrix type and the symmetric eigendecomposition
//! shared by kinship decomposition and the small per-test solves.

pub mod dense;
pub mod decomposition;

pub use decomposition::{LinalgError, SymmetricEigen};
pub use dense::DenseMatrix;
