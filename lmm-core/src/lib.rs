//! lmm-core: eigen-rotated linear mixed model engine for GWAS.
//!
//! The kinship matrix is decomposed once per chromosome; covariates,
//! phenotypes and markers are rotated into its eigenbasis, after which every
//! likelihood evaluation works on small quadratic forms. Heritability is
//! selected per phenotype by a grid-plus-golden-section search and each
//! marker is tested with a 1-df likelihood-ratio test.

pub mod assoc;
pub mod eigen;
pub mod error;
pub mod kinship;
pub mod likelihood;
pub mod model;
pub mod quadratic;
pub mod search;
pub mod spectrum;

pub use assoc::{AssocConfig, AssocResults, AssociationDriver, StopSignal, TestFailure, TestRecord};
pub use eigen::{EigenDecomposition, KinshipEigen, Rotation};
pub use error::{LmmError, LmmResult};
pub use likelihood::{LikelihoodEvaluator, LikelihoodObjective, ModelFit};
pub use search::H2SearchConfig;
pub use spectrum::{Ridge, ShiftedSpectrum};
