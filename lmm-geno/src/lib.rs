//! lmm-geno: Data providers for the LMM association engine.
//!
//! Provides the `MarkerReader` trait with an in-memory implementation,
//! a loader for whitespace-delimited dosage tables, and the
//! phenotype/covariate table parser.

pub mod dosage;
pub mod memory;
pub mod phenotype;
pub mod traits;

pub use memory::InMemoryMarkers;
pub use phenotype::PhenotypeTable;
pub use traits::{MarkerInfo, MarkerReader};
