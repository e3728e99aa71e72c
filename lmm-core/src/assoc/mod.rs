//! Genome-wide association: null fits, per-marker likelihood-ratio tests and
//! the result table.

pub mod driver;
pub mod record;

pub use driver::{test_batch, AssocConfig, AssociationDriver, ChromosomeState, RotatedBatch, StopSignal};
pub use record::{write_result_line, write_results_header, AssocResults, TestFailure, TestRecord};
