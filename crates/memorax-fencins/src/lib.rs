//! Fence insertion: candidate synchronizations, minimal coverage and
//! the counterexample-guided driver loop.

pub mod driver;
pub mod fencer;
pub mod min_coverage;
pub mod sync;

pub use driver::{fencins, FencinsOutcome, MinAspect};
pub use fencer::{tso_candidates, vips_candidates};
pub use sync::{apply_syncs, StateMap, Sync};
