//! Symbolic backward-reachability engine for weak memory models.
//!
//! The data model (`zstar`, `constraint`), the subsumption container
//! (`container`), the variant-agnostic fixpoint (`reachability`) and the
//! constraint variants: `sb` (Single Buffer), `pdual` (per-process
//! channels), `pb` (predicate-abstracted bounded TSO, refined by
//! `cegar`) and `vips` (explicit-state forward VIPS-M).

pub mod cegar;
pub mod constraint;
pub mod container;
pub mod errors;
pub mod pb;
pub mod pdual;
pub mod reachability;
pub mod sb;
pub mod trace;
pub mod vips;
pub mod zstar;

pub use cegar::{pb_cegar, CegarOptions, CegarOutcome};
pub use constraint::Constraint;
pub use errors::EngineError;
pub use reachability::{reachability, ReachResult, SearchStats};
pub use trace::Trace;
