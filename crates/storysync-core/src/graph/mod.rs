//! Dependency relations between entities and between epics.
//!
//! ## Submodules
//!
//! - [`dependency`]: relation types, the [`DependencyGraph`] and
//!   topological ordering.
//! - [`cycles`]: three-color DFS cycle detection.

pub mod cycles;
pub mod dependency;

pub use cycles::Cycle;
pub use dependency::{Dependency, DependencyGraph, DependencyType, GraphError};
