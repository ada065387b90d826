//! Dependency Graph
//!
//! A generic directed graph consumed by the values container to track
//! disposal dependencies between reactive values.
//!
//! The container relies on three properties:
//!
//! 1. `ordered_all` returns descendants before ancestors, so derived values
//!    are disposed before the sources they were computed from.
//! 2. `find_cycle` detects cyclic bindings at bind time, so a bad wiring is
//!    rejected immediately instead of deadlocking disposal later.
//! 3. Node removal also removes every edge touching the node.

mod directional;

pub use directional::{DirectionalGraph, Links};
