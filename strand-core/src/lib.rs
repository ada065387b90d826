//! Strand Core
//!
//! This crate provides a reactive-value runtime paired with a cooperative
//! task scheduler. It implements:
//!
//! - Observable cells with version stamps (`Value`, `ConstSource`)
//! - Derived cells, sync and async, with lazy/active evaluation
//!   (`TransformValue`, `TransformValueAsync`, `Tuple`)
//! - Dependency-scoped disposal (`ValuesContainer`)
//! - Cooperative tasks with pause/stop, weighted progress, and suspension
//!   points (`Scheduler`, `TaskHandle`, `TaskController`)
//! - Typed work pipelines (`WorkBuilder`)
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: observable cells, derivations, and container scopes
//! - `graph`: the directional dependency graph behind disposal ordering
//! - `scheduler`: rounds, suspension points, progress, pause/stop
//! - `work`: sequencing and forking combinators over tasks
//!
//! # Example
//!
//! ```rust,ignore
//! use strand_core::reactive::ValuesContainer;
//!
//! let scope = ValuesContainer::root("app");
//! let count = scope.value("count", 0);
//! let doubled = scope.transformed("doubled", count.as_source(), |c: i32| c * 2);
//!
//! count.set(5);
//! assert_eq!(doubled.get(), 10);
//! ```

pub mod error;
pub mod graph;
pub mod reactive;
pub mod scheduler;
pub mod work;

pub use error::{ReactiveError, TaskError};
pub use reactive::{
    Disconnector, Disposable, ProxyValue, SharedSource, Source, TransformValue,
    TransformValueAsync, Tuple, Value, ValueBuilder, ValuesContainer,
};
pub use scheduler::{
    instant_timer, tokio_event_loop, EventLoop, Scheduler, TaskController, TaskHandle, TaskStatus,
    Timer,
};
pub use work::{begin, Work, WorkBuilder};
