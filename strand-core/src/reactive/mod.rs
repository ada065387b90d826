//! Reactive Value Runtime
//!
//! Observable cells with version stamps, derived cells (sync and async),
//! tuple joins, and container-scoped disposal.
//!
//! Construction is bottom-up: values first, derivations over them, tuples
//! over both. Teardown runs in the opposite direction, ordered by the
//! owning [`ValuesContainer`]'s dependency graph.

mod container;
mod proxy;
mod source;
mod transform;
mod transform_async;
mod tuple;
mod value;

pub use container::{Signal, ValuesContainer};
pub use proxy::{ProxyValue, Puller, SignalConnector};
pub use source::{
    callback, ChangeCallback, ConstSource, Disconnector, Disposable, Disposer, EqPredicate,
    Setter, SharedSource, Source,
};
pub use transform::TransformValue;
pub use transform_async::TransformValueAsync;
pub use tuple::Tuple;
pub use value::{Value, ValueBuilder};
