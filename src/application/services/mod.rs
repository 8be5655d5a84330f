//! Caller-facing services built on the imaging infrastructure.

/// Cancels superseded loads per UI element.
pub mod operation_registry;

pub use operation_registry::{Cancellable, OperationRegistry};
