//! Application layer with consumers of the image engine.

/// Application services.
pub mod services;

pub use services::{Cancellable, OperationRegistry};
