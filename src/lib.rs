//! webimage - asynchronous web image loading with a two-tier cache.
//!
//! This crate fetches images over HTTP, keeps decoded images in a cost-bounded memory
//! cache and encoded bytes in a disk cache, and deduplicates concurrent downloads of the
//! same URL behind one prioritised scheduler.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Application layer containing consumers of the engine.
pub mod application;
/// Domain layer containing entities, errors, and port definitions.
pub mod domain;
/// Infrastructure layer containing the engine and its configuration.
pub mod infrastructure;

/// Current version of the application.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name.
pub const NAME: &str = "webimage";
