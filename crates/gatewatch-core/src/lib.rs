//! # gatewatch-core - Core Types
//!
//! Foundation crate for gatewatch. Provides the error taxonomy shared by the
//! gateway client and the CLI, plus logging bootstrap.
//!
//! This crate has **zero internal dependencies** -- it only depends on external
//! crates (thiserror, serde_json, tracing).
//!
//! ## Public API
//!
//! ### Error Handling (`error`)
//! - [`Error`] - Custom error enum with `fatal` vs `recoverable` classification
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//!
//! ### Logging (`logging`)
//! - [`logging::init()`] - Install the `tracing` subscriber described by a
//!   [`logging::LogConfig`]
//!
//! ## Prelude
//!
//! Import commonly used types with:
//! ```rust
//! use gatewatch_core::prelude::*;
//! ```

pub mod error;
pub mod logging;

/// Prelude for common imports used throughout all gatewatch crates
pub mod prelude {
    pub use super::error::{Error, Result};
    pub use tracing::{debug, error, info, trace, warn};
}

// Re-export commonly used types at crate root for convenience
pub use error::{Error, Result};
