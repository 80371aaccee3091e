//! The `utils` module provides the pieces shared by every other module:
//! error types, object ids and logging setup.

pub mod error;
pub mod ids;
pub mod logging;
