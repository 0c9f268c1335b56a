//! The `utils` module provides the pieces every other layer leans on:
//! the `BusError` taxonomy and logging initialization.

pub mod error;
pub mod logging;

pub use error::{BusError, Result};
