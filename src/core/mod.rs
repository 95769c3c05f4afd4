pub mod domain;
pub mod error;
pub mod ports;

pub use error::{EngineError, Result};
