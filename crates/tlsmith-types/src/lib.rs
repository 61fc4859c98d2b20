#![forbid(unsafe_code)]
#![doc = "Shared identifiers and the error taxonomy for the tlsmith protocol engine."]

pub mod algorithm;
pub mod error;

pub use algorithm::*;
pub use error::*;
