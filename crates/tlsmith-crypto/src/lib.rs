#![forbid(unsafe_code)]
#![doc = "Narrow cryptographic provider interface for the tlsmith protocol engine."]

pub mod hkdf;
pub mod provider;
pub mod rust_crypto;
pub mod suite;

pub use provider::{AeadAlgorithm, CryptoProvider, HashAlgorithm};
pub use rust_crypto::RustCryptoProvider;
pub use suite::CipherSuiteParams;
