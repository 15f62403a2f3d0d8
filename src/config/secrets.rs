//! Secret handling re-exports.

pub use secrecy::{ExposeSecret, SecretString};
