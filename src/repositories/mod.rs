//! # Repository Layer
//!
//! Repository implementations that encapsulate SeaORM operations behind
//! tenant-aware methods.

pub mod secret_store;

pub use secret_store::{SecretStore, SecretStoreError};
