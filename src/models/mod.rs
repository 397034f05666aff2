//! # Data Models
//!
//! SeaORM entities backing the secret store and the refresh lock.

pub mod refresh_lock;
pub mod tenant_secret;

pub use refresh_lock::Entity as RefreshLock;
pub use tenant_secret::Entity as TenantSecret;
