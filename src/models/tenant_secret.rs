//! Tenant secret entity model
//!
//! SeaORM entity for the tenant_secrets table, a per-tenant key/value store
//! holding encrypted connector credentials.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;

/// Encrypted secret owned by a tenant
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "tenant_secrets")]
pub struct Model {
    /// Owning tenant (first half of the composite key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub tenant_id: Uuid,

    /// Secret name, e.g. `hubspot.oauth_token`
    #[sea_orm(primary_key, auto_increment = false)]
    pub secret_key: String,

    /// AES-256-GCM payload (version byte, nonce, ciphertext and tag)
    pub value_ciphertext: Vec<u8>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
