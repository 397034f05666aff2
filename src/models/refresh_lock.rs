//! Refresh lock entity model
//!
//! Lock rows used to serialize token refreshes on backends without
//! transaction-scoped advisory locks.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "refresh_locks")]
pub struct Model {
    /// Lock name, e.g. `<tenant>:token_refresh:hubspot`
    #[sea_orm(primary_key, auto_increment = false)]
    pub lock_key: String,

    /// Last time a refresh transaction took the lock
    pub acquired_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
