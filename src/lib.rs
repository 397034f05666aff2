//! # Ingestion Library
//!
//! Core of the vendor ingestion workers: sliding-window search pagination,
//! per-tenant OAuth token refresh coordination, the encrypted secret store
//! and the HubSpot connector built on them.

pub mod config;
pub mod connectors;
pub mod crypto;
pub mod db;
pub mod error;
pub mod models;
pub mod pagination;
pub mod repositories;
pub mod retry;
pub mod telemetry;
pub mod token_refresh;
pub use migration;
