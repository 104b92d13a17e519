//! Volley Storage - Database persistence for the delivery engine
//!
//! This crate provides the PostgreSQL-backed stores for campaigns,
//! recipients, the append-only delivery event log, and the
//! suppression list.

pub mod db;
pub mod models;
pub mod repository;

pub use db::DatabasePool;
pub use models::*;
pub use repository::*;
