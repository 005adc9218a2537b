pub mod api;
pub mod columns;
pub mod config;
pub mod error;
pub mod http;
pub mod mid;
pub mod participant;
pub mod split;
pub mod summary;
pub mod types;
