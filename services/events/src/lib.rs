pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod schema;
pub mod state;
pub mod usecase;
