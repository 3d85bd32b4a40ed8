//! Cross-cutting plumbing shared by Quest services and workers:
//! env-based config, tracing setup, health probes and best-effort effects.

pub mod config;
pub mod effect;
pub mod health;
pub mod serde;
pub mod tracing;
