//! Domain types shared by every Quest service that emits or consumes events.
//!
//! This crate contains only pure types with no framework dependencies.
//! Services map their storage rows onto these types at the infra boundary.

pub mod id;
pub mod topic;
