//! Keel CI Core
//!
//! Core domain types, traits, and error handling for Keel CI: the resolved
//! stage model, the predicate evaluator and the config resolver. This crate
//! has minimal dependencies and defines the shared vocabulary used across
//! all other crates.

pub mod artifact;
pub mod error;
pub mod events;
pub mod ids;
pub mod pipeline;
pub mod ports;
pub mod predicate;
pub mod resolver;
pub mod run;
pub mod stage;
pub mod worker;

pub use error::{Error, Result};
pub use ids::*;
