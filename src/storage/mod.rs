//! Storage Module
//!
//! Local file bytes and the persisted fingerprint index.

pub mod index;
mod local;

pub use local::{LocalStore, MergeOutcome};
