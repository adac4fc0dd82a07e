//! Shared utilities

pub mod clock;
