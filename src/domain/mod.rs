// Domain module - Core business types and logic
pub mod config;
pub mod error;
