//! Shared error types for the salve workspace.
pub mod errors;
