//! Command-line front end of salve.
pub mod commands;
