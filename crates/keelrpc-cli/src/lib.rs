//! # keelrpc CLI
//!
//! Command-line entry points for keelrpc:
//!
//! - `keelrpc directory`: run the directory server shared by servers and callers
//! - `keelrpc serve`: run a server publishing the built-in echo service
//! - `keelrpc call`: send one request and print the JSON result
//!
//! Argument parsing lives in the binary; the work each subcommand does is
//! here so it can be tested without spawning processes.

pub mod call;
pub mod directory;
pub mod serve;
