//! keelrpc provider side.
//!
//! A [`Service`] is an identity plus a table of operations. Services are
//! added to a [`ServiceProvider`], published to the directory under the
//! server's advertised endpoint, and served by [`RpcServer`], which hands
//! each decoded request to the [`RequestDispatcher`].

pub mod config;
pub mod dispatcher;
pub mod provider;
pub mod server;
pub mod service;

pub use config::{ServerConfig, ADVERTISE_ADDR_ENV};
pub use dispatcher::RequestDispatcher;
pub use provider::ServiceProvider;
pub use server::{serve_connection, ConnectionContext, RpcServer};
pub use service::{Operation, Service};
