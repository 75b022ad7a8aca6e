//! # HSU Name Server
//!
//! Name server / service registry broker for the HSU framework.
//!
//! This crate provides:
//! - In-memory registry storage behind a single lock
//! - A newline-delimited JSON request/reply protocol (REGISTER, UNREGISTER,
//!   LOOKUP, LIST, PING, SHUTDOWN)
//! - Best-effort publishing of registry-change events to subscribers
//! - A server lifecycle with one background worker and idempotent stop
//! - Transport abstractions (TCP, Unix Domain Sockets)
//! - An async client and event subscriber

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod protocol;
pub mod publisher;
pub mod server;
pub mod state;
pub mod storage;
pub mod transport;
pub mod types;

// Re-export commonly used items
pub use client::{EventSubscriber, NameServerClient};
pub use config::NameServerConfig;
pub use dispatcher::RequestDispatcher;
pub use protocol::{Request, Response, Status};
pub use publisher::EventPublisher;
pub use server::{NameServer, ServerOptions};
pub use state::ServerState;
pub use storage::RegistryStore;
pub use transport::TransportAddress;
pub use types::{Endpoint, Event, EventType};
