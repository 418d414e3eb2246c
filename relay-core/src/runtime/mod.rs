//! Runtime layer for Relay.
//!
//! The dispatcher sits between callers and providers. It is responsible for:
//! - Routing each request to an endpoint
//! - Reserving token budget before a request joins a batch
//! - Scheduling batch flushes and executing them
//! - Feeding call outcomes back into load balancing and circuit breaking

pub mod dispatcher;
pub mod submission;

pub use dispatcher::{Dispatcher, DispatcherBuilder, DispatcherConfig, EndpointBuilder};
pub use submission::Submission;
