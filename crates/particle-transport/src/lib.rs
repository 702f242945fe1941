//! Connection-layer boundary for the particle node.
//!
//! The execution pipeline only depends on the dispatch/completion channel,
//! the peer resolver, and connection events defined in this crate. Concrete
//! transports plug in through [`adapter::TransportAdapter`].

pub mod adapter;
pub mod dispatch;
pub mod events;
pub mod routing;
