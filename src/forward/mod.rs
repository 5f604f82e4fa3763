//! Forwarders - batch report sinks
//!
//! Two sinks consume batch reports off the event bus: [`WebForwarder`]
//! POSTs them to the dashboard HTTP API, [`RedisForwarder`] writes the
//! shared Redis schema directly. Which one runs is decided by
//! `FORWARDER_MODE` (`auto` prefers Redis when a URL is configured). The
//! sinks are not ordered relative to each other; each preserves its own
//! FIFO.

pub mod redis;
pub mod schema;
pub mod web;

pub use self::redis::{RedisForwardError, RedisForwarder};
pub use web::WebForwarder;
