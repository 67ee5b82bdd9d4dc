//! Plumbing shared by the concrete node types.
//!
//! Listening nodes (publisher, responder, service queue) wrap a
//! [`Server`]; connecting nodes (subscriber, requester, service queue
//! reader and writer) wrap a [`Client`]. Both own their connections and
//! release them on `close`/`disconnect` or when dropped.

mod client;
mod server;

pub(crate) use client::Client;
pub(crate) use server::{Server, ServerBehavior};
