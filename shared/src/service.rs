//! Application boundary.
//!
//! The mesh never interprets commands itself; it hands them to whichever
//! service the embedding application injected at construction. No global
//! registry exists: a node that wants a service holds a reference to it.

use crate::command::{CallBatch, CommandResults};
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// Implemented by the application on the master machine.
pub trait ServerService: Send + Sync + 'static {
    /// A client asks to join. Returning `false` refuses it; the client sees
    /// a rejected registration and gives up on this server instance.
    fn register_client(&self, client_id: u64, addresses: HashMap<Ipv4Addr, Ipv4Addr>) -> bool;

    /// A client announced it is leaving.
    fn unregister_client(&self, client_id: u64);

    /// A registered client sent a command batch. `None` results mean the
    /// batch carried no sync command or its execution failed.
    fn commands_from_client(&self, client_id: u64, batch: &CallBatch) -> Option<CommandResults>;
}

/// Implemented by the application on each slave machine.
pub trait ClientService: Send + Sync + 'static {
    /// The server sent a command batch.
    fn commands_from_server(&self, batch: &CallBatch) -> Option<CommandResults>;
}
