//! # Slave Role Library
//!
//! This library provides the client-side implementation of the mesh. A slave
//! machine discovers the master through its UDP announcements, registers
//! with it over RPC and from then on works in both directions: it executes
//! command batches the master sends and brokers batches of its own back.
//!
//! ## Architecture Overview
//!
//! ### Discovery Driven
//! The slave holds no static server address. It listens for announcement
//! datagrams on every accepted interface, keeps a per-server address table
//! with staleness eviction, and rebuilds its link whenever the surviving
//! address set changes.
//!
//! ### Single Server Link
//! At most one server link is active. A server that restarts comes back
//! under a fresh random id; the slave blacklists the dead id and discards
//! its broker so stale announcements can never race the reconnect.
//!
//! ### Liveness Watchdog
//! When keep-alive is enabled the master pings periodically. The slave arms
//! a watchdog over all inbound and outbound traffic; on silence it drops
//! the connection and clears the cached server addresses, forcing a clean
//! rediscovery.
//!
//! ## Module Organization
//!
//! ### Slave Module (`slave`)
//! The facade plus the pieces behind it: the registration role handshake,
//! the server link state with its identity blacklist, and the inbound
//! request handler that feeds the injected
//! [`gamemesh_shared::service::ClientService`].

pub mod slave;
