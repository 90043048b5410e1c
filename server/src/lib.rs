//! # Master Role Library
//!
//! The master is the machine the human player sits at. It announces itself
//! on every accepted network interface, admits slave machines that register
//! over RPC, and brokers outbound command batches to each of them.
//!
//! ## Core Responsibilities
//!
//! ### Presence Announcement
//! A UDP broadcaster advertises this process (address + random node id) on
//! each interface so slaves on the same segments can find it without any
//! static configuration.
//!
//! ### Client Admission
//! Slaves register over RPC with their id, their RPC port and every address
//! they are reachable at. Admission is delegated to the injected
//! [`gamemesh_shared::service::ServerService`]; an admitted client gets its
//! own broker, peer and (optionally) keep-alive ping.
//!
//! ### Outbound Brokering
//! Command batches to a client flow through that client's broker, which
//! preserves FIFO order on the async path and serializes blocking sends
//! against queued work.
//!
//! ## Module Organization
//!
//! - [`master`]: the facade wiring interface discovery, the announcer, the
//!   RPC listener node and the registry together, plus the inbound request
//!   handler.
//! - [`registry`]: the per-client broker table with admission, refresh and
//!   failure eviction.

pub mod master;
pub mod registry;
