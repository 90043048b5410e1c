//! Node discovery over UDP broadcast.
//!
//! The master side periodically broadcasts an announcement datagram on each
//! accepted interface ([`Announcer`]); the slave side listens on each
//! accepted interface, maintains a per-announcer address table with
//! staleness eviction ([`RemoteLocator`]) and emits server-set-changed
//! events ([`Listener`]).

mod announce;
mod listen;
mod locator;

pub use announce::Announcer;
pub use listen::Listener;
pub use locator::RemoteLocator;
