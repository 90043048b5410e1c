//! Immutable network configuration, passed in at construction.

use std::net::Ipv4Addr;
use std::time::Duration;

/// Configuration surface for the discovery and broker subsystem.
///
/// A value is built once and handed to each component at construction;
/// nothing reads mutable global state.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// UDP port announcements are broadcast to and listened on.
    pub discovery_port: u16,
    /// TCP port the master's RPC listeners bind.
    pub server_rpc_port: u16,
    /// TCP port the first slave instance binds; instance `k` uses
    /// `first_client_rpc_port + k`.
    pub first_client_rpc_port: u16,
    /// When enabled the master pings each slave and the slave arms a
    /// watchdog expecting that traffic.
    pub keep_alive_ping: bool,
    /// Interfaces the master role accepts; empty means all.
    pub server_nif_allowlist: Vec<Ipv4Addr>,
    /// Interfaces the slave role accepts; empty means all.
    pub client_nif_allowlist: Vec<Ipv4Addr>,

    /// Period between interface enumeration polls.
    pub nif_poll_interval: Duration,
    /// Period between announcement broadcasts.
    pub announce_interval: Duration,
    /// Age after which a discovered address is evicted; also the sweep
    /// period of the staleness sweeper.
    pub server_lost_timeout: Duration,
    /// Per-attempt TCP connect timeout.
    pub connect_timeout: Duration,
    /// Per-call request/response timeout.
    pub call_timeout: Duration,
    /// Bound on waiting for a peer's exclusive lock.
    pub lock_timeout: Duration,
    /// Bound on waiting for the broker queue to drain before a blocking call.
    pub drain_timeout: Duration,
    /// Period between keep-alive pings.
    pub ping_period: Duration,
    /// Extra allowance on top of `ping_period + connect_timeout` before the
    /// watchdog declares the master lost.
    pub watchdog_slack: Duration,
    /// Consecutive send/receive errors tolerated on one interface before the
    /// circuit breaker drops it. Shared by the broadcaster and listener.
    pub max_consecutive_errors: u32,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            discovery_port: 47_800,
            server_rpc_port: 47_801,
            first_client_rpc_port: 47_810,
            keep_alive_ping: true,
            server_nif_allowlist: Vec::new(),
            client_nif_allowlist: Vec::new(),
            nif_poll_interval: Duration::from_secs(5),
            announce_interval: Duration::from_secs(1),
            server_lost_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            call_timeout: Duration::from_secs(5),
            lock_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(10),
            ping_period: Duration::from_secs(2),
            watchdog_slack: Duration::from_secs(1),
            max_consecutive_errors: 5,
        }
    }
}

impl NetConfig {
    /// Silence the watchdog tolerates before firing:
    /// one missed ping plus a full connect attempt plus slack.
    pub fn watchdog_deadline(&self) -> Duration {
        self.ping_period + self.connect_timeout + self.watchdog_slack
    }
}
