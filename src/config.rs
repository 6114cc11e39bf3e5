use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3479;
const DEFAULT_PING_INTERVAL_SECS: u64 = 30;
const DEFAULT_PONG_TIMEOUT_SECS: u64 = 10;
const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub listen_addr: SocketAddr,
    /// Keepalive ping period per connection
    pub ping_interval: Duration,
    /// A connection that doesn't answer a ping within this is closed
    pub pong_timeout: Duration,
    /// How long shutdown waits for connections to close
    pub drain_timeout: Duration,
    /// Send an `error` back when a targeted relay can't be delivered
    pub notify_undelivered: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
            pong_timeout: Duration::from_secs(DEFAULT_PONG_TIMEOUT_SECS),
            drain_timeout: Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS),
            notify_undelivered: false,
        }
    }
}

impl HubConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Missing or unparseable
    /// values keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let port = lookup("RENDEZVOUS_PORT")
            .and_then(|raw| raw.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);

        let ip = lookup("RENDEZVOUS_ADDR")
            .and_then(|raw| raw.parse::<IpAddr>().ok())
            .unwrap_or(defaults.listen_addr.ip());

        // tokio intervals need a non-zero period
        let secs = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|raw| raw.parse::<u64>().ok())
                .filter(|&secs| secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        let notify_undelivered = lookup("RENDEZVOUS_NOTIFY_UNDELIVERED")
            .and_then(|raw| match raw.to_lowercase().as_str() {
                "1" | "true" | "yes" => Some(true),
                "0" | "false" | "no" => Some(false),
                _ => None,
            })
            .unwrap_or(defaults.notify_undelivered);

        Self {
            listen_addr: SocketAddr::new(ip, port),
            ping_interval: secs("RENDEZVOUS_PING_SECS", defaults.ping_interval),
            pong_timeout: secs("RENDEZVOUS_PONG_TIMEOUT_SECS", defaults.pong_timeout),
            drain_timeout: secs("RENDEZVOUS_DRAIN_SECS", defaults.drain_timeout),
            notify_undelivered,
        }
    }
}
