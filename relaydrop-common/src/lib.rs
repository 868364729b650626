//! RelayDrop Common Library
//!
//! Wire protocol, chunk framing and validators shared by the relay server and
//! the command-line client.

pub mod chunk;
pub mod hash;
pub mod protocol;
pub mod time;
pub mod validators;

use std::time::Duration;

/// Default TCP port of a relay
pub const DEFAULT_RELAY_PORT: u16 = 7600;

/// Default relay port as a string for CLI defaults and hints
pub const DEFAULT_RELAY_PORT_STR: &str = "7600";

/// Sessions with no activity for this long are evicted by the relay
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// How often the relay sweeps for idle sessions
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Path requested during the WebSocket upgrade
pub const RELAY_PATH: &str = "/transfer";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_relay_port_str_matches() {
        assert_eq!(DEFAULT_RELAY_PORT_STR, DEFAULT_RELAY_PORT.to_string());
    }

    #[test]
    fn test_sweep_cadence_shorter_than_timeout() {
        assert!(DEFAULT_SWEEP_INTERVAL < DEFAULT_IDLE_TIMEOUT);
        assert_eq!(DEFAULT_IDLE_TIMEOUT.as_secs(), 1800);
    }
}
