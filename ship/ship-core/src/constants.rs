//! Protocol timing constants.
//!
//! Values follow the SHIP specification tables; every handshake state arms a
//! timer from here and a firing timer is a protocol failure for that state.

use std::time::Duration;

/// Timeout for the connection mode initialisation exchange (SHIP 13.4.3).
pub const CMI_TIMEOUT: Duration = Duration::from_secs(10);

/// Initial trust window announced in a pending hello (SHIP 13.4.4.1.3).
pub const T_HELLO_INIT: Duration = Duration::from_secs(60);

/// Upper bound on the total hello wait across prolongations.
pub const T_HELLO_PROLONG_MAX: Duration = Duration::from_secs(420);

/// Timeout for every post-hello handshake step (protocol, pin, access methods).
pub const HANDSHAKE_STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for a single websocket write.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between keepalive pings in the data phase (SHIP 4.2).
pub const PING_INTERVAL: Duration = Duration::from_secs(50);

/// How long a missing pong is tolerated before the connection is dropped.
pub const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum accepted frame size during the handshake phase (SHIP 9.2).
pub const MAX_HANDSHAKE_MESSAGE_SIZE: usize = 1024;

/// The websocket path every SHIP endpoint serves.
pub const SHIP_PATH: &str = "/ship/";

/// The websocket subprotocol both sides must offer.
pub const SHIP_SUBPROTOCOL: &str = "ship";

#[cfg(test)]
mod tests {
    use super::*;

    /// Pings have to fit inside the pong tolerance, otherwise a healthy
    /// connection would be dropped between two pings.
    #[test]
    fn ping_interval_shorter_than_pong_timeout() {
        assert!(PING_INTERVAL < PONG_TIMEOUT);
    }

    /// The prolonged hello window must extend the initial one.
    #[test]
    fn hello_windows_sanity_check() {
        assert!(T_HELLO_INIT < T_HELLO_PROLONG_MAX);
    }
}
