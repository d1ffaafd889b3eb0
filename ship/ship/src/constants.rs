use std::time::Duration;

/// Delay ranges in seconds for connection attempts, indexed by the per-SKI
/// attempt counter. The hub draws uniformly within the selected range.
pub(crate) const CONNECTION_INITIATION_DELAY_RANGES: [(u64, u64); 3] =
    [(0, 10), (10, 20), (120, 300)];

/// The timeout on establishing TCP + TLS + websocket for an outbound dial.
pub(crate) const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// The timeout on the TLS + websocket upgrade of an inbound socket.
pub(crate) const ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long hub shutdown waits for every connection to report terminal.
pub(crate) const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[cfg(test)]
mod tests {
    use super::*;

    /// The delay ranges must be sorted and non overlapping, otherwise a
    /// later attempt could fire earlier than a first one.
    #[test]
    fn delay_ranges_are_increasing() {
        for window in CONNECTION_INITIATION_DELAY_RANGES.windows(2) {
            assert!(window[0].0 <= window[0].1);
            assert!(window[0].1 <= window[1].0);
        }
    }
}
