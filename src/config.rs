use anyhow::bail;
use std::time::Duration;

/// Configuration shared by a multiplexer and all connections on it.
pub struct RudpConfig {
    /// Interval between retransmissions of an unacknowledged packet. Every
    ///  packet that goes through the transmit queue (handshakes and data) is
    ///  re-sent at this interval until its sequence number is covered by an
    ///  incoming cumulative ack.
    ///
    /// Choosing this value well below the path RTT wastes bandwidth on
    ///  spurious retransmits; choosing it far above the RTT adds latency to
    ///  loss recovery.
    pub retransmit_interval: Duration,

    /// Upper bound for one active connect attempt. A handshake that is never
    ///  answered keeps retransmitting until this deadline, then the attempt is
    ///  torn down and the next resolved endpoint (if any) is tried.
    pub connect_timeout: Duration,

    /// Size of the receive loop's datagram buffer. Inbound datagrams larger
    ///  than this are truncated by the operating system, so this must be at
    ///  least the largest payload a peer will send plus the packet header.
    pub recv_buffer_size: usize,

    /// Accept filter applied to inbound DATA sequence numbers.
    pub sequence_filter: SequenceFilter,
}

impl Default for RudpConfig {
    fn default() -> RudpConfig {
        RudpConfig {
            retransmit_interval: Duration::from_millis(1000),
            connect_timeout: Duration::from_secs(10),
            recv_buffer_size: 64 * 1024,
            sequence_filter: SequenceFilter::StrictNext,
        }
    }
}

impl RudpConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retransmit_interval.is_zero() {
            bail!("retransmit interval must be non-zero");
        }
        if self.connect_timeout.is_zero() {
            bail!("connect timeout must be non-zero");
        }
        if self.recv_buffer_size < 576 {
            bail!("receive buffer is too small to hold a minimal UDP datagram");
        }
        Ok(())
    }
}

/// Which inbound DATA sequence numbers a connection accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SequenceFilter {
    /// Accept only the direct successor of the last accepted sequence; drop
    ///  everything else. Correct under no-loss, no-reorder delivery.
    #[default]
    StrictNext,
    /// Accept any sequence newer (in modular order) than the last accepted
    ///  one, skipping over losses. This is the hook for relaxing the strict
    ///  filter; gap buffering for in-order delivery would layer on top of it.
    AnyNewer,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::default_is_valid(Duration::from_millis(1000), Duration::from_secs(10), 64 * 1024, true)]
    #[case::zero_retransmit(Duration::ZERO, Duration::from_secs(10), 64 * 1024, false)]
    #[case::zero_connect_timeout(Duration::from_millis(1000), Duration::ZERO, 64 * 1024, false)]
    #[case::tiny_recv_buffer(Duration::from_millis(1000), Duration::from_secs(10), 128, false)]
    #[case::minimal_recv_buffer(Duration::from_millis(1000), Duration::from_secs(10), 576, true)]
    fn test_validate(
        #[case] retransmit_interval: Duration,
        #[case] connect_timeout: Duration,
        #[case] recv_buffer_size: usize,
        #[case] expected_ok: bool,
    ) {
        let config = RudpConfig {
            retransmit_interval,
            connect_timeout,
            recv_buffer_size,
            sequence_filter: SequenceFilter::StrictNext,
        };
        assert_eq!(config.validate().is_ok(), expected_ok);
    }
}
