use rand::RngCore;
use std::fmt::{Display, Formatter};

/// Sequence number of an outbound packet within one connection.
///
/// Sequence numbers live in a modular space of width 32: they wrap around, and
/// 'less than or equal' is defined relative to the half of the space that
/// follows a given value. Naive unsigned comparison is wrong near the wrap
/// boundary.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SequenceNumber(u32);

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceNumber {
    const HALF_RANGE: u32 = 1 << 31;

    /// Initial value for a new connection, chosen pseudo-randomly.
    pub fn random() -> SequenceNumber {
        SequenceNumber(rand::thread_rng().next_u32())
    }

    pub fn from_raw(value: u32) -> SequenceNumber {
        SequenceNumber(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_add(1))
    }

    /// Modular cumulative-ack comparison: `self <= ack` iff the distance from
    /// `self` up to `ack` lies in the lower half of the sequence space.
    pub fn is_covered_by(&self, ack: SequenceNumber) -> bool {
        ack.0.wrapping_sub(self.0) < Self::HALF_RANGE
    }
}
