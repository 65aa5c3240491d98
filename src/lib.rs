//! A connection-oriented, message-preserving transport layered over UDP.
//!
//! Two peers perform a handshake and then exchange discrete messages: one send
//!  on one side matches one receive on the other, with sequence-number
//!  tracking, acknowledgement piggybacking, retransmission on timeout, and an
//!  out-of-band keepalive to return acks when no data flows the other way.
//!
//! ## Design goals
//!
//! * The abstraction is a connected endpoint pair exchanging *messages*
//!    (defined-length chunks of data as opposed to streams of bytes)
//! * One bound UDP socket is shared by many logical connections - a
//!    multiplexer dispatches inbound datagrams by their source address
//! * Reliability through per-packet retransmit timers and cumulative acks:
//!    a send completes when the peer has acknowledged it, and until then the
//!    packet is re-sent at a fixed interval
//! * Acks ride on whatever flows anyway (handshake replies, data packets);
//!    a keepalive carries them when nothing else is outbound
//! * Explicitly *not* in scope: flow control, congestion control, path MTU
//!    discovery, payload fragmentation, reordering tolerance beyond the
//!    one-ahead accept filter, and encryption
//!
//! ## Connection establishment
//!
//! Active side (A) and passive side (B), three packets:
//!
//! ```ascii
//! A                                B (listening)
//! |  HANDSHAKE seq=a              >|  B answers and waits for the ack
//! |< HANDSHAKE seq=b ack=a         |
//! |  KEEPALIVE seq=a+1 ack=b      >|  both sides established
//! ```
//!
//! A's handshake retransmits until B's answer acks it; B's answer retransmits
//!  until A's keepalive acks it. Either side failing to hear back keeps
//!  retransmitting until the connect timeout tears the attempt down.
//!
//! ## Header
//!
//! Packet header - all numbers in network byte order (BE):
//! ```ascii
//! 0: packet kind (u8): 0 HANDSHAKE, 1 KEEPALIVE, 2 DATA
//! 1: flags (u8):
//!    * bit 0: ack present
//!    * bits 1-7: unused, must be 0
//! 2: sequence number (u32): per-connection counter with wrap-around; the
//!     initial value is chosen pseudo-randomly per connection
//! 6: ack (u32): cumulative - acknowledges every sequence up to and including
//!     this value in modular order. Present only if the ack flag is set.
//! *: ack field (u16): reserved for a selective-ack bitmap, currently zero
//! *: payload: DATA packets only, the rest of the datagram
//! ```
//!
//! ## Related:
//! * TCP
//!   * byte-stream oriented, in-order delivery with head-of-line blocking
//!   * this protocol keeps message boundaries and has no stream semantics
//! * QUIC
//!   * connection based with version/crypto negotiation in the handshake
//!   * far richer loss recovery; this protocol is a deliberately small core

pub mod config;
pub mod connection;
pub mod error;
pub mod multiplexer;
pub mod packet_header;
pub mod resolver;
pub mod send_pipeline;
pub mod sequence_number;
mod transmit_queue;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
