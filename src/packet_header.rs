use crate::sequence_number::SequenceNumber;
use anyhow::bail;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::Debug;

/// Wire tag of a packet. The numeric values are part of the wire format.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PacketKind {
    Handshake = 0,
    Keepalive = 1,
    Data = 2,
}

/// Fixed packet header, network byte order:
///
/// ```ascii
/// 0: packet kind (u8)
/// 1: flags (u8) - bit 0: ack present
/// 2: sequence number (u32 BE)
/// 6: ack (u32 BE) - present only if the ack flag is set
/// *: ack field (u16 BE) - reserved, written as zero
/// *: payload - DATA packets only, rest of the datagram
/// ```
#[derive(Clone, Eq, PartialEq)]
pub struct PacketHeader {
    pub packet_kind: PacketKind,
    pub sequence: SequenceNumber,
    pub ack: Option<SequenceNumber>,
    /// reserved for a future selective-ack bitmap, currently always zero
    pub ack_field: u16,
}

impl Debug for PacketHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ack = self
            .ack
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string());
        write!(f, "PCKT{{{:?}@{}:ack {}}}", self.packet_kind, self.sequence, ack)
    }
}

impl PacketHeader {
    const FLAG_ACK_PRESENT: u8 = 0b0000_0001;

    pub const SERIALIZED_LEN_MIN: usize = 8;
    pub const SERIALIZED_LEN_MAX: usize = 12;

    pub fn new(packet_kind: PacketKind, sequence: SequenceNumber, ack: Option<SequenceNumber>) -> PacketHeader {
        PacketHeader {
            packet_kind,
            sequence,
            ack,
            ack_field: 0,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.packet_kind.into());
        buf.put_u8(if self.ack.is_some() { Self::FLAG_ACK_PRESENT } else { 0 });
        buf.put_u32(self.sequence.to_raw());
        if let Some(ack) = self.ack {
            buf.put_u32(ack.to_raw());
        }
        buf.put_u16(self.ack_field);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        let packet_kind = match PacketKind::try_from(buf.try_get_u8()?) {
            Ok(kind) => kind,
            Err(e) => bail!("unsupported packet kind {}", e.number),
        };

        let flags = buf.try_get_u8()?;
        if flags & !Self::FLAG_ACK_PRESENT != 0 {
            bail!("unsupported flags: {:x}", flags);
        }

        let sequence = SequenceNumber::from_raw(buf.try_get_u32()?);
        let ack = if flags & Self::FLAG_ACK_PRESENT != 0 {
            Some(SequenceNumber::from_raw(buf.try_get_u32()?))
        }
        else {
            None
        };
        let ack_field = buf.try_get_u16()?;

        Ok(PacketHeader {
            packet_kind,
            sequence,
            ack,
            ack_field,
        })
    }
}
