//! Fixed 36-byte telemetry wire format.
//!
//! ```text
//! offset  size  field
//!      0     4  magic_id          (0xABCD1234)
//!      4     4  packet_id
//!      8     8  timestamp_ms
//!     16     2  battery_mv
//!     18     2  batt_current_ma   (signed)
//!     20     1  soc_percent
//!     21     1  reserved          (written as 0, covered by the CRC)
//!     22     2  temp_centi        (signed)
//!     24     2  solar_current_ma  (signed)
//!     26     4  altitude_m
//!     30     2  error_flags
//!     32     4  crc32             (CRC-32/IEEE over bytes 0..32)
//! ```
//!
//! Every multi-byte field, the CRC included, uses the codec's [`ByteOrder`].
//! Decoding checks the CRC before the magic so that any single flipped bit
//! in the covered region reports [`DecodeError::ChecksumMismatch`]; callers
//! that need to tell misalignment from an aligned-but-corrupt frame use
//! [`PacketCodec::has_magic`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::models::TelemetryPacket;

pub const PACKET_SIZE: usize = 36;
pub const MAGIC_ID: u32 = 0xABCD_1234;

const RESERVED_OFFSET: usize = 21;
const CRC_OFFSET: usize = 32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ByteOrder::Little => f.write_str("little"),
            ByteOrder::Big => f.write_str("big"),
        }
    }
}

impl FromStr for ByteOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "little" | "le" | "little-endian" => Ok(ByteOrder::Little),
            "big" | "be" | "big-endian" => Ok(ByteOrder::Big),
            other => Err(format!("unknown byte order '{other}'")),
        }
    }
}

macro_rules! put {
    ($order:expr, $buf:expr, $at:expr, $value:expr) => {{
        let bytes = match $order {
            ByteOrder::Little => $value.to_le_bytes(),
            ByteOrder::Big => $value.to_be_bytes(),
        };
        $buf[$at..$at + bytes.len()].copy_from_slice(&bytes);
    }};
}

macro_rules! get {
    ($order:expr, $buf:expr, $at:expr, $ty:ty) => {{
        const N: usize = std::mem::size_of::<$ty>();
        let mut raw = [0u8; N];
        raw.copy_from_slice(&$buf[$at..$at + N]);
        match $order {
            ByteOrder::Little => <$ty>::from_le_bytes(raw),
            ByteOrder::Big => <$ty>::from_be_bytes(raw),
        }
    }};
}

/// Pure encoder/decoder for one byte-order convention.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketCodec {
    order: ByteOrder,
}

impl PacketCodec {
    pub fn new(order: ByteOrder) -> Self {
        Self { order }
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }

    pub fn encode(&self, packet: &TelemetryPacket) -> [u8; PACKET_SIZE] {
        // ---
        let order = self.order;
        let mut frame = [0u8; PACKET_SIZE];

        put!(order, frame, 0, MAGIC_ID);
        put!(order, frame, 4, packet.packet_id);
        put!(order, frame, 8, packet.timestamp_ms);
        put!(order, frame, 16, packet.battery_mv);
        put!(order, frame, 18, packet.batt_current_ma);
        frame[20] = packet.soc_percent;
        frame[RESERVED_OFFSET] = 0;
        put!(order, frame, 22, packet.temp_centi);
        put!(order, frame, 24, packet.solar_current_ma);
        put!(order, frame, 26, packet.altitude_m);
        put!(order, frame, 30, packet.error_flags);

        let crc = crc32fast::hash(&frame[..CRC_OFFSET]);
        put!(order, frame, CRC_OFFSET, crc);
        frame
    }

    /// Decode the first [`PACKET_SIZE`] bytes of `frame`.
    pub fn decode(&self, frame: &[u8]) -> Result<TelemetryPacket, DecodeError> {
        // ---
        if frame.len() < PACKET_SIZE {
            return Err(DecodeError::Truncated { len: frame.len() });
        }
        let order = self.order;

        let received = get!(order, frame, CRC_OFFSET, u32);
        let computed = crc32fast::hash(&frame[..CRC_OFFSET]);
        if received != computed {
            return Err(DecodeError::ChecksumMismatch { received, computed });
        }

        let magic = get!(order, frame, 0, u32);
        if magic != MAGIC_ID {
            return Err(DecodeError::BadMagic { found: magic });
        }

        Ok(TelemetryPacket {
            packet_id: get!(order, frame, 4, u32),
            timestamp_ms: get!(order, frame, 8, u64),
            battery_mv: get!(order, frame, 16, u16),
            batt_current_ma: get!(order, frame, 18, i16),
            soc_percent: frame[20],
            temp_centi: get!(order, frame, 22, i16),
            solar_current_ma: get!(order, frame, 24, i16),
            altitude_m: get!(order, frame, 26, u32),
            error_flags: get!(order, frame, 30, u16),
        })
    }

    /// Whether `frame` starts with the magic constant in this byte order.
    pub fn has_magic(&self, frame: &[u8]) -> bool {
        frame.len() >= 4 && get!(self.order, frame, 0, u32) == MAGIC_ID
    }
}
