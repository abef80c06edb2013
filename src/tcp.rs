//! TCP segment and option codec.
//!
//! Only what the MPTCP probe needs: a fixed 20-byte header, an ordered option
//! list, and semantic decoding of the MP_CAPABLE option (kind 30). Every other
//! option kind is carried as opaque bytes.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Source Port          |       Destination Port        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Acknowledgment Number                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | Offset| Res.|  ECN|   Ctrl    |            Window             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           Checksum            |         Urgent Pointer        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Options (variable)                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use thiserror::Error;

/// Control flag bits, as stored in [`Segment::ctrl`].
pub mod flags {
    pub const FIN: u8 = 1;
    pub const SYN: u8 = 2;
    pub const RST: u8 = 4;
    pub const PSH: u8 = 8;
    pub const ACK: u8 = 16;
    pub const URG: u8 = 32;
}

/// Size of the fixed header. Encoded segments are never shorter than this.
pub const TCP_HEADER_LEN: usize = 20;

/// Option kind reserved for Multipath TCP.
pub const MPTCP_KIND: u8 = 30;
/// MP_CAPABLE option carrying only the sender key.
pub const MPTCP_LEN_SENDER_KEY: u8 = 12;
/// MP_CAPABLE option carrying both keys.
pub const MPTCP_LEN_BOTH_KEYS: u8 = 20;

const OPT_END: u8 = 0;
const OPT_NOP: u8 = 1;

/// Reasons a byte buffer is not a usable TCP segment.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("segment too short: {0} bytes, need at least 20")]
    Truncated(usize),

    #[error("data offset {0} is below the 5-word minimum")]
    BadDataOffset(u8),

    #[error("header length {header_len} exceeds the {available} bytes received")]
    HeaderOverrun { header_len: usize, available: usize },

    #[error("option kind {kind} needs {needed} bytes but only {available} remain in the header")]
    OptionTruncated { kind: u8, needed: usize, available: usize },

    #[error("option kind {kind} declares impossible length {length}")]
    BadOptionLength { kind: u8, length: u8 },
}

/// The MP_CAPABLE option as sent on a SYN and echoed on a SYN-ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MptcpCapable {
    pub subtype: u8,
    /// Decoded from the whole subtype/version byte, not just its low nibble.
    pub version: u8,
    pub a: bool,
    pub b: bool,
    pub c: bool,
    pub h: bool,
    pub sender_key: u64,
    pub receiver_key: Option<u64>,
}

impl MptcpCapable {
    /// Declared option length: 12 with only the sender key, 20 with both.
    pub fn length(&self) -> u8 {
        if self.receiver_key.is_some() {
            MPTCP_LEN_BOTH_KEYS
        } else {
            MPTCP_LEN_SENDER_KEY
        }
    }

    /// Decode the option body (everything after kind and length).
    /// `body` is exactly `length - 2` bytes long.
    fn decode(length: u8, body: &[u8]) -> Self {
        let mix = body[0];
        let bits = body[1];

        let mut key = [0u8; 8];
        key.copy_from_slice(&body[2..10]);
        let sender_key = u64::from_be_bytes(key);

        let receiver_key = if length == MPTCP_LEN_BOTH_KEYS {
            key.copy_from_slice(&body[10..18]);
            Some(u64::from_be_bytes(key))
        } else {
            None
        };

        Self {
            subtype: mix >> 4,
            version: mix,
            a: bits & 0x80 != 0,
            b: bits & 0x40 != 0,
            c: bits & 0x20 != 0,
            h: bits & 0x01 != 0,
            sender_key,
            receiver_key,
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(MPTCP_KIND);
        buf.push(self.length());
        buf.push((self.subtype << 4) | self.version);
        buf.push(
            (u8::from(self.a) << 7)
                | (u8::from(self.b) << 6)
                | (u8::from(self.c) << 5)
                | u8::from(self.h),
        );
        buf.extend_from_slice(&self.sender_key.to_be_bytes());
        if let Some(receiver_key) = self.receiver_key {
            buf.extend_from_slice(&receiver_key.to_be_bytes());
        }
    }
}

/// One entry of the options region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpOption {
    /// Any option other than MP_CAPABLE. Kinds 0 and 1 are single-byte
    /// options with `length == 1` and no data.
    Generic { kind: u8, length: u8, data: Vec<u8> },
    MptcpCapable(MptcpCapable),
}

impl TcpOption {
    pub fn kind(&self) -> u8 {
        match self {
            TcpOption::Generic { kind, .. } => *kind,
            TcpOption::MptcpCapable(_) => MPTCP_KIND,
        }
    }

    pub fn length(&self) -> u8 {
        match self {
            TcpOption::Generic { length, .. } => *length,
            TcpOption::MptcpCapable(option) => option.length(),
        }
    }

    /// Decode one option from the front of `region`, returning it together
    /// with the number of bytes it occupied.
    pub fn decode(region: &[u8]) -> Result<(Self, usize), DecodeError> {
        let Some(&kind) = region.first() else {
            return Err(DecodeError::OptionTruncated { kind: OPT_END, needed: 1, available: 0 });
        };
        if kind == OPT_END || kind == OPT_NOP {
            return Ok((TcpOption::Generic { kind, length: 1, data: Vec::new() }, 1));
        }

        if region.len() < 2 {
            return Err(DecodeError::OptionTruncated { kind, needed: 2, available: region.len() });
        }
        let length = region[1];
        if length < 2 {
            return Err(DecodeError::BadOptionLength { kind, length });
        }
        let needed = length as usize;
        if region.len() < needed {
            return Err(DecodeError::OptionTruncated { kind, needed, available: region.len() });
        }

        let body = &region[2..needed];
        let option = if kind == MPTCP_KIND
            && (length == MPTCP_LEN_SENDER_KEY || length == MPTCP_LEN_BOTH_KEYS)
        {
            TcpOption::MptcpCapable(MptcpCapable::decode(length, body))
        } else {
            // Other MPTCP subtypes and every non-MPTCP kind stay opaque
            TcpOption::Generic { kind, length, data: body.to_vec() }
        };

        Ok((option, needed))
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            TcpOption::Generic { kind, length, data } => {
                buf.push(*kind);
                if *length > 1 {
                    buf.push(*length);
                    buf.extend_from_slice(data);
                }
            }
            TcpOption::MptcpCapable(option) => option.encode(buf),
        }
    }
}

/// A TCP header with its options.
///
/// `data_offset`, `reserved`, `ecn` and `ctrl` share one 16-bit word:
/// 4 bits offset, 3 reserved, 3 ECN, 6 control flags, most significant first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Segment {
    pub source: u16,
    pub destination: u16,
    pub seq_num: u32,
    pub ack_num: u32,
    /// Header length in 32-bit words
    pub data_offset: u8,
    pub reserved: u8,
    pub ecn: u8,
    pub ctrl: u8,
    pub window: u16,
    pub checksum: u16,
    pub urgent: u16,
    pub options: Vec<TcpOption>,
}

impl Segment {
    /// Serialise the header and its options, zero-padded to at least 20 bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(TCP_HEADER_LEN + 20);
        buf.extend_from_slice(&self.source.to_be_bytes());
        buf.extend_from_slice(&self.destination.to_be_bytes());
        buf.extend_from_slice(&self.seq_num.to_be_bytes());
        buf.extend_from_slice(&self.ack_num.to_be_bytes());

        let mix = (u16::from(self.data_offset & 0x0f) << 12)
            | (u16::from(self.reserved & 0x07) << 9)
            | (u16::from(self.ecn & 0x07) << 6)
            | u16::from(self.ctrl & 0x3f);
        buf.extend_from_slice(&mix.to_be_bytes());

        buf.extend_from_slice(&self.window.to_be_bytes());
        buf.extend_from_slice(&self.checksum.to_be_bytes());
        buf.extend_from_slice(&self.urgent.to_be_bytes());

        for option in &self.options {
            option.encode(&mut buf);
        }

        if buf.len() < TCP_HEADER_LEN {
            buf.resize(TCP_HEADER_LEN, 0);
        }
        buf
    }

    /// Parse a segment. The options region is bounded by the data offset;
    /// anything after the header (payload) is ignored.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < TCP_HEADER_LEN {
            return Err(DecodeError::Truncated(data.len()));
        }

        let mix = u16::from_be_bytes([data[12], data[13]]);
        let data_offset = (mix >> 12) as u8;
        if data_offset < 5 {
            return Err(DecodeError::BadDataOffset(data_offset));
        }
        let header_len = data_offset as usize * 4;
        if header_len > data.len() {
            return Err(DecodeError::HeaderOverrun { header_len, available: data.len() });
        }

        let mut options = Vec::new();
        let mut region = &data[TCP_HEADER_LEN..header_len];
        while !region.is_empty() {
            let (option, used) = TcpOption::decode(region)?;
            options.push(option);
            region = &region[used..];
        }

        Ok(Self {
            source: u16::from_be_bytes([data[0], data[1]]),
            destination: u16::from_be_bytes([data[2], data[3]]),
            seq_num: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ack_num: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            data_offset,
            reserved: ((mix >> 9) & 0x07) as u8,
            ecn: ((mix >> 6) & 0x07) as u8,
            ctrl: (mix & 0x3f) as u8,
            window: u16::from_be_bytes([data[14], data[15]]),
            checksum: u16::from_be_bytes([data[16], data[17]]),
            urgent: u16::from_be_bytes([data[18], data[19]]),
            options,
        })
    }

    pub fn has_flag(&self, bit: u8) -> bool {
        self.ctrl & bit != 0
    }

    /// The MP_CAPABLE option this segment carries. When several are present
    /// the last one wins.
    pub fn mptcp_capable(&self) -> Option<MptcpCapable> {
        self.options.iter().rev().find_map(|option| match option {
            TcpOption::MptcpCapable(mptcp) => Some(*mptcp),
            TcpOption::Generic { .. } => None,
        })
    }

    /// Whether any kind-30 option is present, decoded or opaque.
    pub fn has_mptcp_option(&self) -> bool {
        self.options.iter().any(|option| option.kind() == MPTCP_KIND)
    }
}
