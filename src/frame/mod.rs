//! MAC frame codec
//!
//! Encodes and decodes the bit-packed MAC header (segment control,
//! frame control, addressing, optional security header), payload,
//! zero padding and CRC-16 frame check sequence.
//
// https://github.com/rust-iot/rust-plc-mac
// Copyright 2021 Ryan Kurte

use byteorder::{ByteOrder, LittleEndian};
use heapless::Vec;

use crate::MAX_MSDU_LEN;

pub mod bits;
use bits::{BitReader, BitWriter};

/// Frame check sequence length in bytes
pub const FCS_LEN: usize = 2;

/// Minimum decodable frame length
pub const MIN_FRAME_LEN: usize = 8;

/// Broadcast short address
pub const SHORT_ADDR_BROADCAST: u16 = 0xffff;

/// Undefined short address, invalid as a frame source
pub const SHORT_ADDR_UNDEFINED: u16 = 0xffff;

/// Compute the CRC-16/CCITT frame check sequence.
/// Polynomial 0x1021, initial value 0x0000, no final XOR.
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc: u16 = 0x0000;
    for b in data {
        crc ^= (*b as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Frame codec errors.
/// All decode rejections are absorbed here and counted, never
/// propagated past the MAC boundary.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    /// Frame shorter than the minimum header + FCS
    TooShort,
    /// Frame check sequence mismatch
    BadFcs,
    /// Unsupported frame type (>= 4)
    BadFrameType,
    /// Frame-pending flag is not used on the PLC medium
    FramePending,
    /// An addressing mode used the reserved value
    ReservedAddressMode,
    /// Declared segment length exceeds the received bytes
    Truncated,
    /// Source short address is the undefined sentinel
    UndefinedSource,
    /// Header fields are inconsistent
    Malformed,
}

/// Per-instance codec rejection counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameCounters {
    pub bad_len: u32,
    pub bad_fcs: u32,
    pub bad_type: u32,
    pub malformed: u32,
    pub truncated: u32,
    pub undefined_src: u32,
}

impl FrameCounters {
    pub fn total(&self) -> u32 {
        self.bad_len + self.bad_fcs + self.bad_type + self.malformed + self.truncated + self.undefined_src
    }
}

/// MAC frame types
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameType {
    Beacon = 0,
    Data = 1,
    Ack = 2,
    Command = 3,
}

impl FrameType {
    fn from_raw(v: u16) -> Option<Self> {
        match v {
            0 => Some(FrameType::Beacon),
            1 => Some(FrameType::Data),
            2 => Some(FrameType::Ack),
            3 => Some(FrameType::Command),
            _ => None,
        }
    }
}

/// Addressing mode values (1 is reserved)
const ADDR_MODE_NONE: u16 = 0;
const ADDR_MODE_RESERVED: u16 = 1;
const ADDR_MODE_SHORT: u16 = 2;
const ADDR_MODE_EXTENDED: u16 = 3;

/// MAC addresses
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Address {
    None,
    Short(u16),
    Extended(u64),
}

impl Address {
    fn mode(&self) -> u16 {
        match self {
            Address::None => ADDR_MODE_NONE,
            Address::Short(_) => ADDR_MODE_SHORT,
            Address::Extended(_) => ADDR_MODE_EXTENDED,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Address::None => 0,
            Address::Short(_) => 2,
            Address::Extended(_) => 8,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        match self {
            Address::Short(s) => *s == SHORT_ADDR_BROADCAST,
            _ => false,
        }
    }
}

/// Segment control field, 24 bits:
/// reserved:5, tone-map-request:1, contention-control:1, last-segment:1,
/// segment-count:6, segment-length:10
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SegmentControl {
    pub tone_map_request: bool,
    pub contention_control: bool,
    pub last: bool,
    pub count: u8,
    pub length: u16,
}

/// Frame control field, 16 bits:
/// frame-type:3, security:1, pending:1, ack-request:1, pan-compression:1,
/// reserved:3, dst-mode:2, version:2, src-mode:2
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FrameControl {
    pub frame_type: FrameType,
    pub security_enabled: bool,
    pub frame_pending: bool,
    pub ack_request: bool,
    pub pan_id_compression: bool,
    pub version: u8,
}

impl Default for FrameControl {
    fn default() -> Self {
        Self {
            frame_type: FrameType::Data,
            security_enabled: false,
            frame_pending: false,
            ack_request: false,
            pan_id_compression: false,
            version: 0,
        }
    }
}

/// Auxiliary security header, present only on the first segment of a
/// security-enabled frame
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SecurityHeader {
    pub control: u8,
    pub frame_counter: u32,
    pub key_index: u8,
}

/// Security header encoded length
const SEC_HEADER_LEN: usize = 6;

/// A decoded MAC frame with owned payload storage
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub seg: SegmentControl,
    pub fc: FrameControl,
    pub seq: u8,

    pub dst_pan: Option<u16>,
    pub dst: Address,
    pub src_pan: Option<u16>,
    pub src: Address,

    pub security: Option<SecurityHeader>,

    payload: Vec<u8, MAX_MSDU_LEN>,

    /// Zero padding appended between payload and FCS
    pub pad: usize,
}

/// Compute the header overhead (everything before the payload) for the
/// provided addressing and flags. Used by the PHY parameter calculator
/// to size segment payloads.
pub fn header_overhead(
    dst: &Address,
    src: &Address,
    pan_id_compression: bool,
    security: bool,
    first_segment: bool,
) -> usize {
    let mut len = 3 + 2 + 1;

    if dst.mode() != ADDR_MODE_NONE {
        len += 2 + dst.encoded_len();
    }
    if src.mode() != ADDR_MODE_NONE {
        if !pan_id_compression {
            len += 2;
        }
        len += src.encoded_len();
    }
    if security && first_segment {
        len += SEC_HEADER_LEN;
    }

    len
}

impl Frame {
    /// Build a data frame with default control fields
    pub fn data(dst_pan: u16, dst: Address, src: Address, seq: u8, payload: &[u8]) -> Result<Self, FrameError> {
        let payload = Vec::from_slice(payload).map_err(|_| FrameError::Malformed)?;

        Ok(Self {
            seg: SegmentControl {
                last: true,
                length: payload.len() as u16,
                ..Default::default()
            },
            fc: FrameControl {
                frame_type: FrameType::Data,
                pan_id_compression: true,
                ..Default::default()
            },
            seq,
            dst_pan: Some(dst_pan),
            dst,
            src_pan: None,
            src,
            security: None,
            payload,
            pad: 0,
        })
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn set_payload(&mut self, body: &[u8]) -> Result<(), FrameError> {
        self.payload = Vec::from_slice(body).map_err(|_| FrameError::Malformed)?;
        self.seg.length = self.payload.len() as u16;
        Ok(())
    }

    /// Header length for this frame's addressing and flags
    pub fn header_len(&self) -> usize {
        header_overhead(
            &self.dst,
            &self.src,
            self.fc.pan_id_compression,
            self.fc.security_enabled,
            self.seg.count == 0,
        )
    }

    /// Total encoded length including padding and FCS
    pub fn encoded_len(&self) -> usize {
        self.header_len() + self.payload.len() + self.pad + FCS_LEN
    }

    /// Encode the frame into the provided buffer, returning the number
    /// of bytes written. The buffer must hold `encoded_len()` bytes.
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let mut w = BitWriter::new(buf);

        // Segment control
        w.write(0, 5);
        w.write(self.seg.tone_map_request as u16, 1);
        w.write(self.seg.contention_control as u16, 1);
        w.write(self.seg.last as u16, 1);
        w.write(self.seg.count as u16, 6);
        w.write(self.seg.length, 10);

        // Frame control
        w.write(self.fc.frame_type as u16, 3);
        w.write(self.fc.security_enabled as u16, 1);
        w.write(self.fc.frame_pending as u16, 1);
        w.write(self.fc.ack_request as u16, 1);
        w.write(self.fc.pan_id_compression as u16, 1);
        w.write(0, 3);
        w.write(self.dst.mode(), 2);
        w.write(self.fc.version as u16, 2);
        w.write(self.src.mode(), 2);

        let mut len = w.byte_len();

        buf[len] = self.seq;
        len += 1;

        // Addressing
        if let Some(pan) = self.dst_pan {
            if self.dst.mode() != ADDR_MODE_NONE {
                LittleEndian::write_u16(&mut buf[len..], pan);
                len += 2;
            }
        }
        match self.dst {
            Address::None => (),
            Address::Short(s) => {
                LittleEndian::write_u16(&mut buf[len..], s);
                len += 2;
            }
            Address::Extended(e) => {
                LittleEndian::write_u64(&mut buf[len..], e);
                len += 8;
            }
        }
        if self.src.mode() != ADDR_MODE_NONE && !self.fc.pan_id_compression {
            LittleEndian::write_u16(&mut buf[len..], self.src_pan.unwrap_or(SHORT_ADDR_BROADCAST));
            len += 2;
        }
        match self.src {
            Address::None => (),
            Address::Short(s) => {
                LittleEndian::write_u16(&mut buf[len..], s);
                len += 2;
            }
            Address::Extended(e) => {
                LittleEndian::write_u64(&mut buf[len..], e);
                len += 8;
            }
        }

        // Security header on first segment only
        if self.fc.security_enabled && self.seg.count == 0 {
            let s = self.security.unwrap_or_default();
            buf[len] = s.control;
            LittleEndian::write_u32(&mut buf[len + 1..], s.frame_counter);
            buf[len + 5] = s.key_index;
            len += SEC_HEADER_LEN;
        }

        // Payload and zero padding
        buf[len..len + self.payload.len()].copy_from_slice(&self.payload);
        len += self.payload.len();

        for b in buf[len..len + self.pad].iter_mut() {
            *b = 0;
        }
        len += self.pad;

        // Freshly computed FCS trailer
        let fcs = crc16_ccitt(&buf[..len]);
        LittleEndian::write_u16(&mut buf[len..], fcs);
        len += FCS_LEN;

        len
    }

    /// Decode a frame from received bytes.
    ///
    /// All rejections increment a counter and return an error; nothing
    /// is delivered upward for a rejected frame.
    pub fn decode(buf: &[u8], counters: &mut FrameCounters) -> Result<Self, FrameError> {
        let len = buf.len();

        if len < MIN_FRAME_LEN {
            counters.bad_len += 1;
            return Err(FrameError::TooShort);
        }

        // Validate the FCS before parsing anything else
        let fcs = LittleEndian::read_u16(&buf[len - FCS_LEN..]);
        if crc16_ccitt(&buf[..len - FCS_LEN]) != fcs {
            counters.bad_fcs += 1;
            return Err(FrameError::BadFcs);
        }

        let mut r = BitReader::new(&buf[..5]);

        let _reserved = r.read(5);
        let seg = SegmentControl {
            tone_map_request: r.flag(),
            contention_control: r.flag(),
            last: r.flag(),
            count: r.read(6) as u8,
            length: r.read(10),
        };

        let frame_type = r.read(3);
        let security_enabled = r.flag();
        let frame_pending = r.flag();
        let ack_request = r.flag();
        let pan_id_compression = r.flag();
        let _reserved = r.read(3);
        let dst_mode = r.read(2);
        let version = r.read(2) as u8;
        let src_mode = r.read(2);

        let frame_type = match FrameType::from_raw(frame_type) {
            Some(t) => t,
            None => {
                counters.bad_type += 1;
                return Err(FrameError::BadFrameType);
            }
        };

        if frame_pending {
            counters.malformed += 1;
            return Err(FrameError::FramePending);
        }
        if dst_mode == ADDR_MODE_RESERVED || src_mode == ADDR_MODE_RESERVED {
            counters.malformed += 1;
            return Err(FrameError::ReservedAddressMode);
        }

        let seq = buf[5];
        let mut off = 6;
        let body_end = len - FCS_LEN;

        // Bounds-checked field reads; anything short of the declared
        // layout rejects as truncated
        let take = |n: usize, off: &mut usize| -> Option<usize> {
            if *off + n > body_end {
                return None;
            }
            let at = *off;
            *off += n;
            Some(at)
        };

        let mut dst_pan = None;
        let dst = match dst_mode {
            ADDR_MODE_NONE => Address::None,
            ADDR_MODE_SHORT => match (take(2, &mut off), take(2, &mut off)) {
                (Some(p), Some(a)) => {
                    dst_pan = Some(LittleEndian::read_u16(&buf[p..]));
                    Address::Short(LittleEndian::read_u16(&buf[a..]))
                }
                _ => {
                    counters.truncated += 1;
                    return Err(FrameError::Truncated);
                }
            },
            _ => match (take(2, &mut off), take(8, &mut off)) {
                (Some(p), Some(a)) => {
                    dst_pan = Some(LittleEndian::read_u16(&buf[p..]));
                    Address::Extended(LittleEndian::read_u64(&buf[a..]))
                }
                _ => {
                    counters.truncated += 1;
                    return Err(FrameError::Truncated);
                }
            },
        };

        let mut src_pan = None;
        if src_mode != ADDR_MODE_NONE && !pan_id_compression {
            match take(2, &mut off) {
                Some(p) => src_pan = Some(LittleEndian::read_u16(&buf[p..])),
                None => {
                    counters.truncated += 1;
                    return Err(FrameError::Truncated);
                }
            }
        }
        let src = match src_mode {
            ADDR_MODE_NONE => Address::None,
            ADDR_MODE_SHORT => match take(2, &mut off) {
                Some(a) => Address::Short(LittleEndian::read_u16(&buf[a..])),
                None => {
                    counters.truncated += 1;
                    return Err(FrameError::Truncated);
                }
            },
            _ => match take(8, &mut off) {
                Some(a) => Address::Extended(LittleEndian::read_u64(&buf[a..])),
                None => {
                    counters.truncated += 1;
                    return Err(FrameError::Truncated);
                }
            },
        };

        // A source must be a real node
        if let Address::Short(s) = src {
            if s == SHORT_ADDR_UNDEFINED {
                counters.undefined_src += 1;
                return Err(FrameError::UndefinedSource);
            }
        }

        // Security header is carried on the first segment only
        let mut security = None;
        if security_enabled && seg.count == 0 {
            match take(SEC_HEADER_LEN, &mut off) {
                Some(s) => {
                    security = Some(SecurityHeader {
                        control: buf[s],
                        frame_counter: LittleEndian::read_u32(&buf[s + 1..]),
                        key_index: buf[s + 5],
                    });
                }
                None => {
                    counters.truncated += 1;
                    return Err(FrameError::Truncated);
                }
            }
        }

        // Declared payload plus header must fit the received bytes;
        // whatever remains past the payload is padding
        let length = seg.length as usize;
        if length > MAX_MSDU_LEN || off + length > body_end {
            counters.truncated += 1;
            return Err(FrameError::Truncated);
        }
        let pad = body_end - off - length;

        let payload = match Vec::from_slice(&buf[off..off + length]) {
            Ok(v) => v,
            Err(_) => {
                counters.malformed += 1;
                return Err(FrameError::Malformed);
            }
        };

        Ok(Frame {
            seg,
            fc: FrameControl {
                frame_type,
                security_enabled,
                frame_pending,
                ack_request,
                pan_id_compression,
                version,
            },
            seq,
            dst_pan,
            dst,
            src_pan,
            src,
            security,
            payload,
            pad,
        })
    }
}
