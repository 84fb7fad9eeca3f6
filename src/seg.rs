//! Payload segmentation engine
//!
//! Splits an outbound payload at the PHY's maximum segment payload
//! boundary, producing one encoded segment per iteration.
//
// https://github.com/rust-iot/rust-plc-mac
// Copyright 2021 Ryan Kurte

use log::trace;

use crate::frame::{header_overhead, Address, Frame, FrameControl, FrameError, FrameType, SegmentControl, FCS_LEN};
use crate::mac::TxRequest;
use crate::params::PhyParams;

/// Segmentation progress for one transmit request
#[derive(Debug, Clone, PartialEq)]
pub struct Segmenter {
    /// Payload bytes already sent and acknowledged
    offset: usize,
    /// Next segment number
    count: u8,
}

impl Segmenter {
    pub fn new() -> Self {
        Self { offset: 0, count: 0 }
    }

    pub fn remaining(&self, req: &TxRequest) -> usize {
        req.payload.len() - self.offset
    }

    pub fn is_done(&self, req: &TxRequest) -> bool {
        self.offset >= req.payload.len()
    }

    pub fn segment_number(&self) -> u8 {
        self.count
    }

    /// Build the next segment for the request under the current PHY
    /// parameters. Does not advance progress; call `advance` once the
    /// segment is sent (and acknowledged where required).
    pub fn next_segment(&self, req: &TxRequest, src: Address, params: &PhyParams, seq: u8) -> Result<Frame, FrameError> {
        let first = self.count == 0;
        let security = req.security.is_some();

        let overhead = header_overhead(&req.dst, &src, true, security, first);
        let max = params.max_segment_payload(overhead);
        if max == 0 {
            return Err(FrameError::Malformed);
        }

        let remaining = self.remaining(req);
        let len = max.min(remaining);
        let last = len == remaining;

        let mut frame = Frame::data(req.dst_pan, req.dst, src, seq, &req.payload[self.offset..self.offset + len])?;

        frame.seg = SegmentControl {
            // Request flags ride on the final segment only
            tone_map_request: last && req.tone_map_request,
            contention_control: req.contention_control,
            last,
            count: self.count & 0x3f,
            length: len as u16,
        };
        frame.fc = FrameControl {
            frame_type: FrameType::Data,
            security_enabled: security,
            frame_pending: false,
            ack_request: req.ack_request,
            pan_id_compression: true,
            version: 0,
        };
        if first {
            frame.security = req.security;
        }

        frame.pad = params.padding_for(frame.header_len() + len + FCS_LEN);

        trace!(
            "Segment {} len {} pad {} last {} ({} remaining)",
            self.count,
            len,
            frame.pad,
            last,
            remaining - len
        );

        Ok(frame)
    }

    /// Record `sent` payload bytes as delivered and move to the next
    /// segment number
    pub fn advance(&mut self, sent: usize) {
        self.offset += sent;
        self.count = self.count.wrapping_add(1) & 0x3f;
    }
}
