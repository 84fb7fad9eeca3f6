//! MAC state machine
//!
//! Polling-driven core: a channel-occupancy state machine and a
//! parallel per-attempt transmit state machine, advanced against the
//! virtual clock. Owns retry policy and modulation fallback.
//
// https://github.com/rust-iot/rust-plc-mac
// Copyright 2021 Ryan Kurte

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error, info, trace, warn};
use rand_core::RngCore;

use super::config::{AddressConfig, CsmaConfig, MacConfig};
use super::csma::CsmaBackoff;
use super::{MacCounters, MacHandler, TxOutcome, TxRequest};

use crate::error::MacError;
use crate::frame::{Address, Frame, FCS_LEN, SHORT_ADDR_BROADCAST};
use crate::params::{Modulation, PhyParams, TONE_MAP_ALL};
use crate::phy::{AckKind, Phy, PhyEvent, PhyTxStatus};
use crate::seg::Segmenter;
use crate::timer::Timer;
use crate::{Ts, MAX_FRAME_LEN};

/// Channel occupancy states
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelState {
    Idle,
    /// Extended interframe space after an ambiguous or erroneous PHY
    /// event
    Eifs,
    /// Contention interframe space after a completed exchange
    Cifs,
    /// Shortened interframe space preceding a retransmission
    CifsRetransmit,
    ContentionPeriod,
    /// Response interframe space while an acknowledgement is pending
    Rifs,
}

/// Per-attempt transmit sub-states
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxState {
    Inactive,
    Start,
    CsmaCa,
    WaitSend,
    WaitConfirm,
    FailCsmaCa,
    WaitAck,
    SendOk,
    LittleFail,
    BigFail,
}

/// Per-request transmit session state.
/// Reset only when the request concludes or on a full MAC reset.
#[derive(Debug, Clone, PartialEq)]
struct TxSession {
    seg: Segmenter,
    /// Remaining transmission attempt budget
    attempts_left: u8,
    seq: u8,

    backoff_until: Ts,
    ack_deadline: Ts,

    /// Payload bytes carried by the segment on air
    seg_len: usize,
    /// FCS of the segment on air, matched against acknowledgements
    fcs: u16,
}

/// PLC MAC real-time layer.
/// Generic over a Phy (P), Timer (T), Rng (R) and upper-layer
/// handler (H); one instance per interface.
pub struct MacRt<P, T, R, H> {
    pub(crate) address: AddressConfig,
    pub(crate) config: MacConfig,

    pub(crate) channel: ChannelState,
    pub(crate) channel_since: Ts,
    pub(crate) tx_state: TxState,

    pub(crate) csma: CsmaBackoff,
    pub(crate) params: PhyParams,
    pub(crate) counters: MacCounters,
    pub(crate) seq: u8,

    pub(crate) request: Option<TxRequest>,
    session: Option<TxSession>,

    /// Buffer for encode operations, exclusively owned by the state
    /// machine
    buffer: [u8; MAX_FRAME_LEN],

    pub(crate) phy: P,
    pub(crate) timer: T,
    pub(crate) rng: R,
    pub(crate) handler: H,
}

impl<P, T, R, H> MacRt<P, T, R, H>
where
    P: Phy,
    T: Timer,
    R: RngCore,
    H: MacHandler,
{
    /// Create a new MAC using the provided PHY
    pub fn new(
        phy: P,
        timer: T,
        rng: R,
        handler: H,
        address: AddressConfig,
        config: MacConfig,
        csma_config: CsmaConfig,
    ) -> Self {
        let channel_since = timer.ticks_us();
        let params = PhyParams::new(config.band);

        Self {
            address,
            config,

            channel: ChannelState::Idle,
            channel_since,
            tx_state: TxState::Inactive,

            csma: CsmaBackoff::new(csma_config),
            params,
            counters: MacCounters::default(),
            seq: 0,

            request: None,
            session: None,

            buffer: [0u8; MAX_FRAME_LEN],

            phy,
            timer,
            rng,
            handler,
        }
    }

    pub fn counters(&self) -> &MacCounters {
        &self.counters
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Submit a transmit request.
    /// At most one request is in flight; the outcome is delivered
    /// asynchronously via the handler.
    pub fn transmit(&mut self, request: TxRequest) -> Result<(), MacError<P::Error>> {
        if self.request.is_some() {
            return Err(MacError::TransmitPending);
        }
        if request.payload.is_empty() {
            return Err(MacError::PayloadEmpty);
        }

        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);

        debug!("Transmit request queued, seq {} ({} bytes)", seq, request.payload.len());

        self.csma.start_request();
        self.session = Some(TxSession {
            seg: Segmenter::new(),
            attempts_left: self.config.max_frame_retries,
            seq,
            backoff_until: 0,
            ack_deadline: 0,
            seg_len: 0,
            fcs: 0,
        });
        self.request = Some(request);
        self.tx_state = TxState::Start;

        Ok(())
    }

    /// Reset all MAC state, counters and timing
    pub fn reset(&mut self) {
        info!("MAC reset");

        self.request = None;
        self.session = None;
        self.tx_state = TxState::Inactive;
        self.channel = ChannelState::Idle;
        self.channel_since = self.timer.ticks_us();
        self.csma.reset();
        self.counters = MacCounters::default();
        self.params = PhyParams::new(self.config.band);
        self.seq = 0;
    }

    /// Update the MAC state.
    /// Non-blocking; invoke repeatedly from the application loop.
    pub fn tick(&mut self) -> Result<(), MacError<P::Error>> {
        let now = self.timer.ticks_us();

        trace!("Tick at {} us, channel {:?}, tx {:?}", now, self.channel, self.tx_state);

        // PHY events are drained synchronously within the poll pass
        while let Some(ev) = self.phy.poll().map_err(MacError::Phy)? {
            self.handle_phy_event(ev, now)?;
        }

        self.advance_channel(now);
        self.advance_tx(now)?;

        Ok(())
    }

    fn set_channel(&mut self, state: ChannelState, at: Ts) {
        if self.channel != state {
            debug!("Channel {:?} -> {:?} at {} us", self.channel, state, at);
        }
        self.channel = state;
        self.channel_since = at;
    }

    /// Timed channel-occupancy transitions
    fn advance_channel(&mut self, now: Ts) {
        let plan = self.config.band.plan();
        let elapsed = now.saturating_sub(self.channel_since);

        match self.channel {
            ChannelState::Idle => (),
            ChannelState::Eifs => {
                if elapsed >= plan.eifs_us {
                    self.set_channel(ChannelState::Idle, now);
                }
            }
            ChannelState::Cifs => {
                if elapsed >= plan.cifs_us {
                    self.set_channel(ChannelState::ContentionPeriod, now);
                }
            }
            ChannelState::CifsRetransmit => {
                if elapsed >= plan.cifs_retransmit_us {
                    self.set_channel(ChannelState::ContentionPeriod, now);
                }
            }
            ChannelState::ContentionPeriod => {
                if elapsed >= plan.contention_us {
                    self.set_channel(ChannelState::Idle, now);
                }
            }
            ChannelState::Rifs => {
                // No acknowledgement within the response window is an
                // ambiguous medium state
                if elapsed >= plan.response_us + plan.ack_us + plan.cifs_us {
                    self.set_channel(ChannelState::Eifs, now);
                }
            }
        }
    }

    fn handle_phy_event(&mut self, ev: PhyEvent, now: Ts) -> Result<(), MacError<P::Error>> {
        match ev {
            PhyEvent::TxConfirm { status, time } => self.handle_tx_confirm(status, time),
            PhyEvent::DataIndication {
                data,
                time,
                ack_requested,
            } => self.handle_data_indication(&data, time, ack_requested),
            PhyEvent::AckIndication { kind, fcs, long_fail } => {
                self.handle_ack_indication(kind, fcs, long_fail, now);
                Ok(())
            }
        }
    }

    fn handle_tx_confirm(&mut self, status: PhyTxStatus, time: Ts) -> Result<(), MacError<P::Error>> {
        if self.tx_state != TxState::WaitConfirm {
            warn!("Spurious transmit confirm ({:?}) in {:?}", status, self.tx_state);
            return Ok(());
        }

        match status {
            PhyTxStatus::Success => {
                self.counters.tx_frames += 1;

                let ack_request = self.request.as_ref().map(|r| r.ack_request).unwrap_or(false);
                if ack_request {
                    let plan = self.config.band.plan();
                    if let Some(s) = self.session.as_mut() {
                        s.ack_deadline = time + plan.response_us + plan.ack_us + plan.cifs_us;
                    }
                    self.set_channel(ChannelState::Rifs, time);
                    self.tx_state = TxState::WaitAck;
                } else {
                    // The exchange completes on the confirm; interframe
                    // space applies all the same
                    self.set_channel(ChannelState::Cifs, time);
                    self.tx_state = TxState::SendOk;
                }
            }
            PhyTxStatus::BusyChannel | PhyTxStatus::BusyRx => {
                debug!("Channel access failed ({}) at {} us", status, time);

                // Score the attempt before the drain continues; a busy
                // report is usually followed by the causing reception
                // in the same poll batch, which must reverse it
                let high_priority = self.request.as_ref().map(|r| r.high_priority).unwrap_or(false);
                if self.csma.on_busy(high_priority) {
                    self.tx_state = TxState::FailCsmaCa;
                } else {
                    self.tx_state = TxState::CsmaCa;
                }
            }
            PhyTxStatus::BusyTx => {
                // The PHY claims we are already transmitting; the
                // bookkeeping considers this impossible
                error!("PHY busy with own transmission, aborting request");
                self.finish(TxOutcome::TransactionOverflow);
            }
            PhyTxStatus::Unknown => {
                error!("Unknown PHY transmit status, aborting request");
                self.finish(TxOutcome::Denied);
            }
        }

        Ok(())
    }

    fn handle_data_indication(&mut self, data: &[u8], time: Ts, ack_requested: bool) -> Result<(), MacError<P::Error>> {
        let frame = match Frame::decode(data, &mut self.counters.frame) {
            Ok(f) => f,
            Err(e) => {
                debug!("Dropping undecodable frame ({:?}, {} bytes)", e, data.len());
                self.set_channel(ChannelState::Eifs, time);
                return Ok(());
            }
        };

        // A valid reception explains a preceding busy report; reverse
        // the attempt increment once
        let high_priority = self.request.as_ref().map(|r| r.high_priority).unwrap_or(false);
        let reversed = self.csma.compensate_rx(high_priority);

        // A reception interrupts a scheduled-but-unconfirmed
        // transmission; it is rescheduled, not dropped
        if self.tx_state == TxState::WaitSend || self.tx_state == TxState::WaitConfirm {
            debug!("Reception interrupts scheduled transmission, rescheduling");
            self.tx_state = TxState::CsmaCa;
        }

        // An exhaustion scored off this reception's own busy report is
        // rescinded along with the increment
        if reversed && self.tx_state == TxState::FailCsmaCa {
            self.tx_state = TxState::CsmaCa;
        }

        if !self.address_match(&frame) {
            trace!("Dropping frame for {:?}", frame.dst);
            self.counters.rx_filtered += 1;
            self.set_channel(ChannelState::Cifs, time);
            return Ok(());
        }

        if ack_requested && frame.fc.ack_request {
            let plan = self.config.band.plan();
            let fcs = LittleEndian::read_u16(&data[data.len() - FCS_LEN..]);

            self.phy
                .ack_request(AckKind::Ack, fcs, !frame.seg.last, time + plan.response_us)
                .map_err(MacError::Phy)?;
            self.counters.acks_sent += 1;
        }

        self.set_channel(ChannelState::Cifs, time);
        self.counters.rx_frames += 1;

        debug!("Received frame seq {} ({} bytes) at {} us", frame.seq, frame.payload().len(), time);

        self.handler.data_indication(&frame);

        Ok(())
    }

    fn handle_ack_indication(&mut self, kind: AckKind, fcs: u16, long_fail: bool, now: Ts) {
        if self.tx_state != TxState::WaitAck {
            warn!("Spurious acknowledgement in {:?}", self.tx_state);
            return;
        }

        let expected = self.session.as_ref().map(|s| s.fcs).unwrap_or(0);
        if fcs != expected {
            debug!("Acknowledgement FCS mismatch ({:04x} != {:04x})", fcs, expected);
            return;
        }

        match kind {
            AckKind::Ack => {
                self.set_channel(ChannelState::Cifs, now);
                self.tx_state = TxState::SendOk;
            }
            AckKind::Nack => {
                debug!("Negative acknowledgement, long_fail {}", long_fail);
                self.set_channel(ChannelState::CifsRetransmit, now);
                self.tx_state = if long_fail { TxState::BigFail } else { TxState::LittleFail };
            }
        }
    }

    /// Step the transmit sub-state machine until it settles
    fn advance_tx(&mut self, now: Ts) -> Result<(), MacError<P::Error>> {
        loop {
            let prev = self.tx_state;
            self.step_tx(now)?;
            if self.tx_state == prev {
                return Ok(());
            }
        }
    }

    fn step_tx(&mut self, now: Ts) -> Result<(), MacError<P::Error>> {
        match self.tx_state {
            TxState::Inactive | TxState::WaitConfirm => (),

            TxState::Start => {
                self.apply_request_params();
                self.phy.set_params(&self.params).map_err(MacError::Phy)?;
                self.handler.plme_get_confirm(&self.params);
                self.tx_state = TxState::CsmaCa;
            }

            TxState::CsmaCa => {
                let (high_priority, broadcast) = match self.request.as_ref() {
                    Some(r) => (r.high_priority, r.dst.is_broadcast()),
                    None => return Ok(()),
                };
                let slot_us = self.config.band.plan().slot_us;

                let delay = self.csma.period_wait_us(high_priority, slot_us)
                    + self.csma.backoff_us(&mut self.rng, high_priority, broadcast, slot_us);

                if let Some(s) = self.session.as_mut() {
                    s.backoff_until = now + delay;
                }
                self.tx_state = TxState::WaitSend;
            }

            TxState::WaitSend => {
                let until = self.session.as_ref().map(|s| s.backoff_until).unwrap_or(0);
                if now < until || !self.channel_permits(now) {
                    return Ok(());
                }
                self.send_segment(now)?;
            }

            TxState::FailCsmaCa => {
                warn!("Backoff budget exhausted after {} attempts", self.csma.attempts());
                self.finish(TxOutcome::ChannelAccessFailure);
            }

            TxState::WaitAck => {
                let deadline = self.session.as_ref().map(|s| s.ack_deadline).unwrap_or(0);
                if now >= deadline {
                    debug!("Acknowledgement timeout at {} us", now);
                    self.tx_state = TxState::BigFail;
                }
            }

            TxState::SendOk => {
                self.csma.on_success();

                let done = match (self.request.as_ref(), self.session.as_mut()) {
                    (Some(r), Some(s)) => {
                        s.seg.advance(s.seg_len);
                        s.seg.is_done(r)
                    }
                    _ => true,
                };

                if done {
                    self.finish(TxOutcome::Success);
                } else {
                    // Sender retains the channel between segments:
                    // start the next one without a fresh contention
                    self.send_segment(now)?;
                }
            }

            TxState::LittleFail => {
                // Immediate NACK: one quick retry after the shortened
                // interframe space, same modulation
                if !self.consume_attempt() {
                    return Ok(());
                }

                let wait = self.config.band.plan().cifs_retransmit_us;
                if let Some(s) = self.session.as_mut() {
                    s.backoff_until = now + wait;
                }
                self.tx_state = TxState::WaitSend;
            }

            TxState::BigFail => {
                if !self.consume_attempt() {
                    return Ok(());
                }

                self.apply_fallback();
                self.phy.set_params(&self.params).map_err(MacError::Phy)?;
                self.handler.plme_get_confirm(&self.params);
                self.tx_state = TxState::CsmaCa;
            }
        }

        Ok(())
    }

    /// Consume one transmission attempt, concluding the request when
    /// the budget runs out. Returns false once concluded.
    fn consume_attempt(&mut self) -> bool {
        let left = match self.session.as_mut() {
            Some(s) => {
                s.attempts_left = s.attempts_left.saturating_sub(1);
                s.attempts_left
            }
            None => 0,
        };

        if left == 0 {
            self.finish(TxOutcome::NoAck);
            return false;
        }

        debug!("Retrying, {} attempts left", left);
        true
    }

    /// Recompute the PHY parameter snapshot from the active request
    fn apply_request_params(&mut self) {
        let req = match self.request.as_ref() {
            Some(r) => r,
            None => return,
        };

        let mut params = PhyParams::new(self.config.band);
        params.modulation = if req.force_robust { Modulation::Robust } else { req.modulation };
        params.scheme = req.scheme;
        params.tone_map = req.tone_map.unwrap_or(TONE_MAP_ALL);
        if let Some(g) = req.gain {
            params.gain = g;
        }
        params.two_rs_blocks = req.two_rs_blocks;

        self.params = params;
    }

    /// Modulation fallback: force robust once few retries remain,
    /// otherwise one notch more robust per retry. Never upgrades.
    fn apply_fallback(&mut self) {
        let req = match self.request.as_ref() {
            Some(r) => r,
            None => return,
        };
        if req.force_modulation || req.force_robust {
            return;
        }

        let left = self.session.as_ref().map(|s| s.attempts_left).unwrap_or(0);

        let next = if left <= self.config.force_robust_retries {
            Modulation::Robust
        } else {
            self.params.modulation.downgrade()
        };

        if next != self.params.modulation {
            info!("Modulation fallback {} -> {}", self.params.modulation, next);
            self.params.modulation = next;
        }
    }

    /// Whether the occupancy state currently permits starting a
    /// transmission
    fn channel_permits(&self, now: Ts) -> bool {
        match self.channel {
            ChannelState::Idle => true,
            ChannelState::ContentionPeriod => {
                let plan = self.config.band.plan();
                let remaining = (self.channel_since + plan.contention_us).saturating_sub(now);

                // Keep a minimum lead before the period ends
                remaining > self.config.tx_lead_us
            }
            _ => false,
        }
    }

    /// Encode and schedule the current segment
    fn send_segment(&mut self, now: Ts) -> Result<(), MacError<P::Error>> {
        let src = self.address.get();

        let (frame_len, seg_len, fcs) = {
            let (req, session) = match (self.request.as_ref(), self.session.as_ref()) {
                (Some(r), Some(s)) => (r, s),
                _ => return Ok(()),
            };

            let frame = session.seg.next_segment(req, src, &self.params, session.seq)?;
            let n = frame.encode(&mut self.buffer);

            (
                n,
                frame.seg.length as usize,
                LittleEndian::read_u16(&self.buffer[n - FCS_LEN..]),
            )
        };

        if let Some(s) = self.session.as_mut() {
            s.seg_len = seg_len;
            s.fcs = fcs;
        }

        debug!(
            "Transmitting segment ({} bytes on air, {} payload, {}) at {} us",
            frame_len,
            seg_len,
            self.params.modulation,
            now
        );

        self.phy
            .tx_request(&self.buffer[..frame_len], now, true)
            .map_err(MacError::Phy)?;

        self.tx_state = TxState::WaitConfirm;

        Ok(())
    }

    /// Conclude the active request, invoking the outcome callback
    /// exactly once
    fn finish(&mut self, outcome: TxOutcome) {
        let modulation = self.params.modulation;

        match outcome {
            TxOutcome::Success => {
                info!("Transmit request complete ({})", modulation);
                self.counters.tx_success += 1;
            }
            TxOutcome::NoAck => {
                warn!("Transmit request failed: retry budget exhausted");
                self.counters.tx_fail_noack += 1;
            }
            TxOutcome::ChannelAccessFailure => {
                warn!("Transmit request failed: channel access");
                self.counters.tx_fail_channel += 1;
            }
            TxOutcome::TransactionOverflow | TxOutcome::Denied => {
                self.counters.tx_fail_fatal += 1;
            }
        }

        self.request = None;
        self.session = None;
        self.tx_state = TxState::Inactive;

        self.handler.tx_confirm(outcome, modulation);
    }

    /// Check whether an incoming frame is addressed to this node
    fn address_match(&self, frame: &Frame) -> bool {
        if let Some(p) = frame.dst_pan {
            if p != 0xffff && p != self.address.pan_id {
                return false;
            }
        }

        match frame.dst {
            Address::None => true,
            Address::Short(s) => s == SHORT_ADDR_BROADCAST || Some(s) == self.address.short_address,
            Address::Extended(e) => Some(e) == self.address.extended_address,
        }
    }
}

#[cfg(test)]
mod test {
    use std::vec;

    use rand::rngs::mock::StepRng;

    use super::*;
    use crate::frame::FrameControl;
    use crate::mac::mock::MockHandler;
    use crate::params::Band;
    use crate::phy::mock::{MockPhy, MockResponder};
    use crate::timer::mock::MockTimer;

    type TestMac = MacRt<MockPhy, MockTimer, StepRng, MockHandler>;

    fn setup(responder: MockResponder) -> (TestMac, MockTimer) {
        let _ = simplelog::SimpleLogger::init(log::LevelFilter::Debug, simplelog::Config::default());

        let timer = MockTimer::new();
        let mac = MacRt::new(
            MockPhy::new(responder),
            timer.clone(),
            StepRng::new(0, 0),
            MockHandler::new(),
            AddressConfig::new(0x1234, 0x0002),
            MacConfig::default(),
            CsmaConfig::default(),
        );

        (mac, timer)
    }

    /// Tick with generous clock steps until the outcome callback fires
    fn run_until_confirm(mac: &mut TestMac, timer: &mut MockTimer, max_ticks: usize) -> (TxOutcome, Modulation) {
        for _ in 0..max_ticks {
            timer.advance_us(20_000);
            mac.tick().unwrap();

            if let Some(c) = mac.handler.confirms.first() {
                return *c;
            }
        }
        panic!("no outcome after {} ticks", max_ticks);
    }

    fn request(len: usize) -> TxRequest {
        let payload = vec![0x5au8; len];
        let mut req = TxRequest::new(0x1234, Address::Short(0x0003), &payload).unwrap();
        req.ack_request = true;
        req
    }

    fn incoming(seq: u8, dst: Address, payload: &[u8]) -> std::vec::Vec<u8> {
        let mut f = Frame::data(0x1234, dst, Address::Short(0x0003), seq, payload).unwrap();
        f.fc = FrameControl {
            ack_request: true,
            pan_id_compression: true,
            ..Default::default()
        };

        let mut buf = vec![0u8; 512];
        let n = f.encode(&mut buf);
        buf.truncate(n);
        buf
    }

    fn indication(data: std::vec::Vec<u8>, time: Ts) -> PhyEvent {
        PhyEvent::DataIndication {
            data: heapless::Vec::from_slice(&data).unwrap(),
            time,
            ack_requested: true,
        }
    }

    #[test]
    fn end_to_end_segmented_transfer() {
        let (mut mac, mut timer) = setup(MockResponder::AckEvery);

        // Expected segment count from the PHY parameter calculator
        let params = PhyParams::new(Band::CenelecA);
        let overhead = crate::frame::header_overhead(
            &Address::Short(3),
            &Address::Short(2),
            true,
            false,
            true,
        );
        let max_single = params.max_segment_payload(overhead);
        let expected = (300 + max_single - 1) / max_single;
        assert!(expected > 1);

        mac.transmit(request(300)).unwrap();

        let (outcome, modulation) = run_until_confirm(&mut mac, &mut timer, 100);
        assert_eq!(outcome, TxOutcome::Success);
        assert_eq!(modulation, Modulation::Bpsk);
        assert_eq!(mac.handler.confirms.len(), 1);

        // Exactly the computed number of segments, in order
        assert_eq!(mac.phy.tx_log.len(), expected);

        let mut c = crate::frame::FrameCounters::default();
        let mut total = 0;
        for (i, record) in mac.phy.tx_log.iter().enumerate() {
            let f = Frame::decode(&record.data, &mut c).unwrap();
            assert_eq!(f.seg.count as usize, i);
            assert_eq!(f.seg.last, i == expected - 1);
            total += f.payload().len();
        }
        assert_eq!(total, 300);

        assert_eq!(mac.counters.tx_success, 1);
        assert_eq!(mac.counters.tx_frames as usize, expected);
    }

    #[test]
    fn retry_exhaustion_reports_channel_access_failure() {
        let (mut mac, mut timer) = setup(MockResponder::Always(PhyTxStatus::BusyChannel));

        mac.transmit(request(20)).unwrap();

        let (outcome, _) = run_until_confirm(&mut mac, &mut timer, 400);
        assert_eq!(outcome, TxOutcome::ChannelAccessFailure);
        assert_eq!(mac.handler.confirms.len(), 1);

        // Exactly the configured attempt budget was spent
        assert_eq!(mac.phy.tx_log.len() as u32, CsmaConfig::default().max_csma_backoffs);
        assert_eq!(mac.counters.tx_fail_channel, 1);
    }

    #[test]
    fn modulation_downgrades_across_retries() {
        let (mut mac, mut timer) = setup(MockResponder::ConfirmOnly);
        mac.config.max_frame_retries = 4;

        let mut req = request(20);
        req.modulation = Modulation::Psk8;
        mac.transmit(req).unwrap();

        let (outcome, modulation) = run_until_confirm(&mut mac, &mut timer, 400);
        assert_eq!(outcome, TxOutcome::NoAck);
        assert_eq!(modulation, Modulation::Robust);

        let mods: std::vec::Vec<_> = mac.phy.tx_log.iter().map(|r| r.modulation.unwrap()).collect();
        assert_eq!(
            mods,
            &[Modulation::Psk8, Modulation::Qpsk, Modulation::Bpsk, Modulation::Robust]
        );

        // Strictly decreasing, never upgraded
        for pair in mods.windows(2) {
            assert!(pair[1] < pair[0]);
        }
    }

    #[test]
    fn forced_modulation_is_held_across_retries() {
        let (mut mac, mut timer) = setup(MockResponder::ConfirmOnly);
        mac.config.max_frame_retries = 3;

        let mut req = request(20);
        req.modulation = Modulation::Qpsk;
        req.force_modulation = true;
        mac.transmit(req).unwrap();

        let (outcome, modulation) = run_until_confirm(&mut mac, &mut timer, 400);
        assert_eq!(outcome, TxOutcome::NoAck);
        assert_eq!(modulation, Modulation::Qpsk);

        for record in mac.phy.tx_log.iter() {
            assert_eq!(record.modulation, Some(Modulation::Qpsk));
        }
    }

    #[test]
    fn busy_own_transmission_is_fatal() {
        let (mut mac, mut timer) = setup(MockResponder::Always(PhyTxStatus::BusyTx));

        mac.transmit(request(20)).unwrap();

        let (outcome, _) = run_until_confirm(&mut mac, &mut timer, 20);
        assert_eq!(outcome, TxOutcome::TransactionOverflow);
        assert_eq!(mac.phy.tx_log.len(), 1);
        assert_eq!(mac.counters.tx_fail_fatal, 1);
        assert_eq!(mac.request, None);
    }

    #[test]
    fn unknown_phy_status_is_denied() {
        let (mut mac, mut timer) = setup(MockResponder::Always(PhyTxStatus::Unknown));

        mac.transmit(request(20)).unwrap();

        let (outcome, _) = run_until_confirm(&mut mac, &mut timer, 20);
        assert_eq!(outcome, TxOutcome::Denied);
        assert_eq!(mac.handler.confirms.len(), 1);
    }

    #[test]
    fn second_request_rejected_while_pending() {
        let (mut mac, _timer) = setup(MockResponder::Manual);

        mac.transmit(request(20)).unwrap();
        assert_eq!(mac.transmit(request(10)), Err(MacError::TransmitPending));
    }

    #[test]
    fn empty_payload_rejected() {
        let (mut mac, _timer) = setup(MockResponder::Manual);

        let req = TxRequest::new(0x1234, Address::Short(3), &[]).unwrap();
        assert_eq!(mac.transmit(req), Err(MacError::PayloadEmpty));
    }

    #[test]
    fn received_frame_is_delivered_and_acked() {
        let (mut mac, mut timer) = setup(MockResponder::Manual);

        timer.advance_us(1000);
        mac.phy.push(indication(incoming(9, Address::Short(0x0002), &[1, 2, 3]), 500));
        mac.tick().unwrap();

        assert_eq!(mac.handler.indications.len(), 1);
        assert_eq!(mac.handler.indications[0].0, 9);
        assert_eq!(&mac.handler.indications[0].1, &[1, 2, 3]);

        // Acknowledgement scheduled for the sender
        assert_eq!(mac.phy.ack_log.len(), 1);
        assert_eq!(mac.phy.ack_log[0].kind, AckKind::Ack);
        assert_eq!(mac.phy.ack_log[0].more, false);

        assert_eq!(mac.channel, ChannelState::Cifs);
        assert_eq!(mac.counters.rx_frames, 1);
    }

    #[test]
    fn broadcast_frame_is_delivered() {
        let (mut mac, mut timer) = setup(MockResponder::Manual);

        timer.advance_us(1000);
        mac.phy
            .push(indication(incoming(1, Address::Short(SHORT_ADDR_BROADCAST), &[7]), 500));
        mac.tick().unwrap();

        assert_eq!(mac.handler.indications.len(), 1);
    }

    #[test]
    fn frame_for_other_node_is_filtered() {
        let (mut mac, mut timer) = setup(MockResponder::Manual);

        timer.advance_us(1000);
        mac.phy.push(indication(incoming(1, Address::Short(0x0099), &[7]), 500));
        mac.tick().unwrap();

        assert_eq!(mac.handler.indications.len(), 0);
        assert_eq!(mac.phy.ack_log.len(), 0);
        assert_eq!(mac.counters.rx_filtered, 1);
    }

    #[test]
    fn corrupt_frame_counted_and_enters_eifs() {
        let (mut mac, mut timer) = setup(MockResponder::Manual);

        timer.advance_us(1000);
        let mut data = incoming(1, Address::Short(0x0002), &[7]);
        data[0] ^= 0x80;
        mac.phy.push(indication(data, 500));
        mac.tick().unwrap();

        assert_eq!(mac.handler.indications.len(), 0);
        assert_eq!(mac.counters.frame.bad_fcs, 1);
        assert_eq!(mac.channel, ChannelState::Eifs);
    }

    #[test]
    fn reception_reschedules_pending_transmission() {
        let (mut mac, mut timer) = setup(MockResponder::Manual);

        mac.transmit(request(20)).unwrap();

        // Walk to the scheduled transmission
        for _ in 0..4 {
            timer.advance_us(20_000);
            mac.tick().unwrap();
        }
        assert_eq!(mac.tx_state, TxState::WaitConfirm);
        assert_eq!(mac.phy.tx_log.len(), 1);

        // Busy report followed by a valid reception: attempt increment
        // is reversed and the transmission rescheduled
        mac.phy.push(PhyEvent::TxConfirm {
            status: PhyTxStatus::BusyChannel,
            time: timer.val(),
        });
        timer.advance_us(1000);
        mac.tick().unwrap();
        assert_eq!(mac.csma.attempts(), 1);

        mac.phy.push(indication(incoming(2, Address::Short(0x0002), &[1]), timer.val()));
        timer.advance_us(1000);
        mac.tick().unwrap();

        assert_eq!(mac.csma.attempts(), 0);
        assert_eq!(mac.handler.indications.len(), 1);

        // The request is still pending and eventually completes
        assert!(mac.request.is_some());
    }

    #[test]
    fn busy_and_reception_in_one_poll_batch_compensates() {
        let (mut mac, mut timer) = setup(MockResponder::Manual);

        mac.transmit(request(20)).unwrap();
        for _ in 0..4 {
            timer.advance_us(20_000);
            mac.tick().unwrap();
        }
        assert_eq!(mac.tx_state, TxState::WaitConfirm);

        // A busy-reception report and the reception that caused it
        // arrive in the same poll batch
        mac.phy.push(PhyEvent::TxConfirm {
            status: PhyTxStatus::BusyRx,
            time: timer.val(),
        });
        mac.phy.push(indication(incoming(4, Address::Short(0x0002), &[9]), timer.val()));

        timer.advance_us(1000);
        mac.tick().unwrap();

        // The busy increment is reversed within the same tick
        assert_eq!(mac.csma.attempts(), 0);
        assert_eq!(mac.handler.indications.len(), 1);
        assert!(mac.request.is_some());

        // A later unrelated reception must not compensate again
        mac.phy.push(indication(incoming(5, Address::Short(0x0002), &[9]), timer.val()));
        timer.advance_us(1000);
        mac.tick().unwrap();
        assert_eq!(mac.csma.attempts(), 0);
    }

    #[test]
    fn compensated_exhaustion_resumes_contention() {
        let (mut mac, mut timer) = setup(MockResponder::Manual);
        mac.csma = CsmaBackoff::new(CsmaConfig {
            max_csma_backoffs: 1,
            ..Default::default()
        });

        mac.transmit(request(20)).unwrap();
        for _ in 0..4 {
            timer.advance_us(20_000);
            mac.tick().unwrap();
        }
        assert_eq!(mac.tx_state, TxState::WaitConfirm);

        // The single budgeted attempt fails busy, but the reception
        // explaining it arrives in the same batch: no failure outcome
        mac.phy.push(PhyEvent::TxConfirm {
            status: PhyTxStatus::BusyRx,
            time: timer.val(),
        });
        mac.phy.push(indication(incoming(4, Address::Short(0x0002), &[9]), timer.val()));

        timer.advance_us(1000);
        mac.tick().unwrap();

        assert_eq!(mac.handler.confirms.len(), 0);
        assert_eq!(mac.csma.attempts(), 0);
        assert!(mac.request.is_some());
    }

    #[test]
    fn unacked_success_enters_cifs() {
        let (mut mac, mut timer) = setup(MockResponder::ConfirmOnly);

        let mut req = request(20);
        req.ack_request = false;
        mac.transmit(req).unwrap();

        for _ in 0..2 {
            timer.advance_us(20_000);
            mac.tick().unwrap();
        }
        assert_eq!(mac.phy.tx_log.len(), 1);

        // Small step so the interframe space is still in force when
        // the confirm is drained
        timer.advance_us(1000);
        mac.tick().unwrap();

        assert_eq!(mac.handler.confirms[0].0, TxOutcome::Success);
        assert_eq!(mac.channel, ChannelState::Cifs);
    }

    #[test]
    fn no_ack_request_completes_on_confirm() {
        let (mut mac, mut timer) = setup(MockResponder::ConfirmOnly);

        let mut req = request(20);
        req.ack_request = false;
        mac.transmit(req).unwrap();

        let (outcome, _) = run_until_confirm(&mut mac, &mut timer, 20);
        assert_eq!(outcome, TxOutcome::Success);
        assert_eq!(mac.phy.tx_log.len(), 1);
    }

    #[test]
    fn reset_clears_pending_state() {
        let (mut mac, mut timer) = setup(MockResponder::Manual);

        mac.transmit(request(20)).unwrap();
        timer.advance_us(20_000);
        mac.tick().unwrap();

        mac.reset();

        assert_eq!(mac.request, None);
        assert_eq!(mac.tx_state, TxState::Inactive);
        assert_eq!(mac.channel, ChannelState::Idle);
        assert_eq!(mac.counters, MacCounters::default());

        // A new request is accepted after reset
        mac.transmit(request(10)).unwrap();
    }

    #[test]
    fn channel_timers_advance_states() {
        let (mut mac, mut timer) = setup(MockResponder::Manual);
        let plan = Band::CenelecA.plan();

        mac.set_channel(ChannelState::Cifs, timer.val());

        timer.advance_us(plan.cifs_us);
        mac.tick().unwrap();
        assert_eq!(mac.channel, ChannelState::ContentionPeriod);

        timer.advance_us(plan.contention_us);
        mac.tick().unwrap();
        assert_eq!(mac.channel, ChannelState::Idle);
    }
}
