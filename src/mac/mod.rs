//! Medium Access Control (MAC) real-time layer module.
//! Contains the upper-layer capability interface and shared MAC types.
//
// https://github.com/rust-iot/rust-plc-mac
// Copyright 2021 Ryan Kurte

pub mod config;

pub mod csma;

pub mod core;

use heapless::Vec;

use crate::error::MacError;
use crate::frame::{Address, Frame, FrameCounters, SecurityHeader};
use crate::params::{Modulation, ModulationScheme, PhyParams, ToneMap};
use crate::MAX_MSDU_LEN;

/// Final outcome of a transmit request, reported exactly once
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(strum::Display)]
pub enum TxOutcome {
    /// All segments sent (and acknowledged where requested)
    Success,
    /// Retry budget exhausted without an acknowledgement
    NoAck,
    /// CSMA/CA backoff budget exhausted
    ChannelAccessFailure,
    /// The PHY reported a transmission already in progress; internal
    /// consistency violation
    TransactionOverflow,
    /// The PHY reported a status the MAC cannot interpret
    Denied,
}

/// Upper-layer notification interface, injected at initialisation
pub trait MacHandler {
    /// Transmit request concluded with `outcome`, final negotiated
    /// modulation attached
    fn tx_confirm(&mut self, outcome: TxOutcome, modulation: Modulation);

    /// A valid, address-filtered frame was received
    fn data_indication(&mut self, frame: &Frame);

    /// Transmit parameters were recomputed
    fn plme_get_confirm(&mut self, params: &PhyParams) {
        let _ = params;
    }
}

/// An upper-layer transmit request.
///
/// Owned exclusively by the MAC from submission until the outcome
/// callback fires.
#[derive(Debug, Clone, PartialEq)]
pub struct TxRequest {
    pub dst_pan: u16,
    pub dst: Address,
    pub payload: Vec<u8, MAX_MSDU_LEN>,

    pub ack_request: bool,
    pub high_priority: bool,
    /// Permit contention access in the following period
    pub contention_control: bool,
    /// Ask the receiver for a fresh tone map
    pub tone_map_request: bool,

    /// Starting modulation hint
    pub modulation: Modulation,
    /// Hold the hinted modulation for every retry
    pub force_modulation: bool,
    /// Start (and stay) in robust mode
    pub force_robust: bool,
    pub scheme: ModulationScheme,

    pub tone_map: Option<ToneMap>,
    pub gain: Option<[u8; 9]>,
    pub two_rs_blocks: bool,

    pub security: Option<SecurityHeader>,
}

impl TxRequest {
    pub fn new(dst_pan: u16, dst: Address, payload: &[u8]) -> Result<Self, MacError<()>> {
        Ok(Self {
            dst_pan,
            dst,
            payload: Vec::from_slice(payload).map_err(|_| MacError::PayloadTooLong(payload.len()))?,
            ack_request: false,
            high_priority: false,
            contention_control: true,
            tone_map_request: false,
            modulation: Modulation::Bpsk,
            force_modulation: false,
            force_robust: false,
            scheme: ModulationScheme::Differential,
            tone_map: None,
            gain: None,
            two_rs_blocks: false,
            security: None,
        })
    }
}

/// Per-instance MAC statistics, readable by the embedder
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MacCounters {
    /// Codec rejection counters
    pub frame: FrameCounters,

    pub rx_frames: u32,
    pub rx_filtered: u32,
    pub acks_sent: u32,

    pub tx_frames: u32,
    pub tx_success: u32,
    pub tx_fail_channel: u32,
    pub tx_fail_noack: u32,
    pub tx_fail_fatal: u32,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn oversized_payload_rejected_at_construction() {
        let payload = [0u8; MAX_MSDU_LEN + 1];

        let r = TxRequest::new(1, Address::Short(2), &payload);
        assert_eq!(r.err(), Some(MacError::PayloadTooLong(MAX_MSDU_LEN + 1)));
    }

    #[test]
    fn maximum_payload_accepted() {
        let payload = [0u8; MAX_MSDU_LEN];

        assert!(TxRequest::new(1, Address::Short(2), &payload).is_ok());
    }
}

#[cfg(any(test, feature = "mocks"))]
pub mod mock {
    use std::vec::Vec;

    use super::*;

    /// Mock handler recording every upper-layer notification
    #[derive(Debug, Default)]
    pub struct MockHandler {
        pub confirms: Vec<(TxOutcome, Modulation)>,
        pub indications: Vec<(u8, Vec<u8>)>,
        pub param_updates: u32,
    }

    impl MockHandler {
        pub fn new() -> Self {
            Default::default()
        }
    }

    impl MacHandler for MockHandler {
        fn tx_confirm(&mut self, outcome: TxOutcome, modulation: Modulation) {
            self.confirms.push((outcome, modulation));
        }

        fn data_indication(&mut self, frame: &Frame) {
            self.indications.push((frame.seq, frame.payload().to_vec()));
        }

        fn plme_get_confirm(&mut self, _params: &PhyParams) {
            self.param_updates += 1;
        }
    }
}
