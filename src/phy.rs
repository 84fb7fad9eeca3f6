//! PHY adaptation boundary
//!
//! Trait contract for the symbol-level PHY: delayed transmissions,
//! delayed acknowledgements and polled confirm/indication events.
//
// https://github.com/rust-iot/rust-plc-mac
// Copyright 2021 Ryan Kurte

use core::fmt::Debug;

use crate::params::PhyParams;
use crate::Ts;

/// Outcome of a scheduled transmission, reported via `PhyEvent::TxConfirm`
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(strum::Display)]
pub enum PhyTxStatus {
    /// Frame sent
    Success,
    /// Channel sensed busy, transmission not started
    BusyChannel,
    /// A reception was in progress
    BusyRx,
    /// A transmission of our own was already in progress
    BusyTx,
    /// Status the MAC bookkeeping does not recognise
    Unknown,
}

/// Acknowledgement delimiter type
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AckKind {
    Ack,
    Nack,
}

/// Events delivered by the PHY.
///
/// Events are drained synchronously inside the MAC poll loop; an
/// interrupt-driven PHY integration must defer into this queue rather
/// than calling across threads.
#[derive(Debug, Clone, PartialEq)]
pub enum PhyEvent {
    /// Result of the last scheduled transmission
    TxConfirm { status: PhyTxStatus, time: Ts },

    /// A frame was received
    DataIndication {
        data: heapless::Vec<u8, { crate::MAX_FRAME_LEN }>,
        time: Ts,
        ack_requested: bool,
    },

    /// An acknowledgement was received, echoing the FCS of the frame
    /// it acknowledges
    AckIndication {
        kind: AckKind,
        fcs: u16,
        /// Receiver signalled a long recovery rather than an
        /// immediate retry
        long_fail: bool,
    },
}

/// PHY interface consumed by the MAC state machine.
///
/// A new `tx_request` supersedes any scheduled-but-unconfirmed
/// transmission; there is no separate cancellation primitive.
pub trait Phy {
    type Error: Debug;

    /// Schedule a delayed transmission at virtual-clock time `at`,
    /// optionally channel-sensed
    fn tx_request(&mut self, data: &[u8], at: Ts, sense: bool) -> Result<(), Self::Error>;

    /// Schedule a delayed acknowledgement echoing `fcs`, with a
    /// more-segments flag
    fn ack_request(&mut self, kind: AckKind, fcs: u16, more: bool, at: Ts) -> Result<(), Self::Error>;

    /// Apply transmit parameters for subsequent requests
    fn set_params(&mut self, params: &PhyParams) -> Result<(), Self::Error>;

    /// Poll for the next pending event, if any
    fn poll(&mut self) -> Result<Option<PhyEvent>, Self::Error>;
}

#[cfg(any(test, feature = "mocks"))]
pub mod mock {
    use std::collections::VecDeque;
    use std::vec::Vec;

    use byteorder::{ByteOrder, LittleEndian};

    use super::*;
    use crate::frame::FCS_LEN;
    use crate::params::Modulation;

    /// Scripted responses to transmit requests
    #[derive(Debug, Clone, PartialEq)]
    pub enum MockResponder {
        /// Events are pushed manually via `push`
        Manual,
        /// Every request confirms with the provided status
        Always(PhyTxStatus),
        /// Every request confirms success; no acknowledgement follows
        ConfirmOnly,
        /// Every request confirms success and is positively acknowledged
        AckEvery,
    }

    /// One recorded transmit request
    #[derive(Debug, Clone, PartialEq)]
    pub struct TxRecord {
        pub data: Vec<u8>,
        pub at: Ts,
        pub sense: bool,
        /// Modulation in force when the request was made
        pub modulation: Option<Modulation>,
    }

    /// One recorded acknowledgement request
    #[derive(Debug, Clone, PartialEq)]
    pub struct AckRecord {
        pub kind: AckKind,
        pub fcs: u16,
        pub more: bool,
        pub at: Ts,
    }

    /// Mock PHY implementation to assist with testing
    #[derive(Debug)]
    pub struct MockPhy {
        pub responder: MockResponder,
        pub events: VecDeque<PhyEvent>,
        pub tx_log: Vec<TxRecord>,
        pub ack_log: Vec<AckRecord>,
        pub params: Option<PhyParams>,
    }

    impl MockPhy {
        pub fn new(responder: MockResponder) -> Self {
            Self {
                responder,
                events: VecDeque::new(),
                tx_log: Vec::new(),
                ack_log: Vec::new(),
                params: None,
            }
        }

        /// Queue an event for the next poll
        pub fn push(&mut self, ev: PhyEvent) {
            self.events.push_back(ev);
        }
    }

    impl Phy for MockPhy {
        type Error = ();

        fn tx_request(&mut self, data: &[u8], at: Ts, sense: bool) -> Result<(), ()> {
            self.tx_log.push(TxRecord {
                data: data.to_vec(),
                at,
                sense,
                modulation: self.params.as_ref().map(|p| p.modulation),
            });

            match &self.responder {
                MockResponder::Manual => (),
                MockResponder::Always(status) => {
                    self.events.push_back(PhyEvent::TxConfirm { status: *status, time: at });
                }
                MockResponder::ConfirmOnly => {
                    self.events.push_back(PhyEvent::TxConfirm {
                        status: PhyTxStatus::Success,
                        time: at,
                    });
                }
                MockResponder::AckEvery => {
                    let fcs = LittleEndian::read_u16(&data[data.len() - FCS_LEN..]);
                    self.events.push_back(PhyEvent::TxConfirm {
                        status: PhyTxStatus::Success,
                        time: at,
                    });
                    self.events.push_back(PhyEvent::AckIndication {
                        kind: AckKind::Ack,
                        fcs,
                        long_fail: false,
                    });
                }
            }

            Ok(())
        }

        fn ack_request(&mut self, kind: AckKind, fcs: u16, more: bool, at: Ts) -> Result<(), ()> {
            self.ack_log.push(AckRecord { kind, fcs, more, at });
            Ok(())
        }

        fn set_params(&mut self, params: &PhyParams) -> Result<(), ()> {
            self.params = Some(params.clone());
            Ok(())
        }

        fn poll(&mut self) -> Result<Option<PhyEvent>, ()> {
            Ok(self.events.pop_front())
        }
    }
}
