//! MAC error types
//
// https://github.com/rust-iot/rust-plc-mac
// Copyright 2021 Ryan Kurte

use crate::frame::FrameError;

/// Basic MAC errors
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MacError<E> {
    /// A transmit request is already in flight
    TransmitPending,

    /// Submitted payload exceeds the maximum MSDU size
    PayloadTooLong(usize),

    /// Submitted payload is empty
    PayloadEmpty,

    /// Frame encode/decode error
    Frame(FrameError),

    /// Wrapper for unhandled / underlying PHY errors
    Phy(E),
}

impl<E> From<FrameError> for MacError<E> {
    fn from(e: FrameError) -> Self {
        MacError::Frame(e)
    }
}
