//! MAC configuration
//
// https://github.com/rust-iot/rust-plc-mac
// Copyright 2021 Ryan Kurte

use crate::frame::Address;
use crate::params::Band;

/// Configuration for the CSMA/CA backoff engine
#[derive(Debug, Clone, PartialEq)]
pub struct CsmaConfig {
    /// Minimum backoff exponent, window floor is 2^min_be slots
    pub min_be: u8,

    /// Maximum backoff exponent, window cap is 2^max_be slots
    pub max_be: u8,

    /// Attempt budget before a channel-access-failure is reported
    pub max_csma_backoffs: u32,

    /// High-priority backoff window size in slots
    pub high_priority_window: u32,

    /// Normal-priority fairness attempt limit (NBF threshold)
    pub fairness_limit: u32,

    /// Fairness window shrink factor (A): shrink by A * minimum window
    pub cw_shrink_factor: u32,

    /// Apply the fairness shrink on every K-th attempt
    pub cw_shrink_every: u32,

    /// Consecutive minimum-window transmissions before the window is
    /// forced back to maximum
    pub min_cw_streak: u32,

    /// Cap broadcast destinations at the maximum window
    pub cap_broadcast_window: bool,
}

impl Default for CsmaConfig {
    fn default() -> Self {
        Self {
            min_be: 3,
            max_be: 8,
            max_csma_backoffs: 50,
            high_priority_window: 7,
            fairness_limit: 25,
            cw_shrink_factor: 8,
            cw_shrink_every: 5,
            min_cw_streak: 10,
            cap_broadcast_window: true,
        }
    }
}

impl CsmaConfig {
    pub fn min_window(&self) -> u32 {
        1 << self.min_be
    }

    pub fn max_window(&self) -> u32 {
        1 << self.max_be
    }
}

/// Configuration for the MAC state machine
#[derive(Debug, Clone, PartialEq)]
pub struct MacConfig {
    /// Operating band, selects PHY capabilities and timings
    pub band: Band,

    /// Transmission attempt budget per request
    pub max_frame_retries: u8,

    /// Force robust mode once this many retries remain
    pub force_robust_retries: u8,

    /// Minimum lead time before the end of the contention period for a
    /// transmission to still be scheduled, in microseconds
    pub tx_lead_us: u64,
}

impl Default for MacConfig {
    fn default() -> Self {
        Self {
            band: Band::CenelecA,
            max_frame_retries: 5,
            force_robust_retries: 1,
            tx_lead_us: 2000,
        }
    }
}

/// Local addressing configuration
#[derive(Debug, Clone, PartialEq)]
pub struct AddressConfig {
    pub pan_id: u16,

    pub short_address: Option<u16>,

    pub extended_address: Option<u64>,
}

impl AddressConfig {
    pub fn new(pan_id: u16, short_address: u16) -> Self {
        Self {
            pan_id,
            short_address: Some(short_address),
            extended_address: None,
        }
    }

    /// Preferred source address for outgoing frames
    pub fn get(&self) -> Address {
        if let Some(s) = self.short_address {
            return Address::Short(s);
        }
        if let Some(e) = self.extended_address {
            return Address::Extended(e);
        }

        Address::None
    }
}
