//! PHY parameter calculator
//!
//! Derives usable sub-carrier counts, bits-per-carrier, Reed-Solomon
//! sizing, maximum segment payloads and padding from the modulation,
//! tone map and tone mask in use.
//
// https://github.com/rust-iot/rust-plc-mac
// Copyright 2021 Ryan Kurte

use log::warn;

use crate::frame::FCS_LEN;
use crate::MAX_MSDU_LEN;

/// Maximum Reed-Solomon block size (data + parity) in bytes
pub const MAX_RS_BLOCK: usize = 255;

/// Per-carrier bitmap, sized for the largest band (72 carriers, FCC)
pub type ToneMap = [u8; 9];

/// Tone map with every carrier enabled
pub const TONE_MAP_ALL: ToneMap = [0xff; 9];

/// Operating band
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Band {
    CenelecA,
    CenelecB,
    Fcc,
    Arib,
}

/// Static per-band PHY capabilities and interframe timings
#[derive(Debug, Clone, PartialEq)]
pub struct BandPlan {
    /// Number of data sub-carriers
    pub carriers: usize,
    /// Fallback carrier count for an unconfigured tone mask
    pub default_carriers: usize,
    /// Pilot carrier spacing (coherent scheme)
    pub pilot_spacing: usize,
    /// Maximum data symbols per frame
    pub max_symbols: usize,

    /// Single symbol duration in microseconds
    pub symbol_us: u64,
    /// CSMA slot time in microseconds
    pub slot_us: u64,
    /// Contention interframe space
    pub cifs_us: u64,
    /// Shortened interframe space preceding a retransmission
    pub cifs_retransmit_us: u64,
    /// Extended interframe space after an ambiguous PHY event
    pub eifs_us: u64,
    /// Contention period duration
    pub contention_us: u64,
    /// Receiver turnaround time before an acknowledgement
    pub response_us: u64,
    /// Acknowledgement on-air duration
    pub ack_us: u64,
}

const PLAN_CENELEC_A: BandPlan = BandPlan {
    carriers: 36,
    default_carriers: 36,
    pilot_spacing: 12,
    max_symbols: 216,
    symbol_us: 695,
    slot_us: 1710,
    cifs_us: 5400,
    cifs_retransmit_us: 2700,
    eifs_us: 99_000,
    contention_us: 10_000,
    response_us: 5220,
    ack_us: 2400,
};

const PLAN_CENELEC_B: BandPlan = BandPlan {
    carriers: 16,
    default_carriers: 16,
    pilot_spacing: 12,
    max_symbols: 216,
    symbol_us: 695,
    slot_us: 1710,
    cifs_us: 5400,
    cifs_retransmit_us: 2700,
    eifs_us: 99_000,
    contention_us: 10_000,
    response_us: 5220,
    ack_us: 2400,
};

const PLAN_FCC: BandPlan = BandPlan {
    carriers: 72,
    default_carriers: 72,
    pilot_spacing: 12,
    max_symbols: 511,
    symbol_us: 232,
    slot_us: 570,
    cifs_us: 1800,
    cifs_retransmit_us: 900,
    eifs_us: 33_000,
    contention_us: 4000,
    response_us: 1740,
    ack_us: 800,
};

const PLAN_ARIB: BandPlan = BandPlan {
    carriers: 54,
    default_carriers: 54,
    pilot_spacing: 12,
    max_symbols: 511,
    symbol_us: 232,
    slot_us: 570,
    cifs_us: 1800,
    cifs_retransmit_us: 900,
    eifs_us: 33_000,
    contention_us: 4000,
    response_us: 1740,
    ack_us: 800,
};

impl Band {
    pub fn plan(&self) -> &'static BandPlan {
        match self {
            Band::CenelecA => &PLAN_CENELEC_A,
            Band::CenelecB => &PLAN_CENELEC_B,
            Band::Fcc => &PLAN_FCC,
            Band::Arib => &PLAN_ARIB,
        }
    }
}

/// Modulation type, ordered by robustness (most robust first)
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(strum::Display)]
pub enum Modulation {
    Robust,
    Bpsk,
    Qpsk,
    Psk8,
    Qam16,
}

impl Modulation {
    /// Data bits carried per sub-carrier per symbol
    pub fn bits_per_carrier(&self) -> usize {
        match self {
            Modulation::Robust | Modulation::Bpsk => 1,
            Modulation::Qpsk => 2,
            Modulation::Psk8 => 3,
            Modulation::Qam16 => 4,
        }
    }

    /// FEC repetition factor
    pub fn repetition(&self) -> usize {
        match self {
            Modulation::Robust => 4,
            _ => 1,
        }
    }

    /// Reed-Solomon parity bytes per block
    pub fn rs_parity(&self) -> usize {
        match self {
            Modulation::Robust => 8,
            _ => 16,
        }
    }

    /// One notch more robust; saturates at robust mode
    pub fn downgrade(&self) -> Modulation {
        match self {
            Modulation::Qam16 => Modulation::Psk8,
            Modulation::Psk8 => Modulation::Qpsk,
            Modulation::Qpsk => Modulation::Bpsk,
            _ => Modulation::Robust,
        }
    }
}

/// Modulation scheme
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ModulationScheme {
    Differential,
    Coherent,
}

/// Snapshot of the transmit parameters in force for one attempt.
/// Recomputed at request start and on every modulation downgrade.
#[derive(Debug, Clone, PartialEq)]
pub struct PhyParams {
    pub band: Band,
    pub modulation: Modulation,
    pub scheme: ModulationScheme,
    pub tone_map: ToneMap,
    pub tone_mask: ToneMap,
    /// Transmit gain per carrier group
    pub gain: [u8; 9],
    /// Split the payload over two Reed-Solomon blocks (FCC only)
    pub two_rs_blocks: bool,
}

impl PhyParams {
    pub fn new(band: Band) -> Self {
        Self {
            band,
            modulation: Modulation::Bpsk,
            scheme: ModulationScheme::Differential,
            tone_map: TONE_MAP_ALL,
            tone_mask: TONE_MAP_ALL,
            gain: [0u8; 9],
            two_rs_blocks: false,
        }
    }

    /// Usable data sub-carriers: tone map AND tone mask, less pilot
    /// carriers under the coherent scheme.
    ///
    /// An empty map falls back to the band default rather than
    /// producing zero-width symbols.
    pub fn used_carriers(&self) -> usize {
        let plan = self.band.plan();

        let mut used = 0;
        for i in 0..plan.carriers {
            let byte = i / 8;
            let bit = i % 8;
            if self.tone_map[byte] & self.tone_mask[byte] & (1 << bit) != 0 {
                used += 1;
            }
        }

        if used == 0 {
            warn!("Empty tone map, falling back to {} carriers", plan.default_carriers);
            used = plan.default_carriers;
        }

        if self.scheme == ModulationScheme::Coherent {
            let pilots = (used + plan.pilot_spacing - 1) / plan.pilot_spacing;
            used -= pilots;
        }

        used
    }

    /// Data bits per OFDM symbol
    pub fn bits_per_symbol(&self) -> usize {
        self.used_carriers() * self.modulation.bits_per_carrier()
    }

    fn rs_blocks(&self) -> usize {
        if self.two_rs_blocks && self.band == Band::Fcc {
            2
        } else {
            1
        }
    }

    /// Data bytes per Reed-Solomon block after parity
    pub fn rs_block_data(&self) -> usize {
        let plan = self.band.plan();
        let rep = self.modulation.repetition();

        // Raw byte budget over the whole frame, integer truncation
        let raw = self.bits_per_symbol() * plan.max_symbols / (8 * rep);
        let per_block = raw / self.rs_blocks();

        per_block.min(MAX_RS_BLOCK).saturating_sub(self.modulation.rs_parity())
    }

    /// Maximum physical payload bytes per segment (header + MSDU + FCS)
    pub fn max_physical_payload(&self) -> usize {
        self.rs_block_data() * self.rs_blocks()
    }

    /// Maximum MSDU bytes per segment given the frame header overhead
    pub fn max_segment_payload(&self, overhead: usize) -> usize {
        self.max_physical_payload()
            .saturating_sub(overhead + FCS_LEN)
            .min(MAX_MSDU_LEN)
    }

    /// Padding required to round a candidate frame length up to whole
    /// Reed-Solomon blocks
    pub fn padding_for(&self, len: usize) -> usize {
        let block = self.rs_block_data();
        if block == 0 {
            return 0;
        }

        match len % block {
            0 => 0,
            r => block - r,
        }
    }

    /// Number of symbols required to carry `len` bytes
    pub fn symbols_for(&self, len: usize) -> usize {
        let bits = self.bits_per_symbol();
        let total = len * 8 * self.modulation.repetition();

        (total + bits - 1) / bits
    }

    /// Estimated on-air duration for a frame of `len` bytes
    pub fn frame_duration_us(&self, len: usize) -> u64 {
        self.symbols_for(len) as u64 * self.band.plan().symbol_us
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn carrier_counting() {
        let mut p = PhyParams::new(Band::CenelecA);
        assert_eq!(p.used_carriers(), 36);

        // Mask away the upper half of the band
        p.tone_mask = [0xff, 0xff, 0x03, 0, 0, 0, 0, 0, 0];
        assert_eq!(p.used_carriers(), 18);

        // Coherent scheme reserves pilots
        p.tone_mask = TONE_MAP_ALL;
        p.scheme = ModulationScheme::Coherent;
        assert_eq!(p.used_carriers(), 36 - 3);
    }

    #[test]
    fn empty_tone_map_falls_back_to_band_default() {
        let mut p = PhyParams::new(Band::CenelecB);
        p.tone_map = [0u8; 9];

        assert_eq!(p.used_carriers(), 16);
        assert!(p.bits_per_symbol() > 0);
    }

    #[test]
    fn bits_per_carrier_ladder() {
        let mut p = PhyParams::new(Band::CenelecA);

        p.modulation = Modulation::Robust;
        assert_eq!(p.bits_per_symbol(), 36);
        p.modulation = Modulation::Qpsk;
        assert_eq!(p.bits_per_symbol(), 72);
        p.modulation = Modulation::Psk8;
        assert_eq!(p.bits_per_symbol(), 108);
        p.modulation = Modulation::Qam16;
        assert_eq!(p.bits_per_symbol(), 144);
    }

    #[test]
    fn payload_sizing_cenelec_bpsk() {
        let p = PhyParams::new(Band::CenelecA);

        // 36 carriers * 216 symbols / 8 = 972 raw bytes, clamped to one
        // 255-byte block less 16 parity bytes
        assert_eq!(p.rs_block_data(), 239);
        assert_eq!(p.max_physical_payload(), 239);
        assert_eq!(p.max_segment_payload(12), 239 - 12 - FCS_LEN);
    }

    #[test]
    fn robust_mode_shrinks_payload() {
        let mut p = PhyParams::new(Band::CenelecA);
        let normal = p.max_physical_payload();

        p.modulation = Modulation::Robust;
        assert!(p.max_physical_payload() < normal);
    }

    #[test]
    fn two_rs_blocks_fcc_only() {
        let mut p = PhyParams::new(Band::Fcc);
        let single = p.max_physical_payload();

        p.two_rs_blocks = true;
        assert_eq!(p.max_physical_payload(), single * 2);

        // Ignored outside the FCC band
        let mut p = PhyParams::new(Band::CenelecA);
        p.two_rs_blocks = true;
        assert_eq!(p.max_physical_payload(), 239);
    }

    #[test]
    fn padding_rounds_to_whole_blocks() {
        let p = PhyParams::new(Band::CenelecA);
        let block = p.rs_block_data();

        assert_eq!(p.padding_for(block), 0);
        assert_eq!(p.padding_for(1), block - 1);
        assert_eq!(p.padding_for(block + 1), block - 1);
        assert_eq!(p.padding_for(2 * block), 0);
    }

    #[test]
    fn modulation_downgrade_ladder() {
        let mut m = Modulation::Qam16;
        let mut seen = std::vec::Vec::new();

        for _ in 0..6 {
            seen.push(m);
            m = m.downgrade();
        }

        assert_eq!(
            &seen[..5],
            &[
                Modulation::Qam16,
                Modulation::Psk8,
                Modulation::Qpsk,
                Modulation::Bpsk,
                Modulation::Robust
            ]
        );
        assert_eq!(m, Modulation::Robust);
    }
}
