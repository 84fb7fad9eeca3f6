//! PLC MAC crate prelude
//
// https://github.com/rust-iot/rust-plc-mac
// Copyright 2021 Ryan Kurte

pub use crate::{Ts, MAX_FRAME_LEN, MAX_MSDU_LEN};

pub use crate::error::MacError;
pub use crate::timer::Timer as MacTimer;

pub use crate::frame::{Address, Frame, FrameError, SecurityHeader};

pub use crate::params::{Band, Modulation, ModulationScheme, PhyParams, ToneMap};

pub use crate::phy::{AckKind, Phy, PhyEvent, PhyTxStatus};

pub use crate::mac::core::MacRt;
pub use crate::mac::config::{AddressConfig, CsmaConfig, MacConfig};
pub use crate::mac::{MacHandler, TxOutcome, TxRequest};
