
#![no_std]

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod timer;

pub mod error;

pub mod frame;

pub mod params;

pub mod phy;

pub mod seg;

pub mod mac;

pub mod prelude;


/// Timestamps are 64-bit ticks of the virtual clock, in microseconds
pub type Ts = u64;

/// Maximum payload accepted from the upper layer per transmit request
pub const MAX_MSDU_LEN: usize = 400;

/// Maximum on-air frame size (header + payload + padding + FCS)
pub const MAX_FRAME_LEN: usize = 512;
