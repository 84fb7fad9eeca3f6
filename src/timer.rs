//! MAC virtual clock API
//
// https://github.com/rust-iot/rust-plc-mac
// Copyright 2021 Ryan Kurte

/// Timer trait provides access to the free-running virtual clock
/// driving all MAC scheduling decisions.
///
/// All methods are monotonic and relative to the same unknown epoc
pub trait Timer {
    /// Returns the number of millisecond ticks since some unknown epoc
    fn ticks_ms(&self) -> u64;

    /// Returns the number of microsecond ticks since some unknown epoc
    fn ticks_us(&self) -> u64;
}

#[cfg(any(test, feature = "mocks"))]
pub mod mock {
    use std::sync::{Arc, Mutex};

    /// Mock timer implementation to assist with testing
    #[derive(Clone, Debug)]
    pub struct MockTimer(Arc<Mutex<u64>>);

    impl MockTimer {
        pub fn new() -> Self {
            Self(Arc::new(Mutex::new(0)))
        }

        pub fn set_us(&mut self, val: u64) {
            *self.0.lock().unwrap() = val;
        }

        /// Advance the virtual clock by the provided number of microseconds
        pub fn advance_us(&mut self, val: u64) {
            let mut v = self.0.lock().unwrap();
            *v += val;
        }

        pub fn val(&self) -> u64 {
            *self.0.lock().unwrap()
        }
    }

    impl super::Timer for MockTimer {
        fn ticks_ms(&self) -> u64 {
            let v = self.0.lock().unwrap();
            return *v / 1000;
        }

        fn ticks_us(&self) -> u64 {
            let v = self.0.lock().unwrap();
            return *v;
        }
    }
}
