//! Shared fixtures for the driver end-to-end tests.
#![allow(dead_code)]

use bwflash_core::link::Clock;
use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

/// Clock that advances only when slept on, so the protocols' pacing delays
/// cost no wall time.
pub struct FakeClock {
    now: Instant,
    pub slept: Vec<Duration>,
}

impl FakeClock {
    pub fn new() -> Self {
        FakeClock {
            now: Instant::now(),
            slept: Vec::new(),
        }
    }
}

impl Clock for FakeClock {
    fn now(&mut self) -> Instant {
        self.now
    }

    fn sleep(&mut self, duration: Duration) {
        self.slept.push(duration);
        self.now += duration;
    }
}

/// Captures `on_progress` emissions for later assertions.
#[derive(Clone, Default)]
pub struct ProgressRecorder(Arc<Mutex<Vec<u8>>>);

impl ProgressRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self) -> impl Fn(u8) + Send + 'static {
        let values = Arc::clone(&self.0);
        move |percent| values.lock().unwrap().push(percent)
    }

    pub fn values(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }

    pub fn assert_monotonic_to_100(&self) {
        let values = self.values();
        assert!(!values.is_empty(), "no progress was emitted");
        assert!(
            values.windows(2).all(|pair| pair[0] <= pair[1]),
            "progress went backwards: {values:?}"
        );
        assert_eq!(*values.last().unwrap(), 100);
    }
}

/// A Brightway image: unique `63 7C` at 0x17080, unique `01 02` at 0x17082,
/// large enough that the signing tables sit inside it.
pub fn dfu_image() -> Arc<[u8]> {
    let mut fw = vec![0x33; 0x22000];
    fw[0x17080..0x17082].copy_from_slice(&[0x63, 0x7C]);
    fw[0x17082..0x17084].copy_from_slice(&[0x01, 0x02]);
    Arc::from(fw)
}

/// A Leqi image: dense `AA A2` header and an 800-byte `0xAA` padding run
/// ending at 0x1F40, so the derived transfer size is 0x1F80 (63 chunks).
pub fn leqi_image() -> Arc<[u8]> {
    let mut fw = vec![0x00; 0x4000];
    for i in 0..12 {
        fw[0x80 + i * 3] = 0xAA;
        fw[0x81 + i * 3] = 0xA2;
    }
    fw[0x200..0x240].fill(0xAA);
    fw[0x1C20..0x1F40].fill(0xAA);
    Arc::from(fw)
}
