/// In-memory stand-ins for every hardware trait, used by unit tests and
/// on any host without the real peripherals attached. Each mock exposes
/// extra methods beyond its trait (`push_sample`, `set_unix_seconds`,
/// `transitions()`) so tests can drive it explicitly rather than reach
/// for an implicit ambient clock or a real ADC.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use metronome_protocol::error::{CoreError, CoreResult};
use metronome_protocol::ringbuf::{AudioProducer, AudioSample};

use crate::{AdcSource, GpioOutput, RtcDevice, Storage};

/// A source that does nothing until the test calls `push_sample`/`feed`.
/// `start` only records the producer handle; no background thread runs.
pub struct MockAdcSource {
    producer: Option<AudioProducer>,
}

impl MockAdcSource {
    pub fn new() -> Self {
        Self { producer: None }
    }

    /// Feed one sample directly into the connected ring buffer.
    pub fn push_sample(&self, sample: AudioSample) -> bool {
        match &self.producer {
            Some(p) => p.push(sample),
            None => false,
        }
    }
}

impl Default for MockAdcSource {
    fn default() -> Self {
        Self::new()
    }
}

impl AdcSource for MockAdcSource {
    fn start(&mut self, producer: AudioProducer, _sample_rate_hz: u32) -> CoreResult<()> {
        self.producer = Some(producer);
        Ok(())
    }

    fn stop(&mut self) {
        self.producer = None;
    }
}

/// A GPIO line that records every level change with the time it
/// happened, so relay watchdog / debounce tests can assert on
/// transition history without sleeping on real hardware.
pub struct MockGpioOutput {
    high: Arc<Mutex<bool>>,
    transitions: Arc<Mutex<Vec<(bool, std::time::Instant)>>>,
}

impl MockGpioOutput {
    pub fn new() -> Self {
        Self {
            high: Arc::new(Mutex::new(false)),
            transitions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn transitions(&self) -> Vec<(bool, std::time::Instant)> {
        self.transitions.lock().unwrap().clone()
    }
}

impl Default for MockGpioOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl GpioOutput for MockGpioOutput {
    fn set_high(&mut self) -> CoreResult<()> {
        *self.high.lock().unwrap() = true;
        self.transitions
            .lock()
            .unwrap()
            .push((true, std::time::Instant::now()));
        Ok(())
    }

    fn set_low(&mut self) -> CoreResult<()> {
        *self.high.lock().unwrap() = false;
        self.transitions
            .lock()
            .unwrap()
            .push((false, std::time::Instant::now()));
        Ok(())
    }

    fn is_high(&self) -> bool {
        *self.high.lock().unwrap()
    }
}

/// An RTC whose clock a test advances explicitly. `healthy` can be
/// flipped to simulate three consecutive I2C failures without touching
/// real hardware.
pub struct MockRtcDevice {
    unix_seconds: u64,
    pub healthy: bool,
}

impl MockRtcDevice {
    pub fn new() -> Self {
        Self {
            unix_seconds: 0,
            healthy: true,
        }
    }

    pub fn set_unix_seconds(&mut self, secs: u64) {
        self.unix_seconds = secs;
    }
}

impl Default for MockRtcDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl RtcDevice for MockRtcDevice {
    fn read_unix_seconds(&mut self) -> CoreResult<u64> {
        if !self.healthy {
            return Err(CoreError::RtcIoFailure("mock RTC set unhealthy".to_string()));
        }
        Ok(self.unix_seconds)
    }

    fn write_unix_seconds(&mut self, secs: u64) -> CoreResult<()> {
        if !self.healthy {
            return Err(CoreError::RtcIoFailure("mock RTC set unhealthy".to_string()));
        }
        self.unix_seconds = secs;
        Ok(())
    }
}

/// An in-memory key/value store standing in for `FileStorage` in tests.
/// `clone_handle` hands out another handle over the same backing map, so
/// a test can drop and recreate a `ConfigStore` against the same data to
/// exercise a save-then-reload round trip.
#[derive(Clone)]
pub struct MockStorage {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MockStorage {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn clone_handle(&self) -> Self {
        self.clone()
    }

    /// Every stored value concatenated, for tests asserting a secret
    /// never appears anywhere in the persisted form.
    pub fn dump_all_bytes(&self) -> Vec<u8> {
        self.entries
            .lock()
            .unwrap()
            .values()
            .flat_map(|v| v.iter().copied())
            .collect()
    }
}

impl Default for MockStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MockStorage {
    fn load(&self, key: &str) -> CoreResult<Option<Vec<u8>>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn save(&self, key: &str, bytes: &[u8]) -> CoreResult<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn erase_all(&self) -> CoreResult<()> {
        self.entries.lock().unwrap().clear();
        Ok(())
    }
}
