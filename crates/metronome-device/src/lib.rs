/// Hardware abstraction for the rehearsal-room metronome: the analog
/// sample source, the relay GPIO line, the I2C real-time clock, and the
/// non-volatile key-value store the configuration snapshot is mirrored
/// to. Each concern is a small trait with one real Linux implementation
/// and one in-memory mock, so the core crate's hot path and tests never
/// need to know which side of the boundary they're running on.
pub mod mock;
pub mod platform;
pub mod storage;

use metronome_protocol::error::CoreResult;
use metronome_protocol::ringbuf::AudioProducer;

/// Drives the ADC sample-ready interrupt path: once started, pushes a
/// continuous stream of samples into the given ring buffer producer at
/// roughly `sample_rate_hz`. The producer half is SPSC, so only one
/// `AdcSource` may ever be started against a given ring buffer.
pub trait AdcSource: Send {
    fn start(&mut self, producer: AudioProducer, sample_rate_hz: u32) -> CoreResult<()>;
    fn stop(&mut self);
}

/// A single digital output line driving the relay. HIGH energizes the
/// relay coil; the safety invariant that GPIO never stays HIGH longer
/// than the watchdog deadline is enforced by the output controller, not
/// by this trait — this is just the wire.
pub trait GpioOutput: Send {
    fn set_high(&mut self) -> CoreResult<()>;
    fn set_low(&mut self) -> CoreResult<()>;
    fn is_high(&self) -> bool;
}

/// The I2C real-time clock peripheral. Reads and writes are in whole
/// seconds since the Unix epoch; sub-second precision comes from the
/// timing service's free-running counter, not from the RTC.
pub trait RtcDevice: Send {
    fn read_unix_seconds(&mut self) -> CoreResult<u64>;
    fn write_unix_seconds(&mut self, secs: u64) -> CoreResult<()>;
}

/// Non-volatile key-value storage backing the configuration store.
/// Implementations need not be fast — `save()` is a suspension point by
/// design (§5) — but must be crash-atomic: a save that is interrupted
/// partway through must never leave a key half-written.
pub trait Storage: Send + Sync {
    fn load(&self, key: &str) -> CoreResult<Option<Vec<u8>>>;
    fn save(&self, key: &str, bytes: &[u8]) -> CoreResult<()>;
    fn erase_all(&self) -> CoreResult<()>;
}

/// Build the platform-appropriate ADC source. On Linux this reads an
/// SPI-attached ADC (MCP3008-style); elsewhere, a mock that must be
/// fed samples explicitly by the caller.
pub fn create_adc_source() -> Box<dyn AdcSource> {
    #[cfg(target_os = "linux")]
    {
        match platform::linux::SpiAdcSource::new() {
            Ok(dev) => return Box::new(dev),
            Err(e) => {
                tracing::warn!("falling back to mock ADC source: {e}");
            }
        }
    }
    Box::new(mock::MockAdcSource::new())
}

/// Build the platform-appropriate relay GPIO output on the given BCM pin.
pub fn create_gpio_output(pin: u8) -> Box<dyn GpioOutput> {
    #[cfg(target_os = "linux")]
    {
        match platform::linux::RppalGpioOutput::new(pin) {
            Ok(dev) => return Box::new(dev),
            Err(e) => {
                tracing::warn!("falling back to mock GPIO output: {e}");
            }
        }
    }
    Box::new(mock::MockGpioOutput::new())
}

/// Build the platform-appropriate RTC device on the given I2C bus.
pub fn create_rtc_device(i2c_bus: u8) -> Box<dyn RtcDevice> {
    #[cfg(target_os = "linux")]
    {
        match platform::linux::Ds3231RtcDevice::new(i2c_bus) {
            Ok(dev) => return Box::new(dev),
            Err(e) => {
                tracing::warn!("falling back to mock RTC device: {e}");
            }
        }
    }
    Box::new(mock::MockRtcDevice::new())
}

/// Build a real, file-backed key-value store rooted at `dir`. Available
/// on every platform — this is plain filesystem I/O, not a hardware
/// peripheral.
pub fn create_storage(dir: std::path::PathBuf) -> Box<dyn Storage> {
    Box::new(storage::FileStorage::new(dir))
}
