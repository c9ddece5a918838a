/// Raspberry Pi hardware bindings: a digital output for the relay, an
/// SPI-attached ADC for the microphone front end, and an I2C real-time
/// clock. All three talk to `rppal`, which wraps `/dev/gpiomem`,
/// `/dev/spidevN.N` and `/dev/i2c-N` directly — no kernel module beyond
/// what the Pi's device tree already exposes.
use std::thread;
use std::time::{Duration, Instant};

use rppal::gpio::{Gpio, OutputPin};
use rppal::i2c::I2c;
use rppal::spi::{Bus, Mode, SlaveSelect, Spi};
use tracing::{info, warn};

use metronome_protocol::error::{CoreError, CoreResult};
use metronome_protocol::ringbuf::{AudioProducer, AudioSample};

use crate::{AdcSource, GpioOutput, RtcDevice};

/// MCP3008-style single-channel SPI ADC. Sampling is driven by a
/// dedicated thread spinning at the target rate rather than a true
/// hardware interrupt — the Pi has no ADC-ready GPIO line, so this
/// thread stands in for the ISR described in the concurrency model.
pub struct SpiAdcSource {
    spi: Option<Spi>,
    channel: u8,
    stop: Option<std::sync::Arc<std::sync::atomic::AtomicBool>>,
    sampler: Option<thread::JoinHandle<()>>,
}

impl SpiAdcSource {
    pub fn new() -> CoreResult<Self> {
        let spi = Spi::new(Bus::Spi0, SlaveSelect::Ss0, 1_350_000, Mode::Mode0)
            .map_err(|e| CoreError::StorageFailure(format!("SPI open failed: {e}")))?;
        Ok(Self {
            spi: Some(spi),
            channel: 0,
            stop: None,
            sampler: None,
        })
    }

    /// MCP3008 single-ended read: 3-byte transaction, 10-bit result in
    /// the low bits of the last two bytes.
    fn read_raw(spi: &Spi, channel: u8) -> CoreResult<u16> {
        let tx = [0x01, (0x08 | channel) << 4, 0x00];
        let mut rx = [0u8; 3];
        spi.transfer(&mut rx, &tx)
            .map_err(|e| CoreError::StorageFailure(format!("SPI transfer failed: {e}")))?;
        let value = ((rx[1] as u16 & 0x03) << 8) | rx[2] as u16;
        // Scale the MCP3008's 10-bit range to the 12-bit sample domain.
        Ok(value << 2)
    }
}

impl AdcSource for SpiAdcSource {
    fn start(&mut self, producer: AudioProducer, sample_rate_hz: u32) -> CoreResult<()> {
        let spi = self
            .spi
            .take()
            .ok_or_else(|| CoreError::StorageFailure("ADC already started".to_string()))?;
        let channel = self.channel;
        let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        self.stop = Some(std::sync::Arc::clone(&stop));

        let period = Duration::from_secs_f64(1.0 / sample_rate_hz as f64);
        let handle = thread::Builder::new()
            .name("metronome-adc".to_string())
            .spawn(move || {
                let start = Instant::now();
                let mut next = start;
                while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                    match Self::read_raw(&spi, channel) {
                        Ok(value) => {
                            let timestamp_us = start.elapsed().as_micros() as u64;
                            producer.push_overwrite(AudioSample {
                                value,
                                timestamp_us,
                            });
                        }
                        Err(e) => warn!("ADC read failed: {e}"),
                    }
                    next += period;
                    let now = Instant::now();
                    if next > now {
                        thread::sleep(next - now);
                    } else {
                        next = now;
                    }
                }
            })
            .map_err(|e| CoreError::StorageFailure(format!("ADC thread spawn failed: {e}")))?;

        self.sampler = Some(handle);
        info!(sample_rate_hz, "SPI ADC sampling started");
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop.store(true, std::sync::atomic::Ordering::Relaxed);
        }
        if let Some(handle) = self.sampler.take() {
            let _ = handle.join();
        }
    }
}

/// A single BCM GPIO pin driving the relay.
pub struct RppalGpioOutput {
    pin: OutputPin,
}

impl RppalGpioOutput {
    pub fn new(bcm_pin: u8) -> CoreResult<Self> {
        let gpio =
            Gpio::new().map_err(|e| CoreError::StorageFailure(format!("GPIO open failed: {e}")))?;
        let mut pin = gpio
            .get(bcm_pin)
            .map_err(|e| CoreError::StorageFailure(format!("GPIO pin {bcm_pin} unavailable: {e}")))?
            .into_output();
        // Safety invariant: GPIO is low at boot.
        pin.set_low();
        Ok(Self { pin })
    }
}

impl GpioOutput for RppalGpioOutput {
    fn set_high(&mut self) -> CoreResult<()> {
        self.pin.set_high();
        Ok(())
    }

    fn set_low(&mut self) -> CoreResult<()> {
        self.pin.set_low();
        Ok(())
    }

    fn is_high(&self) -> bool {
        self.pin.is_set_high()
    }
}

impl Drop for RppalGpioOutput {
    fn drop(&mut self) {
        self.pin.set_low();
    }
}

const DS3231_ADDRESS: u16 = 0x68;

/// DS3231-style I2C real-time clock. Registers 0x00-0x06 hold BCD
/// seconds/minutes/hours/day/date/month/year; this implementation only
/// needs seconds-since-epoch, so it converts through `time`'s civil
/// calendar math at the boundary.
pub struct Ds3231RtcDevice {
    i2c: I2c,
}

impl Ds3231RtcDevice {
    pub fn new(bus: u8) -> CoreResult<Self> {
        let mut i2c = I2c::with_bus(bus)
            .map_err(|e| CoreError::RtcIoFailure(format!("I2C bus {bus} open failed: {e}")))?;
        i2c.set_slave_address(DS3231_ADDRESS)
            .map_err(|e| CoreError::RtcIoFailure(format!("I2C address set failed: {e}")))?;
        Ok(Self { i2c })
    }

    fn bcd_to_bin(b: u8) -> u8 {
        (b & 0x0F) + ((b >> 4) * 10)
    }

    fn bin_to_bcd(b: u8) -> u8 {
        ((b / 10) << 4) | (b % 10)
    }
}

impl RtcDevice for Ds3231RtcDevice {
    fn read_unix_seconds(&mut self) -> CoreResult<u64> {
        let mut regs = [0u8; 7];
        self.i2c
            .write_read(&[0x00], &mut regs)
            .map_err(|e| CoreError::RtcIoFailure(format!("RTC register read failed: {e}")))?;

        let second = Self::bcd_to_bin(regs[0] & 0x7F);
        let minute = Self::bcd_to_bin(regs[1] & 0x7F);
        let hour = Self::bcd_to_bin(regs[2] & 0x3F);
        let day_of_month = Self::bcd_to_bin(regs[4] & 0x3F);
        let month = Self::bcd_to_bin(regs[5] & 0x1F);
        let year = 2000 + Self::bcd_to_bin(regs[6]) as u32;

        days_and_time_to_unix(year, month, day_of_month, hour, minute, second)
    }

    fn write_unix_seconds(&mut self, secs: u64) -> CoreResult<()> {
        let (year, month, day, hour, minute, second) = unix_to_civil(secs);
        let regs = [
            0x00,
            Self::bin_to_bcd(second),
            Self::bin_to_bcd(minute),
            Self::bin_to_bcd(hour),
            1, // day-of-week, unused by this implementation
            Self::bin_to_bcd(day),
            Self::bin_to_bcd(month),
            Self::bin_to_bcd((year - 2000) as u8),
        ];
        self.i2c
            .write(&regs)
            .map_err(|e| CoreError::RtcIoFailure(format!("RTC register write failed: {e}")))?;
        Ok(())
    }
}

/// Days-since-epoch civil calendar conversion (Howard Hinnant's
/// `days_from_civil` algorithm), extended with a time-of-day offset.
fn days_and_time_to_unix(
    year: u32,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    second: u8,
) -> CoreResult<u64> {
    let y = if month <= 2 { year as i64 - 1 } else { year as i64 };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as i64;
    let mp = (month as i64 + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    let days = era * 146_097 + doe - 719_468;

    if days < 0 {
        return Err(CoreError::RtcIoFailure(
            "RTC reported a date before the Unix epoch".to_string(),
        ));
    }

    Ok(days as u64 * 86_400 + hour as u64 * 3600 + minute as u64 * 60 + second as u64)
}

fn unix_to_civil(secs: u64) -> (u32, u8, u8, u8, u8, u8) {
    let days = (secs / 86_400) as i64;
    let time_of_day = secs % 86_400;
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u8;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u8;
    let year = (if month <= 2 { y + 1 } else { y }) as u32;

    let hour = (time_of_day / 3600) as u8;
    let minute = ((time_of_day % 3600) / 60) as u8;
    let second = (time_of_day % 60) as u8;
    (year, month, day, hour, minute, second)
}
