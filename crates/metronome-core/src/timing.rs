/// Monotonic timing service (C1). The timing service is the one
/// genuinely process-global capability in this system; rather than reach
/// for it ambiently, every component that needs timestamps is handed a
/// `Arc<dyn TimeSource>` at construction. Tests substitute `MockClock`,
/// which advances only when told to.
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Duration as TokioDuration;
use tracing::{debug, warn};

use metronome_device::RtcDevice;
use metronome_protocol::error::{CoreError, CoreResult};

/// Anything that can hand out a monotonically non-decreasing microsecond
/// timestamp. `timestamp_us` never fails (§4.1): a timing fault degrades
/// wall-clock availability, not the monotonic stream.
pub trait TimeSource: Send + Sync {
    fn timestamp_us(&self) -> u64;
}

const HEALTH_POLL_INTERVAL: TokioDuration = TokioDuration::from_secs(60);
const UNHEALTHY_AFTER_FAILURES: u8 = 3;
const SYNC_RTC_TIMEOUT: TokioDuration = TokioDuration::from_secs(1);

struct RtcReference {
    unix_seconds: u64,
    read_at: Instant,
}

/// Real timing service: a free-running counter (here, `Instant`, which
/// Rust already guarantees is monotonic) combined with an I2C RTC for
/// wall-clock. RTC health is cached and updated by a background poll
/// loop so `timestamp_us` never blocks on the I2C bus.
pub struct TimingService {
    epoch: Instant,
    rtc: AsyncMutex<Box<dyn RtcDevice>>,
    rtc_reference: AsyncMutex<Option<RtcReference>>,
    healthy: std::sync::atomic::AtomicBool,
    consecutive_failures: AtomicU8,
    rtc_io_failures: AtomicU64,
}

impl TimingService {
    pub fn new(rtc: Box<dyn RtcDevice>) -> Self {
        Self {
            epoch: Instant::now(),
            rtc: AsyncMutex::new(rtc),
            rtc_reference: AsyncMutex::new(None),
            healthy: std::sync::atomic::AtomicBool::new(false),
            consecutive_failures: AtomicU8::new(0),
            rtc_io_failures: AtomicU64::new(0),
        }
    }

    /// Whether the RTC is currently believed healthy. Flips to false
    /// after three consecutive I2C failures observed by the health poll
    /// loop, and back to true on the next successful read.
    pub fn rtc_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Count of I2C read/write failures observed since construction.
    /// Exposed for a network-stats-style query; never fatal (§7).
    pub fn rtc_failure_count(&self) -> u64 {
        self.rtc_io_failures.load(Ordering::Relaxed)
    }

    /// Combine the cached RTC reference with elapsed monotonic time to
    /// produce a wall-clock microsecond timestamp. `None` when neither
    /// the RTC nor a prior sync has ever succeeded.
    pub async fn wall_clock_us(&self) -> Option<u64> {
        if !self.rtc_healthy() {
            return None;
        }
        let reference = self.rtc_reference.lock().await;
        let r = reference.as_ref()?;
        let elapsed = r.read_at.elapsed();
        Some(r.unix_seconds * 1_000_000 + elapsed.as_micros() as u64)
    }

    /// Attempt to set the RTC from an already-obtained reference time
    /// (a network time source lives outside the core; the caller supplies
    /// the seconds-since-epoch it resolved). Blocks for up to ~1s.
    pub async fn sync_rtc(&self, reference_unix_seconds: u64) -> CoreResult<()> {
        let result = tokio::time::timeout(SYNC_RTC_TIMEOUT, async {
            let mut rtc = self.rtc.lock().await;
            rtc.write_unix_seconds(reference_unix_seconds)
        })
        .await;

        match result {
            Ok(Ok(())) => {
                self.record_rtc_success(reference_unix_seconds).await;
                Ok(())
            }
            Ok(Err(e)) => {
                self.record_rtc_failure();
                Err(e)
            }
            Err(_) => {
                self.record_rtc_failure();
                Err(CoreError::TimeSourceUnavailable)
            }
        }
    }

    async fn record_rtc_success(&self, unix_seconds: u64) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.healthy.store(true, Ordering::Release);
        *self.rtc_reference.lock().await = Some(RtcReference {
            unix_seconds,
            read_at: Instant::now(),
        });
    }

    fn record_rtc_failure(&self) {
        self.rtc_io_failures.fetch_add(1, Ordering::Relaxed);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= UNHEALTHY_AFTER_FAILURES {
            self.healthy.store(false, Ordering::Release);
        }
    }

    /// One health-check poll: read the RTC and update cached health.
    /// Never panics or propagates — failures are recorded, not raised,
    /// per the `rtc_io_failure` policy (§7).
    async fn poll_once(&self) {
        let read = {
            let mut rtc = self.rtc.lock().await;
            rtc.read_unix_seconds()
        };
        match read {
            Ok(secs) => {
                self.record_rtc_success(secs).await;
                debug!(unix_seconds = secs, "RTC health poll succeeded");
            }
            Err(e) => {
                self.record_rtc_failure();
                warn!("RTC health poll failed: {e}");
            }
        }
    }

    /// Runs forever on a 60s cadence until the task is aborted by the
    /// caller. Intended to be spawned once at boot.
    pub async fn run_health_monitor(self: Arc<Self>) {
        let mut interval = tokio::time::interval(HEALTH_POLL_INTERVAL);
        loop {
            interval.tick().await;
            self.poll_once().await;
        }
    }
}

impl TimeSource for TimingService {
    fn timestamp_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }
}

/// A clock a test advances explicitly. Never touches real time; two
/// calls to `timestamp_us` return the same value until `advance` runs.
pub struct MockClock {
    now_us: AtomicU64,
}

impl MockClock {
    pub fn new() -> Self {
        Self {
            now_us: AtomicU64::new(0),
        }
    }

    pub fn starting_at(initial_us: u64) -> Self {
        Self {
            now_us: AtomicU64::new(initial_us),
        }
    }

    pub fn advance(&self, micros: u64) {
        self.now_us.fetch_add(micros, Ordering::SeqCst);
    }

    pub fn set(&self, us: u64) {
        self.now_us.store(us, Ordering::SeqCst);
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MockClock {
    fn timestamp_us(&self) -> u64 {
        self.now_us.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metronome_device::mock::MockRtcDevice;

    #[test]
    fn mock_clock_only_advances_when_told() {
        let clock = MockClock::new();
        assert_eq!(clock.timestamp_us(), 0);
        assert_eq!(clock.timestamp_us(), 0);
        clock.advance(1_000);
        assert_eq!(clock.timestamp_us(), 1_000);
    }

    #[test]
    fn real_timestamps_are_non_decreasing() {
        let service = TimingService::new(Box::new(MockRtcDevice::new()));
        let t1 = service.timestamp_us();
        let t2 = service.timestamp_us();
        assert!(t2 >= t1);
    }

    #[tokio::test]
    async fn starts_unhealthy_until_first_successful_poll() {
        let service = TimingService::new(Box::new(MockRtcDevice::new()));
        assert!(!service.rtc_healthy());
        service.poll_once().await;
        assert!(service.rtc_healthy());
    }

    #[tokio::test]
    async fn three_consecutive_failures_marks_unhealthy() {
        let mut rtc = MockRtcDevice::new();
        rtc.healthy = false;
        let service = TimingService::new(Box::new(rtc));
        for _ in 0..UNHEALTHY_AFTER_FAILURES {
            service.poll_once().await;
        }
        assert!(!service.rtc_healthy());
        assert_eq!(service.rtc_failure_count(), UNHEALTHY_AFTER_FAILURES as u64);
    }

    #[tokio::test]
    async fn sync_rtc_updates_wall_clock() {
        let service = TimingService::new(Box::new(MockRtcDevice::new()));
        service.sync_rtc(1_700_000_000).await.unwrap();
        let wall = service.wall_clock_us().await.unwrap();
        assert!(wall >= 1_700_000_000 * 1_000_000);
    }

    #[tokio::test]
    async fn wall_clock_unavailable_before_any_sync() {
        let service = TimingService::new(Box::new(MockRtcDevice::new()));
        assert!(service.wall_clock_us().await.is_none());
    }
}
