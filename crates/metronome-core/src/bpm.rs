/// BPM estimation engine (C4): aggregates beat-event timestamps into a
/// tempo estimate with outlier rejection, stability scoring, and
/// half/double-tempo correction. Like the audio engine, this runs
/// synchronously — `add_tap` is called from the same context that drains
/// beat events, never from a background task.
use metronome_protocol::config::BpmConfig;
use metronome_protocol::TAP_BUFFER_CAPACITY as TAP_CAPACITY;

const MIN_TAPS_FOR_ESTIMATE: usize = 4;
const OUTLIER_FACTOR: f64 = 2.0;
const CORRECTION_WINDOW: usize = 5;
const CORRECTION_TOLERANCE: f64 = 0.10;
const HYSTERESIS_MIN_BPM: f64 = 2.0;
const HYSTERESIS_FRACTION: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BpmUpdate {
    pub bpm: f64,
    pub tap_count: usize,
    pub stable: bool,
    pub timestamp_us: u64,
    pub corrected: bool,
}

/// Fixed-capacity circular sequence of tap timestamps, oldest-overwritten.
struct TapBuffer {
    taps: [u64; TAP_CAPACITY],
    next: usize,
    count: usize,
}

impl TapBuffer {
    fn new() -> Self {
        Self {
            taps: [0; TAP_CAPACITY],
            next: 0,
            count: 0,
        }
    }

    fn push(&mut self, ts: u64) {
        self.taps[self.next] = ts;
        self.next = (self.next + 1) % TAP_CAPACITY;
        self.count = (self.count + 1).min(TAP_CAPACITY);
    }

    fn clear(&mut self) {
        self.next = 0;
        self.count = 0;
    }

    fn len(&self) -> usize {
        self.count
    }

    /// Oldest-to-newest snapshot of the currently held taps.
    fn ordered(&self) -> Vec<u64> {
        let oldest = if self.count < TAP_CAPACITY { 0 } else { self.next };
        (0..self.count)
            .map(|i| self.taps[(oldest + i) % TAP_CAPACITY])
            .collect()
    }
}

type UpdateCallback = Box<dyn FnMut(BpmUpdate) + Send>;

pub struct BpmEngine {
    config: BpmConfig,
    buffer: TapBuffer,
    current_bpm: Option<f64>,
    stable: bool,
    last_emitted_bpm: Option<f64>,
    last_emitted_stable: Option<bool>,
    on_update: Option<UpdateCallback>,
}

impl BpmEngine {
    pub fn new(config: BpmConfig) -> Self {
        Self {
            config,
            buffer: TapBuffer::new(),
            current_bpm: None,
            stable: false,
            last_emitted_bpm: None,
            last_emitted_stable: None,
            on_update: None,
        }
    }

    pub fn set_config(&mut self, config: BpmConfig) {
        self.config = config;
    }

    pub fn on_update(&mut self, callback: impl FnMut(BpmUpdate) + Send + 'static) {
        self.on_update = Some(Box::new(callback));
    }

    pub fn current_bpm(&self) -> Option<f64> {
        self.current_bpm
    }

    pub fn is_stable(&self) -> bool {
        self.stable
    }

    pub fn tap_count(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.current_bpm = None;
        self.stable = false;
        self.last_emitted_bpm = None;
        self.last_emitted_stable = None;
    }

    pub fn add_tap(&mut self, timestamp_us: u64) {
        self.buffer.push(timestamp_us);

        match self.estimate(timestamp_us) {
            Some(update) => {
                self.current_bpm = Some(update.bpm);
                self.stable = update.stable;
                if self.should_emit(&update) {
                    self.last_emitted_bpm = Some(update.bpm);
                    self.last_emitted_stable = Some(update.stable);
                    if let Some(cb) = &mut self.on_update {
                        cb(update);
                    }
                }
            }
            None if self.buffer.len() < MIN_TAPS_FOR_ESTIMATE => {
                self.current_bpm = None;
                self.stable = false;
            }
            None => {
                // Enough taps, but the candidate fell outside
                // [min_bpm, max_bpm]: the prior sticky estimate stands.
            }
        }
    }

    fn should_emit(&self, update: &BpmUpdate) -> bool {
        if update.corrected {
            return true;
        }
        if self.last_emitted_stable != Some(update.stable) {
            return true;
        }
        match self.last_emitted_bpm {
            None => true,
            Some(prev) => {
                let hysteresis = (update.bpm * HYSTERESIS_FRACTION).max(HYSTERESIS_MIN_BPM);
                (update.bpm - prev).abs() > hysteresis
            }
        }
    }

    fn estimate(&self, timestamp_us: u64) -> Option<BpmUpdate> {
        let taps = self.buffer.ordered();
        let tap_count = taps.len();
        if tap_count < MIN_TAPS_FOR_ESTIMATE {
            return None;
        }

        let intervals: Vec<u64> = taps.windows(2).map(|w| w[1] - w[0]).collect();
        let rolling_mean =
            intervals.iter().sum::<u64>() as f64 / intervals.len() as f64;

        let valid: Vec<f64> = intervals
            .iter()
            .map(|&d| d as f64)
            .filter(|&d| d <= OUTLIER_FACTOR * rolling_mean)
            .collect();
        if valid.is_empty() {
            return None;
        }
        let valid_mean = valid.iter().sum::<f64>() / valid.len() as f64;
        let raw_bpm = 60_000_000.0 / valid_mean;

        let variance = valid
            .iter()
            .map(|d| (d - valid_mean).powi(2))
            .sum::<f64>()
            / valid.len() as f64;
        let cv_percent = if valid_mean > 0.0 {
            variance.sqrt() / valid_mean * 100.0
        } else {
            0.0
        };
        let stable = cv_percent <= self.config.stability_threshold;

        let (bpm, corrected) = self.apply_correction(&intervals, raw_bpm);

        if bpm < self.config.min_bpm || bpm > self.config.max_bpm {
            return None;
        }

        Some(BpmUpdate {
            bpm,
            tap_count,
            stable,
            timestamp_us,
            corrected,
        })
    }

    /// Checks whether the last five consecutive raw intervals have settled
    /// at roughly double or half the tempo established by the intervals
    /// before them, and if so reports the corrected BPM. Requires a
    /// genuine earlier baseline distinct from the window under test —
    /// a tempo that has been constant since the first tap never triggers
    /// this path, since nothing in the stream differs from itself.
    fn apply_correction(&self, intervals: &[u64], raw_bpm: f64) -> (f64, bool) {
        if !self.config.correction_enabled || intervals.len() < CORRECTION_WINDOW + 1 {
            return (raw_bpm, false);
        }
        let split = intervals.len() - CORRECTION_WINDOW;
        let earlier = &intervals[..split];
        let recent = &intervals[split..];
        let baseline = earlier.iter().sum::<u64>() as f64 / earlier.len() as f64;

        let within = |target: f64| {
            recent
                .iter()
                .all(|&d| (d as f64 - target).abs() <= CORRECTION_TOLERANCE * target)
        };

        // The corrected estimate comes from the recent window's own mean,
        // not the blended overall mean — it's that window's BPM read at
        // the other multiple, not a scaled average across both regimes.
        let recent_mean = recent.iter().sum::<u64>() as f64 / recent.len() as f64;
        let recent_bpm = 60_000_000.0 / recent_mean;

        if within(2.0 * baseline) {
            (recent_bpm * 2.0, true)
        } else if within(0.5 * baseline) {
            (recent_bpm * 0.5, true)
        } else {
            (raw_bpm, false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn engine() -> BpmEngine {
        BpmEngine::new(BpmConfig::default())
    }

    #[test]
    fn fewer_than_four_taps_produce_no_estimate() {
        let mut e = engine();
        e.add_tap(0);
        e.add_tap(500_000);
        e.add_tap(1_000_000);
        assert!(e.current_bpm().is_none());
    }

    #[test]
    fn four_taps_produce_an_estimate() {
        let mut e = engine();
        for i in 0..4u64 {
            e.add_tap(i * 500_000);
        }
        let bpm = e.current_bpm().unwrap();
        assert!((bpm - 120.0).abs() < 0.5);
    }

    #[test]
    fn outlier_interval_is_rejected() {
        let mut e = engine();
        e.add_tap(0);
        e.add_tap(500_000);
        e.add_tap(1_000_000);
        e.add_tap(1_500_000);
        // Huge gap, far more than 2x the rolling mean; should be ignored.
        e.add_tap(10_000_000);
        e.add_tap(10_500_000);
        let bpm = e.current_bpm().unwrap();
        assert!((bpm - 120.0).abs() < 1.0);
    }

    #[test]
    fn stability_reflects_coefficient_of_variation() {
        let mut e = engine();
        for i in 0..8u64 {
            e.add_tap(i * 500_000);
        }
        assert!(e.is_stable());
    }

    #[test]
    fn jittery_intervals_are_reported_unstable() {
        let mut config = BpmConfig::default();
        config.stability_threshold = 1.0;
        let mut e = BpmEngine::new(config);
        let offsets = [0u64, 480_000, 1_040_000, 1_460_000, 2_090_000, 2_480_000];
        for ts in offsets {
            e.add_tap(ts);
        }
        assert!(!e.is_stable());
    }

    #[test]
    fn out_of_range_estimate_is_withheld() {
        let mut config = BpmConfig::default();
        config.min_bpm = 90.0;
        let mut e = BpmEngine::new(config);
        // 120 BPM-ish interval repeated — fine. Now widen spacing to imply
        // a BPM below the configured minimum.
        for i in 0..4u64 {
            e.add_tap(i * 1_000_000);
        }
        assert!(e.current_bpm().is_none());
    }

    #[test]
    fn tap_buffer_evicts_oldest_past_64() {
        let mut e = engine();
        for i in 0..70u64 {
            e.add_tap(i * 500_000);
        }
        assert_eq!(e.tap_count(), 64);
        assert!(e.current_bpm().is_some());
    }

    #[test]
    fn hysteresis_suppresses_small_changes() {
        let mut e = engine();
        let updates = Arc::new(Mutex::new(Vec::new()));
        let updates_clone = Arc::clone(&updates);
        e.on_update(move |u| updates_clone.lock().unwrap().push(u));

        for i in 0..4u64 {
            e.add_tap(i * 500_000);
        }
        let count_after_first = updates.lock().unwrap().len();
        assert_eq!(count_after_first, 1);

        // A tiny nudge to the next interval, well under the hysteresis band.
        e.add_tap(4 * 500_000 + 1_000);
        assert_eq!(updates.lock().unwrap().len(), count_after_first);
    }

    #[test]
    fn large_change_emits_update() {
        let mut e = engine();
        let updates = Arc::new(Mutex::new(Vec::new()));
        let updates_clone = Arc::clone(&updates);
        e.on_update(move |u| updates_clone.lock().unwrap().push(u));

        for i in 0..4u64 {
            e.add_tap(i * 500_000);
        }
        // Tempo doubles (half the interval) — big enough to clear hysteresis.
        let mut t = 4 * 500_000;
        for _ in 0..4 {
            t += 250_000;
            e.add_tap(t);
        }
        assert!(updates.lock().unwrap().len() >= 2);
    }

    #[test]
    fn clear_resets_everything() {
        let mut e = engine();
        for i in 0..4u64 {
            e.add_tap(i * 500_000);
        }
        assert!(e.current_bpm().is_some());
        e.clear();
        assert!(e.current_bpm().is_none());
        assert_eq!(e.tap_count(), 0);
    }

    #[test]
    fn sustained_tempo_shift_triggers_half_double_correction() {
        let mut e = engine();
        let updates = Arc::new(Mutex::new(Vec::new()));
        let updates_clone = Arc::clone(&updates);
        e.on_update(move |u| updates_clone.lock().unwrap().push(u));

        // Establish a baseline at 140 BPM (428_571 us interval).
        let mut t = 0u64;
        for _ in 0..6 {
            e.add_tap(t);
            t += 428_571;
        }
        // Then sustain exactly double that interval for five consecutive
        // taps — the engine should recognize it as the same tempo tracked
        // at half the detection rate and correct back up to ~140 BPM.
        for _ in 0..5 {
            t += 857_142;
            e.add_tap(t);
        }

        let last = updates.lock().unwrap().last().copied().unwrap();
        assert!(last.corrected);
        assert!((last.bpm - 140.0).abs() < 1.0);
    }
}
