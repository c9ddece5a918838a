/// Output controller (C5): the MIDI clock scheduler and the relay pulse
/// state machine. Both are driven off the same `OutputConfig` section but
/// run independently — disabling one never affects the other.
///
/// The MIDI clock side owns a dedicated task armed with absolute
/// deadlines (`tokio::time::sleep_until`) rather than a fixed-period
/// interval, so a BPM change reschedules only the *next* tick and never
/// drifts the one already armed. The relay side is driven by whichever
/// timer fires first between the configured pulse width and the
/// watchdog deadline — the watchdog forcing the line low is what keeps
/// "GPIO never stays HIGH past its deadline" true even if a caller never
/// calls back to release it.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{Duration as TokioDuration, Instant as TokioInstant};

use metronome_device::GpioOutput;
use metronome_protocol::config::OutputConfig;
use metronome_protocol::error::{CoreError, CoreResult};
use metronome_protocol::packets::{MidiClockPacket, RealtimeMessage};

use crate::timing::TimeSource;

/// Soft deadline for a single MIDI clock datagram send. A miss is
/// counted as a network send failure, never retried or fatal.
const NETWORK_SEND_DEADLINE: TokioDuration = TokioDuration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPhase {
    Idle,
    On,
    OffDebounce,
    Watchdog,
}

/// Lifetime counters exposed for telemetry/diagnostics, not used by any
/// control decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputStats {
    pub clocks_sent: u64,
    pub network_send_failures: u64,
    pub pulses_emitted: u64,
    pub watchdog_firings: u64,
    pub debounce_rejects: u64,
}

fn interval_duration(bpm: f64, ppqn: u16) -> TokioDuration {
    let bpm = bpm.max(1.0);
    let ppqn = ppqn.max(1) as f64;
    let micros = 60_000_000.0 / bpm / ppqn;
    TokioDuration::from_micros(micros.round().max(1.0) as u64)
}

async fn send_message(
    socket: &UdpSocket,
    target: SocketAddr,
    clock: &Arc<dyn TimeSource>,
    sequence: &mut u16,
    message: RealtimeMessage,
    clocks_sent: &AtomicU64,
    network_send_failures: &AtomicU64,
) {
    let packet = MidiClockPacket {
        sequence: *sequence,
        timestamp_us: clock.timestamp_us() as u32,
        message,
    };
    *sequence = sequence.wrapping_add(1);

    let mut buf = [0u8; MidiClockPacket::SIZE];
    packet.serialize(&mut buf);

    match tokio::time::timeout(NETWORK_SEND_DEADLINE, socket.send_to(&buf, target)).await {
        Ok(Ok(_)) => {
            clocks_sent.fetch_add(1, Ordering::Relaxed);
        }
        _ => {
            network_send_failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}

async fn run_clock_loop(
    mut bpm_rx: watch::Receiver<f64>,
    mut ppqn_rx: watch::Receiver<u16>,
    mut stop_rx: oneshot::Receiver<()>,
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    clock: Arc<dyn TimeSource>,
    clocks_sent: Arc<AtomicU64>,
    network_send_failures: Arc<AtomicU64>,
) {
    let mut sequence: u16 = 0;
    send_message(
        &socket,
        target,
        &clock,
        &mut sequence,
        RealtimeMessage::Start,
        &clocks_sent,
        &network_send_failures,
    )
    .await;

    let mut interval = interval_duration(*bpm_rx.borrow(), *ppqn_rx.borrow());
    let mut deadline = TokioInstant::now() + interval;

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                send_message(
                    &socket,
                    target,
                    &clock,
                    &mut sequence,
                    RealtimeMessage::Clock,
                    &clocks_sent,
                    &network_send_failures,
                )
                .await;
                // Only the *next* deadline picks up a changed BPM/PPQN;
                // the tick that just fired keeps the cadence it was armed with.
                interval = interval_duration(*bpm_rx.borrow(), *ppqn_rx.borrow());
                deadline += interval;
            }
            _ = bpm_rx.changed() => {}
            _ = ppqn_rx.changed() => {}
            _ = &mut stop_rx => {
                send_message(
                    &socket,
                    target,
                    &clock,
                    &mut sequence,
                    RealtimeMessage::Stop,
                    &clocks_sent,
                    &network_send_failures,
                )
                .await;
                break;
            }
        }
    }
}

/// Owns the background clock task. `start_sync`/`stop_sync` join the
/// previous task before returning, so a restart never leaves two tasks
/// racing to send on the same socket.
pub struct MidiClockScheduler {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    clock: Arc<dyn TimeSource>,
    bpm_tx: watch::Sender<f64>,
    ppqn_tx: watch::Sender<u16>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    handle: AsyncMutex<Option<JoinHandle<()>>>,
    sync_enabled: AtomicBool,
    clocks_sent: Arc<AtomicU64>,
    network_send_failures: Arc<AtomicU64>,
}

impl MidiClockScheduler {
    pub fn new(socket: Arc<UdpSocket>, target: SocketAddr, clock: Arc<dyn TimeSource>, ppqn: u16) -> Self {
        let (bpm_tx, _) = watch::channel(120.0);
        let (ppqn_tx, _) = watch::channel(ppqn);
        Self {
            socket,
            target,
            clock,
            bpm_tx,
            ppqn_tx,
            stop_tx: Mutex::new(None),
            handle: AsyncMutex::new(None),
            sync_enabled: AtomicBool::new(false),
            clocks_sent: Arc::new(AtomicU64::new(0)),
            network_send_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_sync_enabled(&self) -> bool {
        self.sync_enabled.load(Ordering::Acquire)
    }

    pub fn clocks_sent(&self) -> u64 {
        self.clocks_sent.load(Ordering::Relaxed)
    }

    pub fn network_send_failures(&self) -> u64 {
        self.network_send_failures.load(Ordering::Relaxed)
    }

    /// Reset the sequence counter, emit START, and begin ticking at the
    /// given BPM. Any previously running task is stopped first.
    pub async fn start_sync(&self, bpm: f64) {
        self.stop_sync().await;

        let _ = self.bpm_tx.send(bpm.max(1.0));
        self.sync_enabled.store(true, Ordering::Release);

        let (stop_tx, stop_rx) = oneshot::channel();
        *self.stop_tx.lock().unwrap() = Some(stop_tx);

        let handle = tokio::spawn(run_clock_loop(
            self.bpm_tx.subscribe(),
            self.ppqn_tx.subscribe(),
            stop_rx,
            Arc::clone(&self.socket),
            self.target,
            Arc::clone(&self.clock),
            Arc::clone(&self.clocks_sent),
            Arc::clone(&self.network_send_failures),
        ));
        *self.handle.lock().await = Some(handle);
    }

    /// Signal the running task to emit STOP and exit, then wait for it.
    /// A no-op if sync was never started.
    pub async fn stop_sync(&self) {
        self.sync_enabled.store(false, Ordering::Release);
        let stop_tx = self.stop_tx.lock().unwrap().take();
        if let Some(tx) = stop_tx {
            let _ = tx.send(());
        }
        let handle = self.handle.lock().await.take();
        if let Some(h) = handle {
            let _ = h.await;
        }
    }

    pub fn set_bpm(&self, bpm: f64) {
        let _ = self.bpm_tx.send(bpm.max(1.0));
    }

    pub fn set_ppqn(&self, ppqn: u16) {
        let _ = self.ppqn_tx.send(ppqn.max(1));
    }
}

struct RelayState {
    phase: RelayPhase,
    t_off: u64,
}

/// The relay pulse state machine: IDLE -> ON -> OFF_DEBOUNCE -> IDLE on
/// the nominal path, or ON -> WATCHDOG -> IDLE if the pulse window is
/// ever allowed to exceed the watchdog deadline.
pub struct RelayController {
    gpio: Arc<Mutex<Box<dyn GpioOutput>>>,
    state: Arc<Mutex<RelayState>>,
    clock: Arc<dyn TimeSource>,
    enabled: AtomicBool,
    pulses_emitted: Arc<AtomicU64>,
    watchdog_firings: Arc<AtomicU64>,
    debounce_rejects: Arc<AtomicU64>,
}

impl RelayController {
    pub fn new(gpio: Box<dyn GpioOutput>, clock: Arc<dyn TimeSource>, enabled: bool) -> Self {
        Self {
            gpio: Arc::new(Mutex::new(gpio)),
            state: Arc::new(Mutex::new(RelayState {
                phase: RelayPhase::Idle,
                t_off: 0,
            })),
            clock,
            enabled: AtomicBool::new(enabled),
            pulses_emitted: Arc::new(AtomicU64::new(0)),
            watchdog_firings: Arc::new(AtomicU64::new(0)),
            debounce_rejects: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn phase(&self) -> RelayPhase {
        self.state.lock().unwrap().phase
    }

    pub fn pulses_emitted(&self) -> u64 {
        self.pulses_emitted.load(Ordering::Relaxed)
    }

    pub fn watchdog_firings(&self) -> u64 {
        self.watchdog_firings.load(Ordering::Relaxed)
    }

    pub fn debounce_rejects(&self) -> u64 {
        self.debounce_rejects.load(Ordering::Relaxed)
    }

    /// Disabling forces the line low immediately, wherever it was.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        if !enabled {
            let _ = self.gpio.lock().unwrap().set_low();
            self.state.lock().unwrap().phase = RelayPhase::Idle;
        }
    }

    /// Drive the relay line HIGH for `config.relay_pulse_ms`, unless
    /// still within `config.relay_debounce_ms` of the previous pulse's
    /// release or a pulse is already in flight. Spawns the timer race
    /// that brings the line back down without the caller waiting.
    pub fn pulse_relay(&self, config: &OutputConfig) -> CoreResult<()> {
        if !self.enabled.load(Ordering::Acquire) {
            self.debounce_rejects.fetch_add(1, Ordering::Relaxed);
            return Err(CoreError::RelayDebounceReject);
        }

        let now = self.clock.timestamp_us();
        {
            let mut state = self.state.lock().unwrap();
            if state.phase != RelayPhase::Idle {
                self.debounce_rejects.fetch_add(1, Ordering::Relaxed);
                return Err(CoreError::RelayDebounceReject);
            }
            let since_off = now.saturating_sub(state.t_off);
            if since_off < (config.relay_debounce_ms as u64) * 1000 {
                self.debounce_rejects.fetch_add(1, Ordering::Relaxed);
                return Err(CoreError::RelayDebounceReject);
            }
            self.gpio.lock().unwrap().set_high()?;
            state.phase = RelayPhase::On;
        }

        let pulse_ms = config.relay_pulse_ms as u64;
        let watchdog_ms = config.relay_watchdog_ms as u64;
        let debounce_ms = config.relay_debounce_ms as u64;

        self.arm_release(pulse_ms, watchdog_ms, debounce_ms);

        Ok(())
    }

    /// Races the pulse width against the watchdog deadline and brings
    /// the line low on whichever fires first, then (on the non-watchdog
    /// path) clears the debounce window after `debounce_ms`.
    fn arm_release(&self, pulse_ms: u64, watchdog_ms: u64, debounce_ms: u64) {
        let gpio = Arc::clone(&self.gpio);
        let state = Arc::clone(&self.state);
        let clock = Arc::clone(&self.clock);
        let pulses_emitted = Arc::clone(&self.pulses_emitted);
        let watchdog_firings = Arc::clone(&self.watchdog_firings);

        tokio::spawn(async move {
            let took_watchdog = tokio::select! {
                _ = tokio::time::sleep(TokioDuration::from_millis(pulse_ms)) => false,
                _ = tokio::time::sleep(TokioDuration::from_millis(watchdog_ms)) => true,
            };

            let now = clock.timestamp_us();
            let mut st = state.lock().unwrap();
            if st.phase == RelayPhase::On {
                let _ = gpio.lock().unwrap().set_low();
                st.t_off = now;
                if took_watchdog {
                    watchdog_firings.fetch_add(1, Ordering::Relaxed);
                    st.phase = RelayPhase::Idle;
                } else {
                    pulses_emitted.fetch_add(1, Ordering::Relaxed);
                    st.phase = RelayPhase::OffDebounce;
                }
            }
            drop(st);

            if !took_watchdog {
                tokio::time::sleep(TokioDuration::from_millis(debounce_ms)).await;
                let mut st = state.lock().unwrap();
                if st.phase == RelayPhase::OffDebounce {
                    st.phase = RelayPhase::Idle;
                }
            }
        });
    }
}

impl Drop for RelayController {
    fn drop(&mut self) {
        let _ = self.gpio.lock().unwrap().set_low();
    }
}

/// Bundles the MIDI clock scheduler and the relay controller behind the
/// single `OutputConfig` section both are driven by.
pub struct OutputController {
    midi: MidiClockScheduler,
    relay: RelayController,
    config: AsyncMutex<OutputConfig>,
}

impl OutputController {
    pub fn new(
        socket: Arc<UdpSocket>,
        target: SocketAddr,
        gpio: Box<dyn GpioOutput>,
        clock: Arc<dyn TimeSource>,
        config: OutputConfig,
    ) -> Self {
        let midi = MidiClockScheduler::new(Arc::clone(&socket), target, Arc::clone(&clock), config.midi_ppqn);
        let relay = RelayController::new(gpio, clock, config.relay_enabled);
        Self {
            midi,
            relay,
            config: AsyncMutex::new(config),
        }
    }

    pub async fn set_config(&self, config: OutputConfig) {
        self.midi.set_ppqn(config.midi_ppqn);
        self.relay.set_enabled(config.relay_enabled);
        *self.config.lock().await = config;
    }

    pub async fn start_sync(&self, bpm: f64) {
        let midi_enabled = self.config.lock().await.midi_enabled;
        if midi_enabled {
            self.midi.start_sync(bpm).await;
        }
    }

    pub async fn stop_sync(&self) {
        self.midi.stop_sync().await;
    }

    pub fn set_bpm(&self, bpm: f64) {
        self.midi.set_bpm(bpm);
    }

    pub fn is_sync_enabled(&self) -> bool {
        self.midi.is_sync_enabled()
    }

    pub async fn pulse_relay(&self) -> CoreResult<()> {
        let config = self.config.lock().await.clone();
        self.relay.pulse_relay(&config)
    }

    pub fn relay_phase(&self) -> RelayPhase {
        self.relay.phase()
    }

    pub fn stats(&self) -> OutputStats {
        OutputStats {
            clocks_sent: self.midi.clocks_sent(),
            network_send_failures: self.midi.network_send_failures(),
            pulses_emitted: self.relay.pulses_emitted(),
            watchdog_firings: self.relay.watchdog_firings(),
            debounce_rejects: self.relay.debounce_rejects(),
        }
    }
}
