mod audio;
mod bpm;
mod config_store;
mod output;
mod timing;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use clap::Parser;
use serde::Deserialize;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use metronome_device::{create_adc_source, create_gpio_output, create_rtc_device, create_storage};
use metronome_protocol::ringbuf::audio_ring_buffer;
use metronome_protocol::DEFAULT_MIDI_CLOCK_PORT;

use crate::audio::{AudioEngine, BeatEvent};
use crate::bpm::BpmEngine;
use crate::config_store::{ConfigChange, ConfigSection, ConfigStore};
use crate::output::OutputController;
use crate::timing::TimingService;

const RING_BUFFER_CAPACITY: usize = 256;
/// Nominal clock rate before the first BPM estimate arrives.
const DEFAULT_BOOT_BPM: f64 = 120.0;

#[derive(Parser, Debug)]
#[command(name = "metronome-core", about = "Rehearsal-room beat-following metronome")]
struct Args {
    /// Path to the boot configuration file. Distinct from the persisted
    /// configuration snapshot managed by the configuration store.
    #[arg(short, long, default_value = "config/metronome.toml")]
    config: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
struct BootConfig {
    #[serde(default)]
    storage: StorageSection,
    #[serde(default)]
    hardware: HardwareSection,
    #[serde(default)]
    network: NetworkSection,
}

#[derive(Debug, Clone, Deserialize)]
struct StorageSection {
    #[serde(default = "default_storage_dir")]
    dir: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            dir: default_storage_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct HardwareSection {
    #[serde(default = "default_relay_pin")]
    relay_pin: u8,
    #[serde(default = "default_i2c_bus")]
    i2c_bus: u8,
}

impl Default for HardwareSection {
    fn default() -> Self {
        Self {
            relay_pin: default_relay_pin(),
            i2c_bus: default_i2c_bus(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct NetworkSection {
    #[serde(default = "default_midi_clock_target")]
    midi_clock_target: String,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            midi_clock_target: default_midi_clock_target(),
        }
    }
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("/var/lib/metronome")
}
fn default_relay_pin() -> u8 {
    17
}
fn default_i2c_bus() -> u8 {
    1
}
fn default_midi_clock_target() -> String {
    format!("127.0.0.1:{DEFAULT_MIDI_CLOCK_PORT}")
}

/// Drains the audio ring buffer and reacts to audio-section config
/// changes; this is the single-threaded cooperative hot path (§5). Beat
/// events and telemetry snapshots are handed off to other tasks via
/// channels rather than awaited on directly, so this loop never blocks
/// on a network send or a config-store read.
async fn run_hot_path(
    consumer: metronome_protocol::ringbuf::AudioConsumer,
    mut audio: AudioEngine,
    mut config_changes: broadcast::Receiver<ConfigChange>,
    config_store: Arc<ConfigStore>,
) {
    loop {
        tokio::select! {
            sample = consumer.pop() => {
                audio.process_sample(sample);
            }
            change = config_changes.recv() => {
                match change {
                    Ok(ConfigChange { section: ConfigSection::Audio | ConfigSection::All, .. }) => {
                        audio.set_config(config_store.get_audio().await);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

/// Reacts to BPM/output config changes and forwards each detected beat
/// into the BPM estimation engine and the relay.
async fn run_config_reactor(
    mut beat_rx: mpsc::UnboundedReceiver<BeatEvent>,
    mut config_changes: broadcast::Receiver<ConfigChange>,
    config_store: Arc<ConfigStore>,
    bpm_engine: Arc<StdMutex<BpmEngine>>,
    output: Arc<OutputController>,
) {
    loop {
        tokio::select! {
            beat = beat_rx.recv() => {
                let Some(beat) = beat else { break };
                bpm_engine.lock().unwrap().add_tap(beat.timestamp_us);
                if let Err(e) = output.pulse_relay().await {
                    warn!("relay pulse rejected: {e}");
                }
            }
            change = config_changes.recv() => {
                let section = match change {
                    Ok(change) => change.section,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if matches!(section, ConfigSection::Bpm | ConfigSection::All) {
                    bpm_engine.lock().unwrap().set_config(config_store.get_bpm().await);
                }
                if matches!(section, ConfigSection::Output | ConfigSection::All) {
                    output.set_config(config_store.get_output().await).await;
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config_str = tokio::fs::read_to_string(&args.config).await.map_err(|e| {
        error!("failed to read boot config {:?}: {}", args.config, e);
        e
    })?;
    let boot: BootConfig = toml::from_str(&config_str).map_err(|e| {
        error!("failed to parse boot config: {}", e);
        e
    })?;

    info!(config = ?args.config, "metronome-core starting");

    let storage = create_storage(boot.storage.dir.clone());
    let rtc = create_rtc_device(boot.hardware.i2c_bus);
    let gpio = create_gpio_output(boot.hardware.relay_pin);
    let mut adc = create_adc_source();

    let timing = Arc::new(TimingService::new(rtc));
    let clock: Arc<dyn timing::TimeSource> = Arc::clone(&timing) as Arc<dyn timing::TimeSource>;
    let health_handle = tokio::spawn(Arc::clone(&timing).run_health_monitor());

    let config_store = Arc::new(ConfigStore::new(storage, Arc::clone(&clock)));
    config_store.init().await?;

    let (change_tx, _) = broadcast::channel::<ConfigChange>(32);
    {
        let change_tx = change_tx.clone();
        config_store.on_change(move |change| {
            let _ = change_tx.send(change);
        });
    }

    let audio_config = config_store.get_audio().await;
    let bpm_config = config_store.get_bpm().await;
    let output_config = config_store.get_output().await;

    let target: SocketAddr = boot.network.midi_clock_target.parse().map_err(|e| {
        error!(target = %boot.network.midi_clock_target, "invalid midi_clock_target: {e}");
        anyhow::anyhow!("invalid midi_clock_target")
    })?;
    let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);

    let output = Arc::new(OutputController::new(
        socket,
        target,
        gpio,
        Arc::clone(&clock),
        output_config,
    ));

    let (beat_tx, beat_rx) = mpsc::unbounded_channel::<BeatEvent>();

    let mut audio_engine = AudioEngine::new(audio_config);
    audio_engine.on_beat(move |event| {
        let _ = beat_tx.send(event);
    });
    audio_engine.on_telemetry(|telemetry| {
        tracing::debug!(
            window_min = telemetry.window_min,
            window_max = telemetry.window_max,
            threshold = telemetry.threshold,
            agc = ?telemetry.agc_level,
            "audio telemetry"
        );
    });

    let mut bpm_engine = BpmEngine::new(bpm_config);
    {
        let output = Arc::clone(&output);
        bpm_engine.on_update(move |update| {
            info!(bpm = update.bpm, stable = update.stable, "bpm update");
            output.set_bpm(update.bpm);
        });
    }
    let bpm_engine = Arc::new(StdMutex::new(bpm_engine));

    let (producer, consumer) = audio_ring_buffer(RING_BUFFER_CAPACITY);
    adc.start(producer, config_store.get_audio().await.sample_rate)?;

    let hot_path_handle = tokio::spawn(run_hot_path(
        consumer,
        audio_engine,
        change_tx.subscribe(),
        Arc::clone(&config_store),
    ));

    let reactor_handle = tokio::spawn(run_config_reactor(
        beat_rx,
        change_tx.subscribe(),
        Arc::clone(&config_store),
        Arc::clone(&bpm_engine),
        Arc::clone(&output),
    ));

    output.start_sync(DEFAULT_BOOT_BPM).await;

    info!("metronome-core running");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    output.stop_sync().await;
    adc.stop();
    health_handle.abort();
    hot_path_handle.abort();
    reactor_handle.abort();

    if let Err(e) = config_store.save().await {
        warn!("failed to persist configuration on shutdown: {e}");
    }

    Ok(())
}
