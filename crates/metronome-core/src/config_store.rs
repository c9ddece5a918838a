/// Configuration store (C2). Owns the single in-memory `ConfigSnapshot`
/// and mirrors it to the storage backend under four section keys plus a
/// schema version marker. `set_*` validates the whole candidate section
/// atomically — any out-of-range field rejects it entirely and the
/// snapshot is left untouched.
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use metronome_device::Storage;
use metronome_protocol::config::{
    decode_section, AudioConfig, BpmConfig, ConfigSnapshot, NetworkConfig, OutputConfig,
    StoredNetworkConfig, SCHEMA_VERSION,
};
use metronome_protocol::error::{CoreError, CoreResult};

use crate::timing::TimeSource;

const KEY_AUDIO: &str = "audio";
const KEY_BPM: &str = "bpm";
const KEY_OUTPUT: &str = "output";
const KEY_NETWORK: &str = "network";
const KEY_SCHEMA_VERSION: &str = "schema_version";

/// Which section changed, carried by the single change-notification
/// listener. `All` is used only by `factory_reset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSection {
    Audio,
    Bpm,
    Output,
    Network,
    All,
}

#[derive(Debug, Clone, Copy)]
pub struct ConfigChange {
    pub section: ConfigSection,
    pub timestamp_us: u64,
}

type ChangeCallback = Box<dyn Fn(ConfigChange) + Send + Sync>;

pub struct ConfigStore {
    snapshot: RwLock<ConfigSnapshot>,
    storage: Box<dyn Storage>,
    clock: Arc<dyn TimeSource>,
    listener: std::sync::Mutex<Option<ChangeCallback>>,
}

impl ConfigStore {
    pub fn new(storage: Box<dyn Storage>, clock: Arc<dyn TimeSource>) -> Self {
        Self {
            snapshot: RwLock::new(ConfigSnapshot::default()),
            storage,
            clock,
            listener: std::sync::Mutex::new(None),
        }
    }

    /// Load from storage; absent, corrupt, or pre-v2 sections fall back
    /// to current defaults section by section rather than failing the
    /// whole snapshot. This is also where a v1.0 key rename is tolerated,
    /// via each section type's own `#[serde(alias)]`.
    pub async fn init(&self) -> CoreResult<()> {
        let stored_version = self.load_section_raw(KEY_SCHEMA_VERSION).await;
        let schema_version: u32 = match stored_version {
            Some(bytes) => decode_section(&bytes).unwrap_or(0),
            None => 0,
        };

        let audio = self
            .load_and_decode::<AudioConfig>(KEY_AUDIO)
            .await
            .unwrap_or_default();
        let bpm = self
            .load_and_decode::<BpmConfig>(KEY_BPM)
            .await
            .unwrap_or_default();
        let output = self
            .load_and_decode::<OutputConfig>(KEY_OUTPUT)
            .await
            .unwrap_or_default();
        let network = self
            .load_and_decode::<StoredNetworkConfig>(KEY_NETWORK)
            .await
            .map(|stored| NetworkConfig::from(&stored))
            .unwrap_or_default();

        let snapshot = ConfigSnapshot {
            schema_version: SCHEMA_VERSION,
            audio,
            bpm,
            output,
            network,
        };

        if snapshot.validate().is_err() {
            *self.snapshot.write().await = ConfigSnapshot::default();
        } else {
            *self.snapshot.write().await = snapshot;
        }

        if schema_version < SCHEMA_VERSION {
            info!(
                from = schema_version,
                to = SCHEMA_VERSION,
                "configuration schema migrated; will persist on next save"
            );
        }

        Ok(())
    }

    async fn load_section_raw(&self, key: &str) -> Option<Vec<u8>> {
        self.storage.load(key).ok().flatten()
    }

    async fn load_and_decode<T: for<'de> serde::Deserialize<'de>>(&self, key: &str) -> Option<T> {
        let bytes = self.load_section_raw(key).await?;
        decode_section(&bytes).ok()
    }

    pub async fn get_audio(&self) -> AudioConfig {
        self.snapshot.read().await.audio.clone()
    }

    pub async fn get_bpm(&self) -> BpmConfig {
        self.snapshot.read().await.bpm.clone()
    }

    pub async fn get_output(&self) -> OutputConfig {
        self.snapshot.read().await.output.clone()
    }

    pub async fn get_network(&self) -> NetworkConfig {
        self.snapshot.read().await.network.clone()
    }

    pub async fn set_audio(&self, candidate: AudioConfig) -> CoreResult<()> {
        candidate.validate()?;
        self.snapshot.write().await.audio = candidate;
        self.notify(ConfigSection::Audio).await;
        Ok(())
    }

    pub async fn set_bpm(&self, candidate: BpmConfig) -> CoreResult<()> {
        candidate.validate()?;
        self.snapshot.write().await.bpm = candidate;
        self.notify(ConfigSection::Bpm).await;
        Ok(())
    }

    pub async fn set_output(&self, candidate: OutputConfig) -> CoreResult<()> {
        candidate.validate()?;
        self.snapshot.write().await.output = candidate;
        self.notify(ConfigSection::Output).await;
        Ok(())
    }

    pub async fn set_network(&self, candidate: NetworkConfig) -> CoreResult<()> {
        candidate.validate()?;
        self.snapshot.write().await.network = candidate;
        self.notify(ConfigSection::Network).await;
        Ok(())
    }

    /// Persist the current snapshot. A suspension point by design (§5);
    /// callers invoke this outside the hot path.
    pub async fn save(&self) -> CoreResult<()> {
        let snapshot = self.snapshot.read().await.clone();

        let audio_bytes = serde_json::to_vec(&snapshot.audio)
            .map_err(|e| CoreError::StorageFailure(e.to_string()))?;
        let bpm_bytes = serde_json::to_vec(&snapshot.bpm)
            .map_err(|e| CoreError::StorageFailure(e.to_string()))?;
        let output_bytes = serde_json::to_vec(&snapshot.output)
            .map_err(|e| CoreError::StorageFailure(e.to_string()))?;
        let stored_network = StoredNetworkConfig::from(&snapshot.network);
        let network_bytes = serde_json::to_vec(&stored_network)
            .map_err(|e| CoreError::StorageFailure(e.to_string()))?;
        let version_bytes = serde_json::to_vec(&SCHEMA_VERSION)
            .map_err(|e| CoreError::StorageFailure(e.to_string()))?;

        self.storage.save(KEY_AUDIO, &audio_bytes)?;
        self.storage.save(KEY_BPM, &bpm_bytes)?;
        self.storage.save(KEY_OUTPUT, &output_bytes)?;
        self.storage.save(KEY_NETWORK, &network_bytes)?;
        self.storage.save(KEY_SCHEMA_VERSION, &version_bytes)?;
        Ok(())
    }

    /// Erase persistent storage, reload factory defaults, and fire the
    /// change callback with `ConfigSection::All`.
    pub async fn factory_reset(&self) -> CoreResult<()> {
        self.storage.erase_all()?;
        *self.snapshot.write().await = ConfigSnapshot::default();
        self.notify(ConfigSection::All).await;
        Ok(())
    }

    /// Register the single change listener, replacing any prior one.
    pub fn on_change(&self, callback: impl Fn(ConfigChange) + Send + Sync + 'static) {
        *self.listener.lock().unwrap() = Some(Box::new(callback));
    }

    async fn notify(&self, section: ConfigSection) {
        let timestamp_us = self.clock.timestamp_us();
        if let Some(listener) = self.listener.lock().unwrap().as_ref() {
            listener(ConfigChange {
                section,
                timestamp_us,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::MockClock;
    use metronome_device::mock::MockStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn store() -> ConfigStore {
        ConfigStore::new(Box::new(MockStorage::new()), Arc::new(MockClock::new()))
    }

    #[tokio::test]
    async fn default_after_init_on_empty_storage() {
        let store = store();
        store.init().await.unwrap();
        assert_eq!(store.get_audio().await, AudioConfig::default());
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = store();
        store.init().await.unwrap();
        let mut audio = AudioConfig::default();
        audio.sample_rate = 12_000;
        store.set_audio(audio.clone()).await.unwrap();
        assert_eq!(store.get_audio().await, audio);
    }

    #[tokio::test]
    async fn invalid_candidate_leaves_snapshot_unchanged() {
        let store = store();
        store.init().await.unwrap();
        let before = store.get_audio().await;
        let mut invalid = AudioConfig::default();
        invalid.sample_rate = 999_999;
        assert!(store.set_audio(invalid).await.is_err());
        assert_eq!(store.get_audio().await, before);
    }

    #[tokio::test]
    async fn save_then_reload_round_trips() {
        let storage = Arc::new(MockStorage::new());
        let store = ConfigStore::new(Box::new(storage.clone_handle()), Arc::new(MockClock::new()));
        store.init().await.unwrap();
        let mut audio = AudioConfig::default();
        audio.sample_rate = 11_000;
        store.set_audio(audio.clone()).await.unwrap();
        store.save().await.unwrap();

        let reloaded = ConfigStore::new(Box::new(storage.clone_handle()), Arc::new(MockClock::new()));
        reloaded.init().await.unwrap();
        assert_eq!(reloaded.get_audio().await.sample_rate, 11_000);
    }

    #[tokio::test]
    async fn set_twice_fires_callback_twice() {
        let store = store();
        store.init().await.unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        store.on_change(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        store.set_audio(AudioConfig::default()).await.unwrap();
        store.set_audio(AudioConfig::default()).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn factory_reset_restores_defaults_and_clears_secrets() {
        let storage = Arc::new(MockStorage::new());
        let store = ConfigStore::new(Box::new(storage.clone_handle()), Arc::new(MockClock::new()));
        store.init().await.unwrap();
        let mut network = NetworkConfig::default();
        network.wifi_password = "SecretPass123".to_string();
        store.set_network(network).await.unwrap();
        store.save().await.unwrap();

        store.factory_reset().await.unwrap();
        assert_eq!(store.get_network().await, NetworkConfig::default());

        let raw = storage.dump_all_bytes();
        let needle = b"SecretPass123";
        assert!(!raw.windows(needle.len()).any(|w| w == needle));
    }

    #[tokio::test]
    async fn factory_reset_is_idempotent() {
        let store = store();
        store.init().await.unwrap();
        store.factory_reset().await.unwrap();
        store.factory_reset().await.unwrap();
        assert_eq!(store.get_audio().await, AudioConfig::default());
    }
}
