/// The persisted, validated configuration snapshot (C2). A single in-memory
/// `ConfigSnapshot` is owned by the configuration store; this module only
/// carries the data model, validation rules, schema migration and the
/// secret-at-rest transform. Storage I/O and change notification live in
/// the core crate, which is the only place that needs an async runtime or
/// a filesystem handle.
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Current on-disk schema version. Bump when a section gains or loses a
/// field in a way `migrate_from_legacy` needs to know about.
pub const SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub audio: AudioConfig,
    pub bpm: BpmConfig,
    pub output: OutputConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            audio: AudioConfig::default(),
            bpm: BpmConfig::default(),
            output: OutputConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    /// v1.0 called this field `sample_freq`; tolerated here so an old
    /// stored section still deserializes under the current name.
    #[serde(alias = "sample_freq", default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_threshold_margin")]
    pub threshold_margin: u16,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u32,
    #[serde(default = "default_nominal_gain")]
    pub nominal_gain: u8,
    #[serde(default)]
    pub kick_only: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            threshold_margin: default_threshold_margin(),
            debounce_ms: default_debounce_ms(),
            nominal_gain: default_nominal_gain(),
            kick_only: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BpmConfig {
    /// v1.0 called this field `min_tempo`.
    #[serde(alias = "min_tempo", default = "default_min_bpm")]
    pub min_bpm: f64,
    #[serde(default = "default_max_bpm")]
    pub max_bpm: f64,
    #[serde(default = "default_stability_threshold")]
    pub stability_threshold: f64,
    #[serde(default = "default_true")]
    pub correction_enabled: bool,
}

impl Default for BpmConfig {
    fn default() -> Self {
        Self {
            min_bpm: default_min_bpm(),
            max_bpm: default_max_bpm(),
            stability_threshold: default_stability_threshold(),
            correction_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_true")]
    pub midi_enabled: bool,
    #[serde(default = "default_midi_channel")]
    pub midi_channel: u8,
    #[serde(default = "default_midi_note")]
    pub midi_note: u8,
    #[serde(default = "default_midi_velocity")]
    pub midi_velocity: u8,
    #[serde(default = "default_true")]
    pub relay_enabled: bool,
    #[serde(default = "default_relay_pulse_ms")]
    pub relay_pulse_ms: u32,
    #[serde(default = "default_relay_watchdog_ms")]
    pub relay_watchdog_ms: u32,
    #[serde(default = "default_relay_debounce_ms")]
    pub relay_debounce_ms: u32,
    #[serde(default = "default_ppqn")]
    pub midi_ppqn: u16,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            midi_enabled: true,
            midi_channel: default_midi_channel(),
            midi_note: default_midi_note(),
            midi_velocity: default_midi_velocity(),
            relay_enabled: true,
            relay_pulse_ms: default_relay_pulse_ms(),
            relay_watchdog_ms: default_relay_watchdog_ms(),
            relay_debounce_ms: default_relay_debounce_ms(),
            midi_ppqn: default_ppqn(),
        }
    }
}

/// WiFi and MQTT connection details. `wifi_password` and `mqtt_password`
/// are plaintext once loaded into memory; `to_storage_bytes`/`from_storage_bytes`
/// apply the keyed XOR transform at the storage boundary only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NetworkConfig {
    #[serde(default)]
    pub wifi_ssid: String,
    #[serde(default)]
    pub wifi_password: String,
    #[serde(default)]
    pub mqtt_host: String,
    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,
    #[serde(default)]
    pub mqtt_username: String,
    #[serde(default)]
    pub mqtt_password: String,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}
fn default_true() -> bool {
    true
}
fn default_sample_rate() -> u32 {
    16_000
}
fn default_threshold_margin() -> u16 {
    100
}
fn default_debounce_ms() -> u32 {
    50
}
fn default_nominal_gain() -> u8 {
    50
}
fn default_min_bpm() -> f64 {
    40.0
}
fn default_max_bpm() -> f64 {
    220.0
}
fn default_stability_threshold() -> f64 {
    5.0
}
fn default_midi_channel() -> u8 {
    1
}
fn default_midi_note() -> u8 {
    60
}
fn default_midi_velocity() -> u8 {
    100
}
fn default_relay_pulse_ms() -> u32 {
    50
}
fn default_relay_watchdog_ms() -> u32 {
    100
}
fn default_relay_debounce_ms() -> u32 {
    50
}
fn default_ppqn() -> u16 {
    24
}
fn default_mqtt_port() -> u16 {
    1883
}

const MAX_SSID_LEN: usize = 32;
const MAX_PASSWORD_LEN: usize = 64;
const MAX_HOSTNAME_LEN: usize = 64;
const MAX_USERNAME_LEN: usize = 32;

impl AudioConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if !(8000..=16_000).contains(&self.sample_rate) {
            return Err(CoreError::InvalidValue(format!(
                "sample_rate {} out of range [8000, 16000]",
                self.sample_rate
            )));
        }
        if !(50..=200).contains(&self.threshold_margin) {
            return Err(CoreError::InvalidValue(format!(
                "threshold_margin {} out of range [50, 200]",
                self.threshold_margin
            )));
        }
        if !(20..=100).contains(&self.debounce_ms) {
            return Err(CoreError::InvalidValue(format!(
                "debounce_ms {} out of range [20, 100]",
                self.debounce_ms
            )));
        }
        if !matches!(self.nominal_gain, 40 | 50 | 60) {
            return Err(CoreError::InvalidValue(format!(
                "nominal_gain {} must be one of 40, 50, 60",
                self.nominal_gain
            )));
        }
        Ok(())
    }
}

impl BpmConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if !(30.0..=100.0).contains(&self.min_bpm) {
            return Err(CoreError::InvalidValue(format!(
                "min_bpm {} out of range [30, 100]",
                self.min_bpm
            )));
        }
        if !(200.0..=600.0).contains(&self.max_bpm) {
            return Err(CoreError::InvalidValue(format!(
                "max_bpm {} out of range [200, 600]",
                self.max_bpm
            )));
        }
        if self.min_bpm >= self.max_bpm {
            return Err(CoreError::InvalidValue(format!(
                "min_bpm {} must be less than max_bpm {}",
                self.min_bpm, self.max_bpm
            )));
        }
        if !(1.0..=10.0).contains(&self.stability_threshold) {
            return Err(CoreError::InvalidValue(format!(
                "stability_threshold {} out of range [1, 10]",
                self.stability_threshold
            )));
        }
        Ok(())
    }
}

impl OutputConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if !(1..=16).contains(&self.midi_channel) {
            return Err(CoreError::InvalidValue(format!(
                "midi_channel {} out of range [1, 16]",
                self.midi_channel
            )));
        }
        // midi_note and midi_velocity are u8 already bounded to [0, 127]... no,
        // u8 goes to 255, so the range must still be checked explicitly.
        if self.midi_note > 127 {
            return Err(CoreError::InvalidValue(format!(
                "midi_note {} out of range [0, 127]",
                self.midi_note
            )));
        }
        if self.midi_velocity > 127 {
            return Err(CoreError::InvalidValue(format!(
                "midi_velocity {} out of range [0, 127]",
                self.midi_velocity
            )));
        }
        if !(10..=500).contains(&self.relay_pulse_ms) {
            return Err(CoreError::InvalidValue(format!(
                "relay_pulse_ms {} out of range [10, 500]",
                self.relay_pulse_ms
            )));
        }
        Ok(())
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if self.wifi_ssid.len() > MAX_SSID_LEN {
            return Err(CoreError::InvalidValue(format!(
                "wifi_ssid exceeds {MAX_SSID_LEN} characters"
            )));
        }
        if self.wifi_password.len() > MAX_PASSWORD_LEN {
            return Err(CoreError::InvalidValue(format!(
                "wifi_password exceeds {MAX_PASSWORD_LEN} characters"
            )));
        }
        if self.mqtt_host.len() > MAX_HOSTNAME_LEN {
            return Err(CoreError::InvalidValue(format!(
                "mqtt_host exceeds {MAX_HOSTNAME_LEN} characters"
            )));
        }
        if self.mqtt_username.len() > MAX_USERNAME_LEN {
            return Err(CoreError::InvalidValue(format!(
                "mqtt_username exceeds {MAX_USERNAME_LEN} characters"
            )));
        }
        if self.mqtt_password.len() > MAX_PASSWORD_LEN {
            return Err(CoreError::InvalidValue(format!(
                "mqtt_password exceeds {MAX_PASSWORD_LEN} characters"
            )));
        }
        if self.mqtt_port == 0 {
            return Err(CoreError::InvalidValue(
                "mqtt_port must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl ConfigSnapshot {
    pub fn validate(&self) -> CoreResult<()> {
        self.audio.validate()?;
        self.bpm.validate()?;
        self.output.validate()?;
        self.network.validate()?;
        Ok(())
    }
}

/// Key under which the XOR cipher is keyed. Not a secret in itself — the
/// design note sanctions this as obfuscation, not encryption; production
/// hardware builds use a platform-provided encrypted storage partition
/// instead of this module.
const SECRET_XOR_KEY: &[u8] = b"metronome-at-rest-obfuscation-key";

/// Applies the keyed XOR transform in place. Symmetric: calling it twice
/// with the same key recovers the original bytes.
fn xor_with_key(data: &mut [u8]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= SECRET_XOR_KEY[i % SECRET_XOR_KEY.len()];
    }
}

/// Obfuscate a plaintext secret for storage. Empty strings pass through
/// unchanged — an empty password has nothing to hide and round-trips
/// identically either way.
pub fn obfuscate_secret(plaintext: &str) -> Vec<u8> {
    let mut bytes = plaintext.as_bytes().to_vec();
    xor_with_key(&mut bytes);
    bytes
}

/// Recover a plaintext secret from its obfuscated storage form.
pub fn deobfuscate_secret(ciphertext: &[u8]) -> String {
    let mut bytes = ciphertext.to_vec();
    xor_with_key(&mut bytes);
    String::from_utf8_lossy(&bytes).into_owned()
}

/// The over-the-wire storage form of the network section: passwords are
/// replaced with their obfuscated bytes so a raw scan of the persisted
/// blob never contains the plaintext.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoredNetworkConfig {
    pub wifi_ssid: String,
    pub wifi_password_enc: Vec<u8>,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: String,
    pub mqtt_password_enc: Vec<u8>,
}

/// Encode a snapshot's network section for storage. JSON is self-describing:
/// the per-field obfuscation and the legacy migration below both key on
/// field names, and need an encoding that tolerates a renamed or missing
/// field.
impl From<&NetworkConfig> for StoredNetworkConfig {
    fn from(cfg: &NetworkConfig) -> Self {
        Self {
            wifi_ssid: cfg.wifi_ssid.clone(),
            wifi_password_enc: obfuscate_secret(&cfg.wifi_password),
            mqtt_host: cfg.mqtt_host.clone(),
            mqtt_port: cfg.mqtt_port,
            mqtt_username: cfg.mqtt_username.clone(),
            mqtt_password_enc: obfuscate_secret(&cfg.mqtt_password),
        }
    }
}

impl From<&StoredNetworkConfig> for NetworkConfig {
    fn from(stored: &StoredNetworkConfig) -> Self {
        Self {
            wifi_ssid: stored.wifi_ssid.clone(),
            wifi_password: deobfuscate_secret(&stored.wifi_password_enc),
            mqtt_host: stored.mqtt_host.clone(),
            mqtt_port: stored.mqtt_port,
            mqtt_username: stored.mqtt_username.clone(),
            mqtt_password: deobfuscate_secret(&stored.mqtt_password_enc),
        }
    }
}

/// Decode a persisted section's bytes, tolerating a schema older than
/// [`SCHEMA_VERSION`]. Each section type carries its own `#[serde(alias)]`
/// attributes for renamed fields (`sample_freq` -> `sample_rate`,
/// `min_tempo` -> `min_bpm`) and `#[serde(default)]` for fields introduced
/// later, so no separate legacy shadow type is needed. The caller is
/// expected to persist the result on the next `save()` once migrated.
pub fn decode_section<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> CoreResult<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| CoreError::StorageFailure(format!("section schema unreadable: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_snapshot_validates() {
        assert!(ConfigSnapshot::default().validate().is_ok());
    }

    #[test]
    fn sample_rate_boundaries() {
        let mut audio = AudioConfig::default();
        audio.sample_rate = 8000;
        assert!(audio.validate().is_ok());
        audio.sample_rate = 16_000;
        assert!(audio.validate().is_ok());
        audio.sample_rate = 7999;
        assert!(audio.validate().is_err());
        audio.sample_rate = 16_001;
        assert!(audio.validate().is_err());
    }

    #[test]
    fn min_bpm_boundaries() {
        let mut bpm = BpmConfig::default();
        bpm.min_bpm = 30.0;
        bpm.max_bpm = 200.0;
        assert!(bpm.validate().is_ok());
        bpm.min_bpm = 29.0;
        assert!(bpm.validate().is_err());
    }

    #[test]
    fn max_bpm_boundaries() {
        let mut bpm = BpmConfig::default();
        bpm.max_bpm = 600.0;
        assert!(bpm.validate().is_ok());
        bpm.max_bpm = 601.0;
        assert!(bpm.validate().is_err());
    }

    #[test]
    fn min_equal_max_rejected() {
        let mut bpm = BpmConfig::default();
        bpm.min_bpm = 100.0;
        bpm.max_bpm = 100.0;
        assert!(bpm.validate().is_err());
    }

    #[test]
    fn nominal_gain_must_be_discrete() {
        let mut audio = AudioConfig::default();
        audio.nominal_gain = 45;
        assert!(audio.validate().is_err());
        audio.nominal_gain = 60;
        assert!(audio.validate().is_ok());
    }

    #[test]
    fn midi_channel_range() {
        let mut out = OutputConfig::default();
        out.midi_channel = 0;
        assert!(out.validate().is_err());
        out.midi_channel = 16;
        assert!(out.validate().is_ok());
        out.midi_channel = 17;
        assert!(out.validate().is_err());
    }

    #[test]
    fn string_field_bounds() {
        let mut net = NetworkConfig::default();
        net.wifi_ssid = "x".repeat(33);
        assert!(net.validate().is_err());
        net.wifi_ssid = "x".repeat(32);
        assert!(net.validate().is_ok());
    }

    #[test]
    fn secret_roundtrips_through_obfuscation() {
        let plaintext = "SecretPass123";
        let enc = obfuscate_secret(plaintext);
        assert_ne!(enc, plaintext.as_bytes());
        assert_eq!(deobfuscate_secret(&enc), plaintext);
    }

    #[test]
    fn stored_form_never_contains_plaintext_bytes() {
        let mut cfg = NetworkConfig::default();
        cfg.wifi_password = "SecretPass123".to_string();
        let stored = StoredNetworkConfig::from(&cfg);
        let blob = serde_json::to_vec(&stored).unwrap();
        let needle = b"SecretPass123";
        assert!(!blob.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn legacy_audio_key_rename_migrates() {
        let old = serde_json::json!({
            "sample_freq": 12_000,
            "threshold_margin": 90,
            "debounce_ms": 40,
            "nominal_gain": 50,
            "kick_only": false,
        });
        let bytes = serde_json::to_vec(&old).unwrap();
        let migrated: AudioConfig = decode_section(&bytes).unwrap();
        assert_eq!(migrated.sample_rate, 12_000);
    }

    #[test]
    fn legacy_bpm_key_rename_migrates() {
        let old = serde_json::json!({
            "min_tempo": 50.0,
            "max_bpm": 220.0,
            "stability_threshold": 5.0,
            "correction_enabled": true,
        });
        let bytes = serde_json::to_vec(&old).unwrap();
        let migrated: BpmConfig = decode_section(&bytes).unwrap();
        assert_eq!(migrated.min_bpm, 50.0);
    }

    #[test]
    fn missing_network_section_falls_back_to_defaults() {
        let old = serde_json::json!({});
        let bytes = serde_json::to_vec(&old).unwrap();
        let migrated: NetworkConfig = decode_section(&bytes).unwrap();
        assert_eq!(migrated, NetworkConfig::default());
    }
}
