use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::EventCategory;

pub const DEFAULT_FEED_BASE_URL: &str = "http://example.org/cal/index.php?f=";
pub const DEFAULT_HOSTNAME: &str = "onair";
pub const DEFAULT_LED_PINS: [i32; 4] = [25, 26, 27, 14];
pub const DEFAULT_RESET_BUTTON_PIN: i32 = 0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("wifiSsid cannot be empty")]
    EmptySsid,
    #[error("baseUrl must start with http:// or https://")]
    InvalidBaseUrl,
    #[error("brightness for {0} must be between 0 and 100")]
    BrightnessOutOfRange(&'static str),
    #[error("hostname must be 1-32 alphanumeric or '-' characters")]
    InvalidHostname,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedConfig {
    pub base_url: String,
    #[serde(rename = "icalurl")]
    pub feed_path: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: option_env!("ONAIR_FEED_BASE_URL")
                .unwrap_or(DEFAULT_FEED_BASE_URL)
                .to_string(),
            feed_path: String::new(),
        }
    }
}

impl FeedConfig {
    pub fn is_configured(&self) -> bool {
        !self.base_url.trim().is_empty() && !self.feed_path.trim().is_empty()
    }
}

/// Per-category LED brightness in percent, in output channel order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Brightness {
    #[serde(rename = "brt_f")]
    pub free: i32,
    #[serde(rename = "brt_c")]
    pub coffee: i32,
    #[serde(rename = "brt_m")]
    pub meeting: i32,
    #[serde(rename = "brt_r")]
    pub recording: i32,
}

impl Default for Brightness {
    fn default() -> Self {
        Self {
            free: 100,
            coffee: 100,
            meeting: 100,
            recording: 100,
        }
    }
}

impl Brightness {
    pub fn sanitize(&mut self) {
        self.free = self.free.clamp(0, 100);
        self.coffee = self.coffee.clamp(0, 100);
        self.meeting = self.meeting.clamp(0, 100);
        self.recording = self.recording.clamp(0, 100);
    }

    pub fn percent_for(&self, category: EventCategory) -> u8 {
        let raw = match category {
            EventCategory::Free => self.free,
            EventCategory::Coffee => self.coffee,
            EventCategory::Meeting => self.meeting,
            EventCategory::Recording => self.recording,
        };
        raw.clamp(0, 100) as u8
    }

    pub fn as_percentages(&self) -> [u8; 4] {
        EventCategory::ALL.map(|category| self.percent_for(category))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub hostname: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            hostname: DEFAULT_HOSTNAME.to_string(),
        }
    }
}

impl NetworkConfig {
    pub fn has_station_credentials(&self) -> bool {
        let ssid = self.wifi_ssid.trim();
        !ssid.is_empty() && ssid != "CHANGE_ME"
    }

    /// Drops station credentials so the next boot enters provisioning.
    pub fn forget_credentials(&mut self) {
        self.wifi_ssid.clear();
        self.wifi_pass.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// GPIOs for the free, coffee, meeting and recording channels.
    pub led_pins: [i32; 4],
    pub pwm_frequency_hz: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            led_pins: DEFAULT_LED_PINS,
            pwm_frequency_hz: 1_000,
        }
    }
}

impl OutputConfig {
    pub fn sanitize(&mut self) {
        for (pin, default) in self.led_pins.iter_mut().zip(DEFAULT_LED_PINS) {
            if *pin < 0 {
                *pin = default;
            }
        }
        self.pwm_frequency_hz = self.pwm_frequency_hz.clamp(100, 40_000);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub feed: FeedConfig,
    pub brightness: Brightness,
    pub network: NetworkConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default = "default_reset_button_pin")]
    pub reset_button_pin: i32,
}

fn default_reset_button_pin() -> i32 {
    DEFAULT_RESET_BUTTON_PIN
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            feed: FeedConfig::default(),
            brightness: Brightness::default(),
            network: NetworkConfig::default(),
            output: OutputConfig::default(),
            reset_button_pin: DEFAULT_RESET_BUTTON_PIN,
        }
    }
}

/// Partial update accepted by the setup page and the config API. Omitted
/// fields keep their stored value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigUpdate {
    #[serde(rename = "wifiSsid", default)]
    pub wifi_ssid: Option<String>,
    #[serde(rename = "wifiPass", default)]
    pub wifi_pass: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(rename = "baseUrl", default)]
    pub base_url: Option<String>,
    #[serde(rename = "feedPath", default)]
    pub feed_path: Option<String>,
    #[serde(rename = "brightnessFree", default)]
    pub brightness_free: Option<i32>,
    #[serde(rename = "brightnessCoffee", default)]
    pub brightness_coffee: Option<i32>,
    #[serde(rename = "brightnessMeeting", default)]
    pub brightness_meeting: Option<i32>,
    #[serde(rename = "brightnessRecording", default)]
    pub brightness_recording: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub restart_required: bool,
    pub feed_changed: bool,
}

/// Read-only view of the stored configuration. Secrets are reported as set or
/// unset, never echoed.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigView {
    #[serde(rename = "wifiSsid")]
    pub wifi_ssid: String,
    #[serde(rename = "wifiPassSet")]
    pub wifi_pass_set: bool,
    pub hostname: String,
    #[serde(rename = "baseUrl")]
    pub base_url: String,
    #[serde(rename = "feedPath")]
    pub feed_path: String,
    #[serde(rename = "brightnessFree")]
    pub brightness_free: i32,
    #[serde(rename = "brightnessCoffee")]
    pub brightness_coffee: i32,
    #[serde(rename = "brightnessMeeting")]
    pub brightness_meeting: i32,
    #[serde(rename = "brightnessRecording")]
    pub brightness_recording: i32,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.brightness.sanitize();
        self.output.sanitize();
        if self.network.hostname.trim().is_empty() {
            self.network.hostname = DEFAULT_HOSTNAME.to_string();
        }
        if self.reset_button_pin < 0 {
            self.reset_button_pin = DEFAULT_RESET_BUTTON_PIN;
        }
    }

    pub fn view(&self) -> ConfigView {
        ConfigView {
            wifi_ssid: self.network.wifi_ssid.clone(),
            wifi_pass_set: !self.network.wifi_pass.is_empty(),
            hostname: self.network.hostname.clone(),
            base_url: self.feed.base_url.clone(),
            feed_path: self.feed.feed_path.clone(),
            brightness_free: self.brightness.free,
            brightness_coffee: self.brightness.coffee,
            brightness_meeting: self.brightness.meeting,
            brightness_recording: self.brightness.recording,
        }
    }

    /// Validates the whole update first, so a rejected update changes nothing.
    pub fn apply_update(&mut self, update: ConfigUpdate) -> Result<UpdateOutcome, ConfigError> {
        validate_update(&update)?;

        let previous = self.clone();

        if let Some(ssid) = update.wifi_ssid {
            self.network.wifi_ssid = ssid.trim().to_string();
        }
        if let Some(pass) = update.wifi_pass {
            self.network.wifi_pass = pass;
        }
        if let Some(hostname) = update.hostname {
            self.network.hostname = hostname.trim().to_string();
        }
        if let Some(base_url) = update.base_url {
            self.feed.base_url = base_url.trim().to_string();
        }
        if let Some(feed_path) = update.feed_path {
            self.feed.feed_path = feed_path.trim().to_string();
        }
        if let Some(value) = update.brightness_free {
            self.brightness.free = value;
        }
        if let Some(value) = update.brightness_coffee {
            self.brightness.coffee = value;
        }
        if let Some(value) = update.brightness_meeting {
            self.brightness.meeting = value;
        }
        if let Some(value) = update.brightness_recording {
            self.brightness.recording = value;
        }

        Ok(UpdateOutcome {
            restart_required: previous.network != self.network,
            feed_changed: previous.feed != self.feed,
        })
    }
}

fn validate_update(update: &ConfigUpdate) -> Result<(), ConfigError> {
    if let Some(ssid) = update.wifi_ssid.as_deref() {
        if ssid.trim().is_empty() {
            return Err(ConfigError::EmptySsid);
        }
    }

    if let Some(base_url) = update.base_url.as_deref() {
        let base_url = base_url.trim();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ConfigError::InvalidBaseUrl);
        }
    }

    if let Some(hostname) = update.hostname.as_deref() {
        let hostname = hostname.trim();
        if hostname.is_empty()
            || hostname.len() > 32
            || !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(ConfigError::InvalidHostname);
        }
    }

    let brightness = [
        (update.brightness_free, EventCategory::Free),
        (update.brightness_coffee, EventCategory::Coffee),
        (update.brightness_meeting, EventCategory::Meeting),
        (update.brightness_recording, EventCategory::Recording),
    ];
    for (value, category) in brightness {
        if let Some(value) = value {
            if !(0..=100).contains(&value) {
                return Err(ConfigError::BrightnessOutOfRange(category.as_str()));
            }
        }
    }

    Ok(())
}

/// Access point name shown while unprovisioned, from the last three MAC bytes.
pub fn provisioning_ssid(mac: [u8; 6]) -> String {
    format!("OnAir-{:02X}{:02X}{:02X}", mac[3], mac[4], mac[5])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sanitize_clamps_brightness() {
        let mut runtime = RuntimeConfig::default();
        runtime.brightness = Brightness {
            free: -5,
            coffee: 250,
            meeting: 40,
            recording: 100,
        };
        runtime.output.led_pins = [-1, 4, -3, 5];
        runtime.output.pwm_frequency_hz = 10;
        runtime.network.hostname = "  ".to_string();

        runtime.sanitize();

        assert_eq!(runtime.brightness.as_percentages(), [0, 100, 40, 100]);
        assert_eq!(runtime.output.led_pins, [25, 4, 27, 5]);
        assert_eq!(runtime.output.pwm_frequency_hz, 100);
        assert_eq!(runtime.network.hostname, "onair");
    }

    #[test]
    fn persisted_keys_are_stable() {
        let runtime = RuntimeConfig::default();
        let json = serde_json::to_value(&runtime).unwrap();

        assert_eq!(json["feed"]["icalurl"], "");
        assert_eq!(json["brightness"]["brt_f"], 100);
        assert_eq!(json["brightness"]["brt_r"], 100);
    }

    #[test]
    fn older_documents_fill_in_defaults() {
        let raw = r#"{
            "feed": {"base_url": "http://cal.local/?f=", "icalurl": "team"},
            "brightness": {"brt_f": 10, "brt_c": 20, "brt_m": 30, "brt_r": 40},
            "network": {"wifi_ssid": "home", "wifi_pass": "secret", "hostname": "onair"}
        }"#;

        let runtime: RuntimeConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(runtime.output, OutputConfig::default());
        assert_eq!(runtime.reset_button_pin, DEFAULT_RESET_BUTTON_PIN);
        assert_eq!(runtime.brightness.percent_for(EventCategory::Meeting), 30);
    }

    #[test]
    fn update_keeps_omitted_fields() {
        let mut runtime = RuntimeConfig::default();
        runtime.network.wifi_ssid = "home".to_string();
        runtime.network.wifi_pass = "secret".to_string();

        let update: ConfigUpdate =
            serde_json::from_str(r#"{"feedPath": "team cal", "brightnessMeeting": 60}"#).unwrap();
        let outcome = runtime.apply_update(update).unwrap();

        assert_eq!(
            outcome,
            UpdateOutcome {
                restart_required: false,
                feed_changed: true,
            }
        );
        assert_eq!(runtime.network.wifi_pass, "secret");
        assert_eq!(runtime.feed.feed_path, "team cal");
        assert_eq!(runtime.brightness.meeting, 60);
        assert_eq!(runtime.brightness.free, 100);
    }

    #[test]
    fn wifi_changes_require_restart() {
        let mut runtime = RuntimeConfig::default();
        let outcome = runtime
            .apply_update(ConfigUpdate {
                wifi_ssid: Some("office".to_string()),
                wifi_pass: Some("hunter2".to_string()),
                ..Default::default()
            })
            .unwrap();

        assert!(outcome.restart_required);
        assert!(!outcome.feed_changed);
        assert!(runtime.network.has_station_credentials());
    }

    #[test]
    fn rejected_update_changes_nothing() {
        let mut runtime = RuntimeConfig::default();
        let before = runtime.clone();

        let result = runtime.apply_update(ConfigUpdate {
            feed_path: Some("team".to_string()),
            brightness_recording: Some(101),
            ..Default::default()
        });

        assert_eq!(
            result,
            Err(ConfigError::BrightnessOutOfRange("recording"))
        );
        assert_eq!(runtime, before);

        assert_eq!(
            runtime.apply_update(ConfigUpdate {
                base_url: Some("ftp://cal".to_string()),
                ..Default::default()
            }),
            Err(ConfigError::InvalidBaseUrl)
        );
        assert_eq!(
            runtime.apply_update(ConfigUpdate {
                wifi_ssid: Some("   ".to_string()),
                ..Default::default()
            }),
            Err(ConfigError::EmptySsid)
        );
        assert_eq!(
            runtime.apply_update(ConfigUpdate {
                hostname: Some("on air".to_string()),
                ..Default::default()
            }),
            Err(ConfigError::InvalidHostname)
        );
    }

    #[test]
    fn view_hides_password() {
        let mut runtime = RuntimeConfig::default();
        runtime.network.wifi_pass = "secret".to_string();

        let json = serde_json::to_string(&runtime.view()).unwrap();

        assert!(json.contains("\"wifiPassSet\":true"));
        assert!(!json.contains("secret"));
    }

    #[test]
    fn forgetting_credentials_forces_provisioning() {
        let mut network = NetworkConfig {
            wifi_ssid: "home".to_string(),
            wifi_pass: "secret".to_string(),
            hostname: "onair".to_string(),
        };
        assert!(network.has_station_credentials());

        network.forget_credentials();

        assert!(!network.has_station_credentials());
        assert_eq!(network.hostname, "onair");
    }

    #[test]
    fn provisioning_ssid_uses_mac_tail() {
        assert_eq!(
            provisioning_ssid([0x24, 0x0a, 0xc4, 0x1b, 0x2c, 0xfe]),
            "OnAir-1B2CFE"
        );
    }
}
