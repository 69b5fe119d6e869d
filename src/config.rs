use anyhow::Context;
use serde_derive::Deserialize;
use std::{env, fs, path::Path, time::Duration};

/// Top level configuration of the emulated device.
///
/// Loaded from the JSON file named by `SHELLY_CONFIG` (when set) and then
/// overridden by the individual environment variables handled in
/// [`Config::apply_env_overrides`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub interface: String,
    pub port: u16,
    pub udp_port: u16,
    pub throttling_interval_ms: u64,
    pub udp_idle_timeout_secs: u64,
    pub udp_max_sessions: usize,
    pub outbound_queue_size: usize,
    pub fw: String,
    pub device: DeviceDefaults,
    pub client_contexts: Vec<ClientContextConfig>,
    pub wifi_status: WifiStatusConfig,
    pub cloud_status: CloudStatusConfig,
    pub input: InputConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: "0.0.0.0".to_string(),
            port: 80,
            udp_port: 1010,
            throttling_interval_ms: 200,
            udp_idle_timeout_secs: 60,
            udp_max_sessions: 1024,
            outbound_queue_size: 32,
            fw: "20241011-114455/1.4.4-g6d2a586".to_string(),
            device: DeviceDefaults::default(),
            client_contexts: Vec::new(),
            wifi_status: WifiStatusConfig::default(),
            cloud_status: CloudStatusConfig::default(),
            input: InputConfig::default(),
        }
    }
}

/// Device-wide identity used for every remote without its own client context.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DeviceDefaults {
    #[serde(rename = "type")]
    pub device_type: String,
    pub mac: String,
    pub hostname: Option<String>,
}

impl Default for DeviceDefaults {
    fn default() -> Self {
        Self {
            device_type: "SPEM-003CEBEU".to_string(),
            mac: "B827EB364242".to_string(),
            hostname: None,
        }
    }
}

/// A known remote peer. Every field but `address` is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ClientContextConfig {
    pub address: String,
    pub mac: Option<String>,
    pub hostname: Option<String>,
    pub power_factor: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WifiStatusConfig {
    pub connected: bool,
    pub ssid: String,
    pub ip: String,
    pub rssi: i32,
}

impl Default for WifiStatusConfig {
    fn default() -> Self {
        Self {
            connected: true,
            ssid: "MyHome".to_string(),
            ip: "192.168.1.20".to_string(),
            rssi: -60,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CloudStatusConfig {
    pub enabled: bool,
    pub connected: bool,
}

/// Where the live power readings come from.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct InputConfig {
    /// Modbus TCP address of an upstream three phase meter, e.g. `192.168.1.30:502`.
    pub modbus: Option<String>,
    pub poll_interval_ms: u64,
    /// Per phase values published when no upstream meter is configured.
    pub static_phase: StaticPhaseConfig,
    pub frequency: f64,
    pub home_assistant: Option<HomeAssistantConfig>,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            modbus: None,
            poll_interval_ms: 1000,
            static_phase: StaticPhaseConfig::default(),
            frequency: 50.0,
            home_assistant: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct StaticPhaseConfig {
    pub voltage: f64,
    pub current: f64,
    pub act_power: f64,
    pub aprt_power: f64,
    pub power_factor: f64,
}

impl Default for StaticPhaseConfig {
    fn default() -> Self {
        Self {
            voltage: 230.0,
            current: 0.0,
            act_power: 0.0,
            aprt_power: 0.0,
            power_factor: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct HomeAssistantConfig {
    pub url: String,
    pub token: String,
    pub import_sensor: String,
    pub export_sensor: String,
    pub smooth: bool,
}

impl Config {
    /// Loads the configuration file (if any) and applies environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match env::var("SHELLY_CONFIG") {
            Ok(path) if !path.is_empty() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Environment variables win over anything read from the file.
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Some(interface) = non_empty_var("SHELLY_INTERFACE") {
            self.interface = interface;
        }
        if let Some(port) = non_empty_var("SHELLY_PORT") {
            self.port = port.parse().context("invalid SHELLY_PORT")?;
        }
        if let Some(port) = non_empty_var("SHELLY_UDP_PORT") {
            self.udp_port = port.parse().context("invalid SHELLY_UDP_PORT")?;
        }
        if let Some(mac) = non_empty_var("SHELLY_MAC") {
            self.device.mac = mac;
        }
        if let Some(hostname) = non_empty_var("SHELLY_HOSTNAME") {
            self.device.hostname = Some(hostname);
        }
        if let Some(modbus) = non_empty_var("SHELLY_MODBUS") {
            self.input.modbus = Some(modbus);
        }

        let ha_url = non_empty_var("HA_URL");
        let ha_import = non_empty_var("HA_EXTRA_IMPORT");
        let ha_export = non_empty_var("HA_EXTRA_EXPORT");
        if ha_url.is_some() || ha_import.is_some() || ha_export.is_some() {
            let ha = self.input.home_assistant.get_or_insert_with(Default::default);
            if let Some(url) = ha_url {
                ha.url = url;
            }
            if let Some(token) = non_empty_var("HA_TOKEN") {
                ha.token = token;
            }
            if let Some(import) = ha_import {
                ha.import_sensor = import;
            }
            if let Some(export) = ha_export {
                ha.export_sensor = export;
            }
            if env::var("HA_SMOOTH").is_ok() {
                ha.smooth = parse_bool_safe(env::var("HA_SMOOTH").ok());
            }
        }
        Ok(())
    }

    pub fn throttling_interval(&self) -> Duration {
        Duration::from_millis(self.throttling_interval_ms)
    }

    pub fn udp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_idle_timeout_secs)
    }

    pub fn http_bind_address(&self) -> String {
        format!("{}:{}", self.interface, self.port)
    }

    pub fn udp_bind_address(&self) -> String {
        format!("{}:{}", self.interface, self.udp_port)
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

/// Safely parses a boolean from an optional string, defaulting to false
pub(crate) fn parse_bool_safe(val: Option<String>) -> bool {
    val.unwrap_or_default()
        .to_ascii_lowercase()
        .parse()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment variables are process wide, keep these tests serialized.
    static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

    const ENV_VARS: [&str; 11] = [
        "SHELLY_INTERFACE",
        "SHELLY_PORT",
        "SHELLY_UDP_PORT",
        "SHELLY_MAC",
        "SHELLY_HOSTNAME",
        "SHELLY_MODBUS",
        "HA_URL",
        "HA_TOKEN",
        "HA_EXTRA_IMPORT",
        "HA_EXTRA_EXPORT",
        "HA_SMOOTH",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_parse_full_document() {
        let config = Config::from_json(
            r#"{
                "interface": "127.0.0.1",
                "port": 8080,
                "udp-port": 2220,
                "throttling-interval-ms": 500,
                "device": { "type": "SPEM-003CEBEU", "mac": "AABBCCDDEEFF" },
                "client-contexts": [
                    { "address": "10.0.0.5", "mac": "aa:bb:cc:dd:ee:ff", "power-factor": 0.5 },
                    { "address": "10.0.0.6" }
                ],
                "wifi-status": { "connected": false, "ssid": "lab", "ip": "10.0.0.2", "rssi": -70 },
                "cloud-status": { "enabled": true, "connected": false },
                "input": {
                    "modbus": "10.0.0.30:502",
                    "static-phase": { "voltage": 231.5, "act-power": 100.0 },
                    "home-assistant": { "url": "http://ha:8123", "import-sensor": "sensor.grid" }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.interface, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert_eq!(config.udp_port, 2220);
        assert_eq!(config.throttling_interval(), Duration::from_millis(500));
        assert_eq!(config.device.mac, "AABBCCDDEEFF");
        assert_eq!(config.device.hostname, None);
        assert_eq!(config.client_contexts.len(), 2);
        assert_eq!(config.client_contexts[0].power_factor, Some(0.5));
        assert_eq!(config.client_contexts[1].mac, None);
        assert!(!config.wifi_status.connected);
        assert!(config.cloud_status.enabled);
        assert_eq!(config.input.modbus.as_deref(), Some("10.0.0.30:502"));
        assert_eq!(config.input.static_phase.voltage, 231.5);
        assert_eq!(config.input.static_phase.power_factor, 1.0);
        let ha = config.input.home_assistant.unwrap();
        assert_eq!(ha.import_sensor, "sensor.grid");
        assert!(ha.export_sensor.is_empty());
        // Untouched keys keep their defaults
        assert_eq!(config.udp_idle_timeout_secs, 60);
        assert_eq!(config.udp_max_sessions, 1024);
    }

    #[test]
    fn test_empty_document_is_default() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.http_bind_address(), "0.0.0.0:80");
        assert_eq!(config.udp_bind_address(), "0.0.0.0:1010");
        assert!(config.client_contexts.is_empty());
        assert!(config.input.home_assistant.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        env::set_var("SHELLY_PORT", "8081");
        env::set_var("SHELLY_MAC", "112233445566");
        env::set_var("SHELLY_MODBUS", "127.0.0.1:5502");
        env::set_var("HA_URL", "http://localhost:8123");
        env::set_var("HA_EXTRA_EXPORT", "sensor.pv");
        env::set_var("HA_SMOOTH", "TRUE");

        let mut config = Config::default();
        config.apply_env_overrides().unwrap();
        clear_env();

        assert_eq!(config.port, 8081);
        assert_eq!(config.device.mac, "112233445566");
        assert_eq!(config.input.modbus.as_deref(), Some("127.0.0.1:5502"));
        let ha = config.input.home_assistant.unwrap();
        assert_eq!(ha.url, "http://localhost:8123");
        assert_eq!(ha.export_sensor, "sensor.pv");
        assert!(ha.smooth);
    }

    #[test]
    fn test_invalid_port_override_is_an_error() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        env::set_var("SHELLY_UDP_PORT", "not-a-port");

        let mut config = Config::default();
        let result = config.apply_env_overrides();
        clear_env();

        assert!(result.is_err());
    }

    #[test]
    fn test_parse_bool_safe() {
        assert!(!parse_bool_safe(None));
        assert!(!parse_bool_safe(Some("".to_string())));
        assert!(parse_bool_safe(Some("true".to_string())));
        assert!(parse_bool_safe(Some("TrUe".to_string())));
        assert!(!parse_bool_safe(Some("FALSE".to_string())));
        assert!(!parse_bool_safe(Some("yes".to_string())));
        assert!(!parse_bool_safe(Some("1".to_string())));
    }
}
