//! Wire shapes of the device-info, settings and status payloads.

use crate::config::{CloudStatusConfig, WifiStatusConfig};
use crate::readings::{PhaseReading, PowerReadings};
use serde_derive::Serialize;

/// Gen1 style `GET /shelly` answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShellyInfo {
    #[serde(rename = "type")]
    pub device_type: String,
    pub mac: String,
    pub auth: bool,
    pub fw: String,
    pub discoverable: bool,
    pub longid: u32,
    pub num_outputs: u32,
    pub num_meters: u32,
}

/// `Shelly.GetDeviceInfo` result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub name: Option<String>,
    pub id: String,
    pub mac: String,
    pub slot: u32,
    pub model: String,
    #[serde(rename = "gen")]
    pub generation: u32,
    pub fw_id: String,
    pub ver: String,
    pub app: String,
    pub auth_en: bool,
    pub auth_domain: Option<String>,
    pub profile: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    pub device: SettingsDevice,
    pub login: Login,
    pub fw: String,
    pub discoverable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettingsDevice {
    #[serde(rename = "type")]
    pub device_type: String,
    pub mac: String,
    pub hostname: String,
    pub num_outputs: u32,
    pub num_meters: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Login {
    pub enabled: bool,
    pub unprotected: bool,
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Status {
    pub wifi_sta: WifiStatus,
    pub cloud: CloudStatus,
    pub mqtt: MqttStatus,
    pub time: String,
    pub unixtime: i64,
    pub serial: u32,
    pub has_update: bool,
    pub mac: String,
    pub ram_total: u64,
    pub ram_free: u64,
    pub ram_lwm: u64,
    pub fs_size: u64,
    pub fs_free: u64,
    pub uptime: u64,
    pub temperature: f64,
    pub overtemperature: bool,
    pub tmp: TempStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WifiStatus {
    pub connected: bool,
    pub ssid: String,
    pub ip: String,
    pub rssi: i32,
}

impl From<&WifiStatusConfig> for WifiStatus {
    fn from(config: &WifiStatusConfig) -> Self {
        Self {
            connected: config.connected,
            ssid: config.ssid.clone(),
            ip: config.ip.clone(),
            rssi: config.rssi,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CloudStatus {
    pub enabled: bool,
    pub connected: bool,
}

impl From<&CloudStatusConfig> for CloudStatus {
    fn from(config: &CloudStatusConfig) -> Self {
        Self {
            enabled: config.enabled,
            connected: config.connected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MqttStatus {
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TempStatus {
    #[serde(rename = "tC")]
    pub t_c: f64,
    #[serde(rename = "tF")]
    pub t_f: f64,
    pub is_valid: bool,
}

/// `EM.GetStatus` result of a three phase energy meter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmStatus {
    pub id: u32,
    /// MAC of the identity the status was synthesized for.
    pub mac: String,
    pub a_current: f64,
    pub a_voltage: f64,
    pub a_act_power: f64,
    pub a_aprt_power: f64,
    pub a_pf: f64,
    pub a_freq: f64,
    pub b_current: f64,
    pub b_voltage: f64,
    pub b_act_power: f64,
    pub b_aprt_power: f64,
    pub b_pf: f64,
    pub b_freq: f64,
    pub c_current: f64,
    pub c_voltage: f64,
    pub c_act_power: f64,
    pub c_aprt_power: f64,
    pub c_pf: f64,
    pub c_freq: f64,
    pub n_current: Option<f64>,
    pub total_current: f64,
    pub total_act_power: f64,
    pub total_aprt_power: f64,
    pub user_calibrated_phase: Vec<String>,
}

impl EmStatus {
    pub fn from_readings(id: u32, mac: impl Into<String>, readings: &PowerReadings) -> Self {
        let [a, b, c] = readings.phases.map(round_phase);
        let freq = round2(readings.frequency);

        Self {
            id,
            mac: mac.into(),
            a_current: a.current,
            a_voltage: a.voltage,
            a_act_power: a.act_power,
            a_aprt_power: a.aprt_power,
            a_pf: a.power_factor,
            a_freq: freq,
            b_current: b.current,
            b_voltage: b.voltage,
            b_act_power: b.act_power,
            b_aprt_power: b.aprt_power,
            b_pf: b.power_factor,
            b_freq: freq,
            c_current: c.current,
            c_voltage: c.voltage,
            c_act_power: c.act_power,
            c_aprt_power: c.aprt_power,
            c_pf: c.power_factor,
            c_freq: freq,
            n_current: None,
            total_current: round2(readings.total_current()),
            total_act_power: round2(readings.total_act_power()),
            total_aprt_power: round2(readings.total_aprt_power()),
            user_calibrated_phase: Vec::new(),
        }
    }
}

fn round_phase(phase: PhaseReading) -> PhaseReading {
    PhaseReading {
        voltage: round2(phase.voltage),
        current: round2(phase.current),
        act_power: round2(phase.act_power),
        aprt_power: round2(phase.aprt_power),
        power_factor: round2(phase.power_factor),
    }
}

// Real devices report two decimals
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
