//! RPC dispatch and response synthesis for the emulated Shelly Pro 3EM.

use crate::client_registry::{ClientContextRegistry, ClientIdentity};
use crate::config::Config;
use crate::payloads::{
    CloudStatus, DeviceInfo, EmStatus, Login, MqttStatus, Settings, SettingsDevice, ShellyInfo,
    Status, TempStatus, WifiStatus,
};
use crate::readings::PowerReadings;
use crate::rpc::{
    ResponseFrame, RpcError, RpcRequest, RpcResult, METHOD_EM_GET_STATUS, METHOD_GET_CONFIG,
    METHOD_GET_DEVICE_INFO, METHOD_GET_STATUS,
};
use std::net::IpAddr;
use tokio::sync::watch;
use tokio::time::Instant;

/// Model specific constants of the emulated device.
#[derive(Debug, Clone, Copy)]
pub struct DeviceModel {
    pub model: &'static str,
    pub app: &'static str,
    pub profile: &'static str,
    pub generation: u32,
    pub num_outputs: u32,
    pub num_meters: u32,
}

pub const PRO_3EM: DeviceModel = DeviceModel {
    model: "SPEM-003CEBEU",
    app: "Pro3EM",
    profile: "triphase",
    generation: 2,
    num_outputs: 0,
    num_meters: 3,
};

// Simulated resource figures reported in the status payload
const RAM_TOTAL: u64 = 50648;
const RAM_FREE: u64 = 38376;
const RAM_LWM: u64 = 32968;
const FS_SIZE: u64 = 233681;
const FS_FREE: u64 = 174194;
const TEMPERATURE_C: f64 = 28.08;
const TEMPERATURE_F: f64 = 82.54;

/// The virtual device. Shared by every session behind an `Arc`.
pub struct ShellyDevice {
    model: DeviceModel,
    device_type: String,
    fw: String,
    wifi_status: WifiStatus,
    cloud_status: CloudStatus,
    registry: ClientContextRegistry,
    readings: watch::Receiver<PowerReadings>,
    start_time: Instant,
}

impl ShellyDevice {
    pub fn new(config: &Config, readings: watch::Receiver<PowerReadings>) -> Self {
        let registry =
            ClientContextRegistry::from_config(&config.client_contexts, &config.device);
        tracing::info!(
            client_contexts = registry.len(),
            device_type = %config.device.device_type,
            "emulated device ready"
        );

        Self {
            model: PRO_3EM,
            device_type: config.device.device_type.clone(),
            fw: config.fw.clone(),
            wifi_status: WifiStatus::from(&config.wifi_status),
            cloud_status: CloudStatus::from(&config.cloud_status),
            registry,
            readings,
            start_time: Instant::now(),
        }
    }

    pub fn registry(&self) -> &ClientContextRegistry {
        &self.registry
    }

    pub fn identity(&self, remote: IpAddr) -> ClientIdentity {
        self.registry.resolve(remote)
    }

    /// Answers one RPC request. Unknown methods yield an error frame that
    /// echoes the request id.
    pub fn dispatch(&self, remote: IpAddr, request: &RpcRequest) -> ResponseFrame {
        let identity = self.identity(remote);
        tracing::trace!(%remote, method = %request.method, id = ?request.id, "rpc dispatch");

        let result = match request.method.as_str() {
            METHOD_GET_DEVICE_INFO => RpcResult::DeviceInfo(self.device_info(&identity)),
            METHOD_GET_CONFIG => RpcResult::Settings(self.settings(&identity)),
            METHOD_GET_STATUS => RpcResult::Status(Box::new(self.status(&identity))),
            METHOD_EM_GET_STATUS => RpcResult::Em(self.em_status(&identity, request)),
            method => {
                tracing::debug!(%remote, %method, "unknown rpc method");
                return ResponseFrame::error(
                    Some(request),
                    identity.hostname,
                    RpcError::method_not_found(method),
                );
            }
        };

        ResponseFrame::result(request, identity.hostname, result)
    }

    /// Error frame for a request that could not be decoded.
    pub fn parse_error(&self, remote: IpAddr) -> ResponseFrame {
        ResponseFrame::error(None, self.identity(remote).hostname, RpcError::parse_error())
    }

    pub fn shelly_info(&self, identity: &ClientIdentity) -> ShellyInfo {
        ShellyInfo {
            device_type: self.device_type.clone(),
            mac: identity.mac.clone(),
            auth: false,
            fw: self.fw.clone(),
            discoverable: true,
            longid: 1,
            num_outputs: self.model.num_outputs,
            num_meters: self.model.num_meters,
        }
    }

    pub fn device_info(&self, identity: &ClientIdentity) -> DeviceInfo {
        DeviceInfo {
            name: None,
            id: identity.hostname.clone(),
            mac: identity.mac.clone(),
            slot: 0,
            model: self.model.model.to_string(),
            generation: self.model.generation,
            fw_id: self.fw.clone(),
            ver: firmware_version(&self.fw),
            app: self.model.app.to_string(),
            auth_en: false,
            auth_domain: None,
            profile: self.model.profile.to_string(),
        }
    }

    pub fn settings(&self, identity: &ClientIdentity) -> Settings {
        Settings {
            device: SettingsDevice {
                device_type: self.device_type.clone(),
                mac: identity.mac.clone(),
                hostname: identity.hostname.clone(),
                num_outputs: self.model.num_outputs,
                num_meters: self.model.num_meters,
            },
            login: Login {
                enabled: false,
                unprotected: false,
                username: None,
            },
            fw: self.fw.clone(),
            discoverable: true,
        }
    }

    pub fn status(&self, identity: &ClientIdentity) -> Status {
        Status {
            wifi_sta: self.wifi_status.clone(),
            cloud: self.cloud_status.clone(),
            mqtt: MqttStatus { connected: false },
            time: local_time(),
            unixtime: chrono::Utc::now().timestamp(),
            serial: 1,
            has_update: false,
            mac: identity.mac.clone(),
            ram_total: RAM_TOTAL,
            ram_free: RAM_FREE,
            ram_lwm: RAM_LWM,
            fs_size: FS_SIZE,
            fs_free: FS_FREE,
            uptime: self.uptime(),
            temperature: TEMPERATURE_C,
            overtemperature: false,
            tmp: TempStatus {
                t_c: TEMPERATURE_C,
                t_f: TEMPERATURE_F,
                is_valid: true,
            },
        }
    }

    pub fn em_status(&self, identity: &ClientIdentity, request: &RpcRequest) -> EmStatus {
        let component_id = request
            .params
            .as_ref()
            .and_then(|params| params.get("id"))
            .and_then(|id| id.as_u64())
            .and_then(|id| u32::try_from(id).ok())
            .unwrap_or(0);
        let readings = self.readings.borrow().scaled(identity.power_factor);
        EmStatus::from_readings(component_id, identity.mac.clone(), &readings)
    }

    /// Whole seconds since the device started.
    pub fn uptime(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

fn local_time() -> String {
    chrono::Local::now().format("%H:%M").to_string()
}

/// `20241011-114455/1.4.4-g6d2a586` -> `1.4.4`
fn firmware_version(fw: &str) -> String {
    let version = fw.split_once('/').map_or(fw, |(_, v)| v);
    version
        .split_once('-')
        .map_or(version, |(v, _)| v)
        .to_string()
}
