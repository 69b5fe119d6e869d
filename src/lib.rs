//! Shelly Pro 3EM Emulation Library
//!
//! Presents a three phase Shelly energy meter to local controllers over
//! Gen1 HTTP, Gen2 RPC over WebSocket/HTTP and RPC over UDP. Live readings
//! come from an upstream Modbus meter combined with a Home Assistant offset.

pub mod client_registry;
pub mod config;
pub mod error;
pub mod home_assistant;
pub mod home_assistant_reader;
pub mod http_server;
pub mod modbus_meter;
pub mod payloads;
pub mod readings;
pub mod readings_coordinator;
pub mod rpc;
pub mod shelly_device;
pub mod throttle;
pub mod udp_server;
pub mod udp_session;
pub mod websocket_session;

// Re-export commonly used types for easier access
pub use client_registry::{ClientContextRegistry, ClientIdentity};
pub use config::Config;
pub use error::{Error, Result};
pub use http_server::AppState;
pub use readings::{PhaseReading, PowerReadings};
pub use readings_coordinator::ReadingsCoordinator;
pub use shelly_device::ShellyDevice;
pub use throttle::ThrottledDispatchQueue;
pub use udp_server::{UdpServer, UdpServerSettings};
