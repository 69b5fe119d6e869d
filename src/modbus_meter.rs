use crate::readings::{PhaseReading, PowerReadings};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::time::{interval, sleep};
use tokio_modbus::prelude::*;

/// First input register of each phase block on the upstream meter.
/// Registers are documented at: https://shelly-api-docs.shelly.cloud/gen2/ComponentsAndServices/EM/#modbus-registers
const PHASE_BASE_REGISTERS: [u16; 3] = [1020, 1040, 1060];
/// voltage, current, active power, apparent power, power factor
const FLOATS_PER_PHASE: u16 = 5;
const MAX_CONSECUTIVE_ERRORS: u32 = 10;
const MAX_CONNECT_RETRIES: u32 = 3;

/// Polls an upstream three phase meter over Modbus TCP and forwards every
/// complete reading.
pub struct ModbusMeterReader {
    target_address: SocketAddr,
    poll_interval: Duration,
    frequency: f64,
    update_sender: Sender<PowerReadings>,
    connection: Option<client::Context>,
}

impl ModbusMeterReader {
    pub fn new(
        target_address: SocketAddr,
        poll_interval: Duration,
        frequency: f64,
        update_sender: Sender<PowerReadings>,
    ) -> Self {
        Self {
            target_address,
            poll_interval,
            frequency,
            update_sender,
            connection: None,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut reader = self;
            reader.run().await;
        })
    }

    async fn run(&mut self) {
        tracing::info!(target = %self.target_address, "starting modbus meter reader");

        let mut read_interval = interval(self.poll_interval);
        let mut consecutive_errors = 0u32;

        loop {
            read_interval.tick().await;

            match self.read_with_retry().await {
                Ok(readings) => {
                    consecutive_errors = 0;
                    if self.update_sender.send(readings).await.is_err() {
                        tracing::info!("readings receiver gone, stopping modbus meter reader");
                        break;
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    tracing::warn!(
                        error = %e,
                        "modbus meter read error ({consecutive_errors}/{MAX_CONSECUTIVE_ERRORS})"
                    );
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        tracing::error!("too many consecutive modbus errors, stopping meter reader");
                        break;
                    }
                    self.connection = None;
                }
            }
        }
    }

    async fn read_with_retry(&mut self) -> anyhow::Result<PowerReadings> {
        if self.connection.is_none() {
            self.connection = self.connect_with_retry().await;
        }
        if self.connection.is_none() {
            anyhow::bail!("no connection to {}", self.target_address);
        }

        match self.read_phases().await {
            Ok(readings) => Ok(readings),
            Err(e) => {
                self.connection = None;
                Err(e)
            }
        }
    }

    async fn connect_with_retry(&mut self) -> Option<client::Context> {
        for attempt in 1..=MAX_CONNECT_RETRIES {
            match tcp::connect(self.target_address).await {
                Ok(connection) => {
                    tracing::info!(target = %self.target_address, "connected to modbus meter");
                    return Some(connection);
                }
                Err(e) => {
                    tracing::warn!(
                        target = %self.target_address,
                        error = %e,
                        "modbus connect attempt {attempt}/{MAX_CONNECT_RETRIES} failed"
                    );
                    if attempt < MAX_CONNECT_RETRIES {
                        sleep(Duration::from_secs(1 << (attempt - 1))).await;
                    }
                }
            }
        }
        None
    }

    async fn read_phases(&mut self) -> anyhow::Result<PowerReadings> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("no connection available"))?;

        let mut phases = [PhaseReading::default(); 3];
        for (phase, base) in phases.iter_mut().zip(PHASE_BASE_REGISTERS) {
            // tokio-modbus returns Result<Result<Vec<u16>, ExceptionCode>, Error>
            let registers = connection
                .read_input_registers(base, 2 * FLOATS_PER_PHASE)
                .await?
                .map_err(|exception| anyhow::anyhow!("modbus exception: {exception:?}"))?;
            *phase = decode_phase(&registers)
                .ok_or_else(|| anyhow::anyhow!("short read at register {base}"))?;
        }

        Ok(PowerReadings {
            phases,
            frequency: self.frequency,
        })
    }
}

fn decode_phase(registers: &[u16]) -> Option<PhaseReading> {
    if registers.len() < 2 * FLOATS_PER_PHASE as usize {
        return None;
    }
    let value = |index: usize| f64::from(merge_u16_f32(registers[2 * index], registers[2 * index + 1]));
    Some(PhaseReading {
        voltage: value(0),
        current: value(1),
        act_power: value(2),
        aprt_power: value(3),
        power_factor: value(4),
    })
}

/// Converts two u16 values into a f32 (low word first)
fn merge_u16_f32(low: u16, high: u16) -> f32 {
    let combined: u32 = (low as u32) | ((high as u32) << 16);
    f32::from_bits(combined)
}
