use crate::config::InputConfig;
use crate::home_assistant_reader::HomeAssistantReader;
use crate::modbus_meter::ModbusMeterReader;
use crate::readings::PowerReadings;
use anyhow::Context;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc::{self, Receiver};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Starts the configured reading sources and publishes their combination
/// as the meter's live readings.
pub struct ReadingsCoordinator {
    readings: watch::Receiver<PowerReadings>,
    tasks: Vec<JoinHandle<()>>,
}

impl ReadingsCoordinator {
    pub fn start(input: &InputConfig) -> anyhow::Result<Self> {
        let (meter_tx, meter_rx) = mpsc::channel::<PowerReadings>(32);
        let (offset_tx, offset_rx) = mpsc::channel::<f64>(32);
        let (readings_tx, readings_rx) = watch::channel(PowerReadings::from_input_config(input));

        let mut tasks = Vec::new();

        match &input.modbus {
            Some(address) => {
                let target: SocketAddr = address
                    .parse()
                    .with_context(|| format!("invalid modbus meter address {address}"))?;
                tasks.push(
                    ModbusMeterReader::new(
                        target,
                        Duration::from_millis(input.poll_interval_ms),
                        input.frequency,
                        meter_tx,
                    )
                    .spawn(),
                );
            }
            None => {
                let readings = PowerReadings::from_input_config(input);
                tracing::info!(
                    total_act_power = readings.total_act_power(),
                    "no upstream meter configured, serving static readings"
                );
                tasks.push(tokio::spawn(async move {
                    let _ = meter_tx.send(readings).await;
                }));
            }
        }

        let ha_config = input.home_assistant.clone().unwrap_or_default();
        tasks.push(HomeAssistantReader::new(&ha_config, offset_tx).spawn());

        tasks.push(tokio::spawn(combine(meter_rx, offset_rx, readings_tx)));

        tracing::info!("readings sources started");
        Ok(Self {
            readings: readings_rx,
            tasks,
        })
    }

    pub fn readings(&self) -> watch::Receiver<PowerReadings> {
        self.readings.clone()
    }
}

impl Drop for ReadingsCoordinator {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Publishes `meter + offset` on every update once both have been seen.
async fn combine(
    mut meter_rx: Receiver<PowerReadings>,
    mut offset_rx: Receiver<f64>,
    publisher: watch::Sender<PowerReadings>,
) {
    let mut meter: Option<PowerReadings> = None;
    let mut offset: Option<f64> = None;
    let mut meter_open = true;
    let mut offset_open = true;

    while meter_open || offset_open {
        tokio::select! {
            reading = meter_rx.recv(), if meter_open => match reading {
                Some(reading) => meter = Some(reading),
                None => {
                    meter_open = false;
                    continue;
                }
            },
            update = offset_rx.recv(), if offset_open => match update {
                Some(update) => offset = Some(update),
                None => {
                    offset_open = false;
                    continue;
                }
            },
        }

        let (Some(meter), Some(offset)) = (meter, offset) else {
            continue;
        };
        let combined = meter.with_offset(offset);
        tracing::trace!(
            meter_power = meter.total_act_power(),
            offset,
            combined_power = combined.total_act_power(),
            "publishing readings"
        );
        publisher.send_replace(combined);
    }
    tracing::debug!("readings combiner exiting");
}
