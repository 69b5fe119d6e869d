use crate::config::HomeAssistantConfig;
use crate::home_assistant::HomeAssistantApi;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::time::{interval, sleep};

const POLL_INTERVAL: Duration = Duration::from_millis(1000);
const MAX_RETRIES: u32 = 3;
const SMOOTHING_WINDOW: usize = 10;

/// Polls Home Assistant for an `import - export` power offset in watts.
pub struct HomeAssistantReader {
    import_sensor: String,
    export_sensor: String,
    update_sender: Sender<f64>,
    ha_client: HomeAssistantApi,
    smoothing: Option<RollingAverage>,
}

impl HomeAssistantReader {
    pub fn new(config: &HomeAssistantConfig, update_sender: Sender<f64>) -> Self {
        tracing::info!(
            import_sensor = %display_sensor(&config.import_sensor),
            export_sensor = %display_sensor(&config.export_sensor),
            smoothing = config.smooth,
            "home assistant reader configured"
        );

        Self {
            import_sensor: config.import_sensor.clone(),
            export_sensor: config.export_sensor.clone(),
            update_sender,
            ha_client: HomeAssistantApi::new(config.url.clone(), config.token.clone()),
            smoothing: config
                .smooth
                .then(|| RollingAverage::new(SMOOTHING_WINDOW)),
        }
    }

    pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&mut self) {
        // Nothing to poll, publish a neutral offset once so readings can flow
        if self.import_sensor.is_empty() && self.export_sensor.is_empty() {
            tracing::info!("no home assistant sensors configured, using zero offset");
            let _ = self.update_sender.send(0.0).await;
            return;
        }

        let mut read_interval = interval(POLL_INTERVAL);
        loop {
            read_interval.tick().await;

            let offset = match self.read_offset_with_retry().await {
                Ok(offset) => offset,
                Err(e) => {
                    tracing::warn!(error = %e, "home assistant read failed, using zero offset");
                    0.0
                }
            };

            if self.update_sender.send(offset).await.is_err() {
                tracing::info!("offset receiver gone, stopping home assistant reader");
                break;
            }
        }
    }

    async fn read_offset_with_retry(&mut self) -> anyhow::Result<f64> {
        let mut attempt = 1;
        loop {
            match self.read_offset().await {
                Ok(offset) => return Ok(offset),
                Err(e) if attempt < MAX_RETRIES => {
                    tracing::debug!(error = %e, "home assistant read attempt {attempt} failed, retrying");
                    sleep(Duration::from_millis(200 * u64::from(attempt))).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e.context(format!("all {MAX_RETRIES} attempts failed")));
                }
            }
        }
    }

    async fn read_offset(&mut self) -> anyhow::Result<f64> {
        let import = self.read_sensor_value(&self.import_sensor).await?;
        let export = self.read_sensor_value(&self.export_sensor).await?;

        let raw_offset = import - export;
        let offset = match self.smoothing.as_mut() {
            Some(average) => average.add(raw_offset),
            None => raw_offset,
        };

        tracing::debug!(import, export, raw_offset, offset, "home assistant offset");
        Ok(offset)
    }

    async fn read_sensor_value(&self, sensor_name: &str) -> anyhow::Result<f64> {
        if sensor_name.is_empty() {
            return Ok(0.0);
        }
        let sensor = self.ha_client.read_sensor_value(sensor_name).await?;
        sensor.state.parse::<f64>().map_err(|e| {
            anyhow::anyhow!(
                "failed to parse sensor {sensor_name} value '{}': {e}",
                sensor.state
            )
        })
    }
}

fn display_sensor(sensor: &str) -> &str {
    if sensor.is_empty() {
        "none"
    } else {
        sensor
    }
}

/// Mean over the last `window` samples, or over all samples while fewer
/// have been seen.
#[derive(Debug, Clone)]
struct RollingAverage {
    samples: VecDeque<f64>,
    window: usize,
    sum: f64,
}

impl RollingAverage {
    fn new(window: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(window),
            window: window.max(1),
            sum: 0.0,
        }
    }

    fn add(&mut self, value: f64) -> f64 {
        if self.samples.len() == self.window {
            if let Some(oldest) = self.samples.pop_front() {
                self.sum -= oldest;
            }
        }
        self.samples.push_back(value);
        self.sum += value;
        self.average()
    }

    fn average(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.sum / self.samples.len() as f64
        }
    }
}
