use serde_derive::{Deserialize, Serialize};

/// Minimal Home Assistant REST client for reading sensor states.
pub struct HomeAssistantApi {
    endpoint_url: String,
    auth_token: String,
    client: reqwest::Client,
}

impl HomeAssistantApi {
    pub fn new(endpoint_url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into().trim_end_matches('/').to_string(),
            auth_token: auth_token.into(),
            client: reqwest::Client::new(),
        }
    }

    pub async fn read_sensor_value(&self, sensor_path: &str) -> anyhow::Result<HaSensor> {
        if self.endpoint_url.is_empty() {
            anyhow::bail!("No HA connection");
        }
        let result = self
            .client
            .get(format!("{}/api/states/{}", self.endpoint_url, sensor_path))
            .bearer_auth(&self.auth_token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(result)
    }
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaSensor {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub last_changed: String,
    #[serde(default)]
    pub last_updated: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_sensor_value() {
        let mut server = mockito::Server::new_async().await;

        let mock = server
            .mock("GET", "/api/states/sensor.grid_import")
            .match_header("Authorization", "Bearer test_token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"
                {
                    "entity_id": "sensor.grid_import",
                    "state": "412.5",
                    "last_changed": "2023-01-01T12:00:00Z",
                    "last_updated": "2023-01-01T12:00:00Z"
                }
            "#,
            )
            .create_async()
            .await;

        let api = HomeAssistantApi::new(format!("{}/", server.url()), "test_token");
        let sensor = api.read_sensor_value("sensor.grid_import").await.unwrap();

        assert_eq!(sensor.entity_id, "sensor.grid_import");
        assert_eq!(sensor.state, "412.5");
        assert_eq!(sensor.last_changed, "2023-01-01T12:00:00Z");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_error_is_surfaced() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/states/sensor.missing")
            .with_status(404)
            .create_async()
            .await;

        let api = HomeAssistantApi::new(server.url(), "token");
        assert!(api.read_sensor_value("sensor.missing").await.is_err());
    }

    #[tokio::test]
    async fn test_no_connection() {
        let api = HomeAssistantApi::new("", "token");
        let result = api.read_sensor_value("sensor.grid_import").await;

        assert_eq!(result.unwrap_err().to_string(), "No HA connection");
    }
}
