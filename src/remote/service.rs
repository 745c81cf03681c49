use std::time::Duration;
use async_trait::async_trait;
use log::{debug, error};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde_json::json;

use super::{AggregatedReading, RemoteError, RemoteStore, Result};
use crate::config::{BoardConfig, RemoteSettings};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Document store reached over HTTP.
///
/// Board records live under `/boards/{id}`, readings are posted to
/// `/readings/{db}/{collection}` and logs to `/logs/{id}`.
pub struct HttpRemoteStore {
    client: Client,
    base_url: String,
    db_name: String,
    collection_name: String,
    username: Option<String>,
    password: Option<String>,
}

impl HttpRemoteStore {
    pub fn new(settings: &RemoteSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("sensorlink/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RemoteError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            base_url: settings.server.trim_end_matches('/').to_string(),
            db_name: settings.db_name.clone(),
            collection_name: settings.collection_name.clone(),
            username: settings.username.clone(),
            password: settings.password.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        debug!("{} {}", method, url);
        let builder = self.client.request(method, url);
        match &self.username {
            Some(user) => builder.basic_auth(user, self.password.as_ref()),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        error!("Remote store request failed with status: {}", status);
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(RemoteError::Unavailable(format!("{}: {}", status, body)))
        } else {
            Err(RemoteError::Rejected {
                status: status.as_u16(),
                message: body,
            })
        }
    }
}

fn transport_error(error: reqwest::Error) -> RemoteError {
    if error.is_decode() {
        RemoteError::Decode(error.to_string())
    } else {
        RemoteError::Unavailable(error.to_string())
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn fetch_config(&self, id: &str) -> Result<Option<BoardConfig>> {
        let builder = self.request(Method::GET, &format!("/boards/{}", id));
        match self.send(builder).await {
            Ok(response) => {
                let config = response
                    .json::<BoardConfig>()
                    .await
                    .map_err(|e| RemoteError::Decode(e.to_string()))?;
                Ok(Some(config))
            }
            Err(RemoteError::Rejected { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn upsert_config(&self, id: &str, config: &BoardConfig) -> Result<()> {
        let builder = self.request(Method::PUT, &format!("/boards/{}", id)).json(config);
        self.send(builder).await?;
        Ok(())
    }

    async fn insert_reading(&self, reading: &AggregatedReading) -> Result<()> {
        let path = format!("/readings/{}/{}", self.db_name, self.collection_name);
        let builder = self.request(Method::POST, &path).json(reading);
        self.send(builder).await?;
        Ok(())
    }

    async fn upload_log(&self, id: &str, contents: &str) -> Result<()> {
        let builder = self
            .request(Method::PUT, &format!("/logs/{}", id))
            .json(&json!({ "contents": contents }));
        self.send(builder).await?;
        Ok(())
    }
}
