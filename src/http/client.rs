// apiflow — reqwest-backed HTTP transport

use super::{HttpRequest, HttpResponse, HttpTransport, TransportError};
use crate::config::HttpConfig;
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(config: &HttpConfig) -> anyhow::Result<Self> {
        let mut builder = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(config.user_agent.clone());

        if !config.proxy.is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(&config.proxy)?);
        }

        Ok(Self {
            client: builder.build()?,
        })
    }

    async fn perform(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let url = url::Url::parse(&request.url)
            .map_err(|e| TransportError::Other(format!("invalid URL '{}': {}", request.url, e)))?;
        let method = Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| TransportError::Other(format!("invalid method '{}'", request.method)))?;

        let mut builder = self.client.request(method, url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        builder = match &request.body {
            None | Some(Value::Null) => builder,
            Some(Value::String(raw)) => builder.body(raw.clone()),
            Some(json) => builder.json(json),
        };

        tracing::debug!(method = %request.method, url = %request.url, "Sending request");
        let start = Instant::now();
        let response = builder.send().await.map_err(classify)?;

        let status = response.status();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let bytes = response.bytes().await.map_err(classify)?;
        let duration = start.elapsed().as_millis() as u64;

        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };

        tracing::debug!(
            status = %status,
            duration_ms = duration,
            size = bytes.len(),
            "Response received"
        );

        Ok(HttpResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("").to_string(),
            headers,
            body,
            duration,
            size: bytes.len(),
        })
    }
}

fn classify(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() || e.is_request() {
        TransportError::Network(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(
        &self,
        request: &HttpRequest,
        cancel: CancellationToken,
    ) -> Result<HttpResponse, TransportError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Timeout),
            result = self.perform(request) => result,
        }
    }
}
