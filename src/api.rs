//! HTTP operations against the Statehost API
//!
//! The request/response surface the realtime core needs: fetching an
//! instance, creating one, and sending it an event. Status mapping follows
//! one helper so every operation reports errors the same way.

use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::debug;

use crate::actor::InstanceSnapshot;
use crate::error::{ClientError, Result};
use crate::token::TokenProvider;

pub(crate) struct Api {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenProvider>,
}

#[derive(Serialize)]
struct SendEventRequest<'a> {
    event: &'a JsonValue,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateInstanceRequest<'a> {
    slug: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a JsonValue>,
}

impl Api {
    pub fn new(http: reqwest::Client, base_url: String, tokens: Arc<TokenProvider>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
        }
    }

    /// Fetch the current state of an instance.
    pub async fn get_instance(&self, machine: &str, instance: &str) -> Result<InstanceSnapshot> {
        let url = format!(
            "{}/machines/{}/i/{}",
            self.base_url,
            encode(machine),
            encode(instance)
        );
        let request = self.http.get(&url);
        let response = self.authorized(request).await?.send().await?;
        self.handle_response(response).await
    }

    /// Create a new instance of a machine.
    pub async fn create_instance(
        &self,
        machine: &str,
        instance: &str,
        context: Option<&JsonValue>,
    ) -> Result<InstanceSnapshot> {
        let url = format!("{}/machines/{}", self.base_url, encode(machine));
        let body = CreateInstanceRequest {
            slug: instance,
            context,
        };
        let request = self.http.post(&url).json(&body);
        let response = self.authorized(request).await?.send().await?;
        self.handle_response(response).await
    }

    /// Send an event to an instance.
    pub async fn send_event(
        &self,
        machine: &str,
        instance: &str,
        event: &JsonValue,
    ) -> Result<InstanceSnapshot> {
        debug!(machine = %machine, instance = %instance, "sending event");
        let url = format!(
            "{}/machines/{}/i/{}/events",
            self.base_url,
            encode(machine),
            encode(instance)
        );
        let body = SendEventRequest { event };
        let request = self.http.post(&url).json(&body);
        let response = self.authorized(request).await?.send().await?;
        self.handle_response(response).await
    }

    async fn authorized(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        let token = self.tokens.get_token().await?;
        Ok(request.bearer_auth(token))
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ClientError::Authorization(format!(
                "request rejected with status {}",
                status.as_u16()
            )));
        }

        if !status.is_success() {
            let code = response
                .json::<JsonValue>()
                .await
                .ok()
                .and_then(|body| body.get("code").and_then(|c| c.as_str()).map(String::from))
                .unwrap_or_default();
            return Err(ClientError::Api {
                status: status.as_u16(),
                code,
            });
        }

        let body = response.json().await?;
        Ok(body)
    }
}

fn encode(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes()).collect()
}
