//! REST client for the template service
//!
//! [`TemplateGateway`] is the contract the playground depends on;
//! [`HttpGateway`] implements it with `reqwest` against the cloud API.

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::config::PlaygroundConfig;
use crate::error::{Error, Result};
use crate::model::{
    PinUpdate, TemplateDetail, TemplatePayload, TemplateSummary, VirtualPin, WidgetDefinition,
    WidgetRecord,
};
use crate::session::Session;

/// Longest error message kept from a response body
const MAX_ERROR_MESSAGE: usize = 4096;

/// Remote operations consumed by the playground
#[async_trait]
pub trait TemplateGateway: Send + Sync {
    /// `GET /widgets`
    async fn list_widgets(&self) -> Result<Vec<WidgetDefinition>>;

    /// `GET /templates`
    async fn list_templates(&self) -> Result<Vec<TemplateSummary>>;

    /// `GET /templates/{id}`
    async fn fetch_template(&self, template_id: &str) -> Result<TemplateDetail>;

    /// `POST /templates`
    async fn create_template(&self, payload: &TemplatePayload) -> Result<TemplateSummary>;

    /// `PUT /templates/{id}`
    async fn update_template(&self, template_id: &str, payload: &TemplatePayload) -> Result<()>;

    /// Virtual pins of a template
    async fn list_pins(&self, template_id: &str) -> Result<Vec<VirtualPin>> {
        Ok(self.fetch_template(template_id).await?.virtual_pins)
    }

    /// `PUT /templates/{id}/virtualPins/{pinId}`
    async fn update_pin(&self, template_id: &str, pin_id: &str, update: &PinUpdate) -> Result<()>;

    /// `DELETE /templates/{id}/virtualPins/{pinId}`
    async fn delete_pin(&self, template_id: &str, pin_id: &str) -> Result<()>;
}

/// Envelope some endpoints wrap their payload in
#[derive(Deserialize)]
#[serde(untagged)]
enum Envelope<T> {
    Data { data: T },
    Bare(T),
}

impl<T> Envelope<T> {
    fn into_inner(self) -> T {
        match self {
            Envelope::Data { data } => data,
            Envelope::Bare(inner) => inner,
        }
    }
}

/// HTTP implementation of [`TemplateGateway`]
pub struct HttpGateway {
    base_url: String,
    session: Session,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpGateway")
            .field("base_url", &self.base_url)
            .field("session", &self.session)
            .finish()
    }
}

impl HttpGateway {
    pub fn new(config: &PlaygroundConfig, session: Session) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        debug!(base_url = %config.api_url, "template gateway initialized");

        Ok(Self {
            base_url: config.api_url.trim_end_matches('/').to_string(),
            session,
            client,
        })
    }

    /// Exchanges an identity-provider token for a session token (`POST /login`)
    pub async fn login(config: &PlaygroundConfig, provider_token: &str) -> Result<Session> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        let url = format!("{}/login", config.api_url.trim_end_matches('/'));
        let resp = client
            .post(&url)
            .json(&serde_json::json!({ "token": provider_token }))
            .send()
            .await?;
        let session: Envelope<Session> = read_json(resp).await?;
        Ok(session.into_inner())
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.header("Authorization", self.session.bearer())
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        debug!(url = %url, "GET");
        let resp = self.authorized(self.client.get(&url)).send().await?;
        let body: Envelope<T> = read_json(resp).await?;
        Ok(body.into_inner())
    }
}

#[async_trait]
impl TemplateGateway for HttpGateway {
    async fn list_widgets(&self) -> Result<Vec<WidgetDefinition>> {
        let records: Vec<WidgetRecord> = self.get("/widgets").await?;
        Ok(records.into_iter().map(WidgetDefinition::from).collect())
    }

    async fn list_templates(&self) -> Result<Vec<TemplateSummary>> {
        self.get("/templates").await
    }

    async fn fetch_template(&self, template_id: &str) -> Result<TemplateDetail> {
        self.get(&format!("/templates/{template_id}")).await
    }

    async fn create_template(&self, payload: &TemplatePayload) -> Result<TemplateSummary> {
        let url = self.url("/templates");
        debug!(url = %url, widgets = payload.widget_list.len(), "POST template");
        let resp = self.authorized(self.client.post(&url)).json(payload).send().await?;
        let created: Envelope<TemplateSummary> = read_json(resp).await?;
        Ok(created.into_inner())
    }

    async fn update_template(&self, template_id: &str, payload: &TemplatePayload) -> Result<()> {
        let url = self.url(&format!("/templates/{template_id}"));
        debug!(url = %url, widgets = payload.widget_list.len(), "PUT template");
        let resp = self.authorized(self.client.put(&url)).json(payload).send().await?;
        expect_success(resp).await
    }

    async fn update_pin(&self, template_id: &str, pin_id: &str, update: &PinUpdate) -> Result<()> {
        let url = self.url(&format!("/templates/{template_id}/virtualPins/{pin_id}"));
        debug!(url = %url, pin = update.pin_id, "PUT virtual pin");
        let resp = self.authorized(self.client.put(&url)).json(update).send().await?;
        expect_success(resp).await
    }

    async fn delete_pin(&self, template_id: &str, pin_id: &str) -> Result<()> {
        let url = self.url(&format!("/templates/{template_id}/virtualPins/{pin_id}"));
        debug!(url = %url, "DELETE virtual pin");
        let resp = self.authorized(self.client.delete(&url)).send().await?;
        expect_success(resp).await
    }
}

async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    if !resp.status().is_success() {
        return Err(error_from_response(resp).await);
    }
    let bytes = resp.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn expect_success(resp: reqwest::Response) -> Result<()> {
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(error_from_response(resp).await)
    }
}

async fn error_from_response(resp: reqwest::Response) -> Error {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    let mut message = extract_error_message(&body);
    if message.is_empty() {
        message = status.canonical_reason().unwrap_or("request failed").to_string();
    }

    match status.as_u16() {
        401 | 403 => Error::Unauthorized(message),
        code => Error::Server {
            status: code,
            message,
        },
    }
}

/// Best human-readable message in an error body.
///
/// Tries the body as JSON, then the first `{...}` embedded in it, then
/// falls back to the trimmed text.
pub fn extract_error_message(body: &str) -> String {
    let text = body.trim();

    let from_json = serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| message_in(&v))
        .or_else(|| {
            let start = text.find('{')?;
            let end = text.rfind('}')?;
            (start < end)
                .then(|| serde_json::from_str::<Value>(&text[start..=end]).ok())
                .flatten()
                .and_then(|v| message_in(&v))
        });

    let mut message = from_json.unwrap_or_else(|| text.to_string());
    if message.len() > MAX_ERROR_MESSAGE {
        let cut = (0..=MAX_ERROR_MESSAGE)
            .rev()
            .find(|i| message.is_char_boundary(*i))
            .unwrap_or(0);
        message.truncate(cut);
    }
    message
}

fn message_in(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Object(obj) => ["message", "error", "msg"]
            .iter()
            .filter_map(|key| obj.get(*key))
            .find_map(message_in),
        _ => None,
    }
}
