//! Azure Event Grid namespace client registry over the ARM REST API
//!
//! Client resources live at
//! `{endpoint}/subscriptions/{sub}/resourceGroups/{rg}/providers/Microsoft.EventGrid/namespaces/{ns}/clients/{name}`.
//! Every client is created with subject-matches-authentication-name
//! certificate validation, so the device certificate CN is what binds a TLS
//! session to the client.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use devicetrust_common::config::BrokerSettings;

use crate::auth::{token_provider_from_credentials, TokenProvider};
use crate::control_plane::{ClientResource, ClientState, ControlPlane};
use crate::error::{RegistryError, Result};

/// Certificate validation scheme required for device clients
pub const VALIDATION_SCHEME: &str = "SubjectMatchesAuthenticationName";

/// Event Grid namespace control plane
pub struct EventGridControlPlane {
    http: reqwest::Client,
    namespace_url: String,
    api_version: String,
    tokens: Arc<dyn TokenProvider>,
}

impl std::fmt::Debug for EventGridControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventGridControlPlane")
            .field("namespace_url", &self.namespace_url)
            .field("api_version", &self.api_version)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct ClientEnvelope {
    name: String,
    #[serde(default)]
    properties: ClientProperties,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientProperties {
    #[serde(default)]
    authentication_name: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    attributes: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientPage {
    #[serde(default)]
    value: Vec<ClientEnvelope>,
    #[serde(default)]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ArmErrorResponse {
    error: ArmError,
}

#[derive(Debug, Deserialize)]
struct ArmError {
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Serialize)]
struct ClientBody {
    properties: serde_json::Value,
}

impl From<ClientEnvelope> for ClientResource {
    fn from(envelope: ClientEnvelope) -> Self {
        let props = envelope.properties;
        let state = match props.state.as_deref() {
            Some(s) if s.eq_ignore_ascii_case("disabled") => ClientState::Disabled,
            _ => ClientState::Enabled,
        };
        let device_id = props
            .attributes
            .as_ref()
            .and_then(|attrs| attrs.get("deviceId"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        Self {
            authentication_name: props
                .authentication_name
                .unwrap_or_else(|| envelope.name.clone()),
            name: envelope.name,
            state,
            description: props.description,
            device_id,
        }
    }
}

fn client_body(client: &ClientResource) -> ClientBody {
    let mut attributes = serde_json::Map::new();
    attributes.insert("type".into(), json!("device"));
    if let Some(device_id) = &client.device_id {
        attributes.insert("deviceId".into(), json!(device_id));
    }

    ClientBody {
        properties: json!({
            "authenticationName": client.authentication_name,
            "state": match client.state {
                ClientState::Enabled => "Enabled",
                ClientState::Disabled => "Disabled",
            },
            "clientCertificateAuthentication": {
                "validationScheme": VALIDATION_SCHEME,
            },
            "description": client.description,
            "attributes": attributes,
        }),
    }
}

/// Map a non-success status to a classified error
fn classify_status(
    operation: &str,
    client_name: &str,
    status: StatusCode,
    body: &str,
) -> RegistryError {
    let detail = serde_json::from_str::<ArmErrorResponse>(body)
        .map(|e| format!("{}: {}", e.error.code, e.error.message))
        .unwrap_or_else(|_| format!("HTTP {}", status));

    match status {
        StatusCode::NOT_FOUND => RegistryError::not_found(client_name),
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
            RegistryError::conflict(client_name)
        }
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            RegistryError::transient(operation, detail)
        }
        s if s.is_server_error() => RegistryError::transient(operation, detail),
        s => RegistryError::Rejected {
            operation: operation.to_string(),
            status: Some(s.as_u16()),
            message: detail,
        },
    }
}

fn classify_transport(operation: &str, err: reqwest::Error) -> RegistryError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RegistryError::transient(operation, err.to_string())
    } else {
        RegistryError::rejected(operation, err.to_string())
    }
}

impl EventGridControlPlane {
    /// Create a control plane from broker settings
    ///
    /// Fails if the namespace coordinates or credentials are incomplete.
    pub fn from_settings(settings: &BrokerSettings) -> Result<Self> {
        settings.validate_remote()?;

        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .map_err(|e| RegistryError::rejected("build_http_client", e.to_string()))?;
        let tokens = token_provider_from_credentials(&settings.credentials, http.clone())?;

        Ok(Self::new(http, settings, tokens))
    }

    /// Create a control plane with an explicit HTTP client and token source
    pub fn new(
        http: reqwest::Client,
        settings: &BrokerSettings,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        let namespace_url = format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.EventGrid/namespaces/{}",
            settings.endpoint.trim_end_matches('/'),
            settings.subscription_id,
            settings.resource_group,
            settings.namespace,
        );
        Self {
            http,
            namespace_url,
            api_version: settings.api_version.clone(),
            tokens,
        }
    }

    fn client_url(&self, name: &str) -> String {
        format!(
            "{}/clients/{}?api-version={}",
            self.namespace_url, name, self.api_version
        )
    }

    fn clients_url(&self) -> String {
        format!(
            "{}/clients?api-version={}",
            self.namespace_url, self.api_version
        )
    }

    async fn request(
        &self,
        operation: &str,
        method: Method,
        url: &str,
    ) -> Result<reqwest::RequestBuilder> {
        let token = self.tokens.bearer_token().await?;
        debug!(operation = operation, method = %method, url = %url, "Control plane request");
        Ok(self.http.request(method, url).bearer_auth(token))
    }

    async fn send(
        &self,
        operation: &str,
        client_name: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<(StatusCode, String)> {
        let response = request
            .send()
            .await
            .map_err(|e| classify_transport(operation, e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| classify_transport(operation, e))?;

        if status.is_success() {
            Ok((status, body))
        } else {
            Err(classify_status(operation, client_name, status, &body))
        }
    }

    fn parse<T: serde::de::DeserializeOwned>(operation: &str, body: &str) -> Result<T> {
        serde_json::from_str(body).map_err(|e| {
            RegistryError::rejected(operation, format!("unexpected response body: {}", e))
        })
    }
}

#[async_trait]
impl ControlPlane for EventGridControlPlane {
    async fn create_client(&self, client: &ClientResource) -> Result<ClientResource> {
        let operation = "create_client";
        let url = self.client_url(&client.name);
        let request = self
            .request(operation, Method::PUT, &url)
            .await?
            // create-only: an existing client must surface as a conflict
            .header(reqwest::header::IF_NONE_MATCH, "*")
            .json(&client_body(client));

        let (status, body) = self.send(operation, &client.name, request).await?;
        info!(client = %client.name, status = %status, "Created broker client");

        if body.trim().is_empty() {
            return Ok(client.clone());
        }
        let envelope: ClientEnvelope = Self::parse(operation, &body)?;
        Ok(envelope.into())
    }

    async fn get_client(&self, name: &str) -> Result<Option<ClientResource>> {
        let operation = "get_client";
        let url = self.client_url(name);
        let request = self.request(operation, Method::GET, &url).await?;

        match self.send(operation, name, request).await {
            Ok((_, body)) => {
                let envelope: ClientEnvelope = Self::parse(operation, &body)?;
                Ok(Some(envelope.into()))
            }
            Err(RegistryError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_clients(&self) -> Result<Vec<ClientResource>> {
        let operation = "list_clients";
        let mut clients = Vec::new();
        let mut next = Some(self.clients_url());

        while let Some(url) = next.take() {
            let request = self.request(operation, Method::GET, &url).await?;
            let (_, body) = self
                .send(operation, "", request)
                .await
                .map_err(|e| match e {
                    RegistryError::NotFound { .. } => RegistryError::Rejected {
                        operation: operation.to_string(),
                        status: Some(404),
                        message: format!("namespace {} not found", self.namespace_url),
                    },
                    other => other,
                })?;
            let page: ClientPage = Self::parse(operation, &body)?;

            clients.extend(page.value.into_iter().map(ClientResource::from));
            next = page.next_link.filter(|link| !link.is_empty());
        }

        debug!(count = clients.len(), "Listed broker clients");
        Ok(clients)
    }

    async fn delete_client(&self, name: &str) -> Result<()> {
        let operation = "delete_client";
        let url = self.client_url(name);
        let request = self.request(operation, Method::DELETE, &url).await?;

        let (status, _) = self.send(operation, name, request).await?;
        if status == StatusCode::NO_CONTENT {
            // ARM answers 204 when there was nothing to delete
            return Err(RegistryError::not_found(name));
        }
        if status == StatusCode::ACCEPTED {
            warn!(client = %name, "Client deletion accepted, completing asynchronously");
        }
        info!(client = %name, "Deleted broker client");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;

    fn settings() -> BrokerSettings {
        BrokerSettings {
            subscription_id: "sub-1".into(),
            resource_group: "rg-iot".into(),
            namespace: "makerspace".into(),
            ..Default::default()
        }
    }

    fn plane() -> EventGridControlPlane {
        EventGridControlPlane::new(
            reqwest::Client::new(),
            &settings(),
            Arc::new(StaticToken::new("t")),
        )
    }

    #[test]
    fn builds_arm_resource_urls() {
        let plane = plane();
        assert_eq!(
            plane.client_url("device-sensor-001"),
            "https://management.azure.com/subscriptions/sub-1/resourceGroups/rg-iot/providers/Microsoft.EventGrid/namespaces/makerspace/clients/device-sensor-001?api-version=2025-02-15"
        );
        assert!(plane
            .clients_url()
            .ends_with("/namespaces/makerspace/clients?api-version=2025-02-15"));
    }

    #[test]
    fn create_body_binds_authentication_name() {
        let client = ClientResource::for_device("device-sensor-001", "sensor-001-authnID", "sensor-001");
        let body = serde_json::to_value(client_body(&client)).unwrap();
        let props = &body["properties"];

        assert_eq!(props["authenticationName"], "sensor-001-authnID");
        assert_eq!(props["state"], "Enabled");
        assert_eq!(
            props["clientCertificateAuthentication"]["validationScheme"],
            VALIDATION_SCHEME
        );
        assert_eq!(props["attributes"]["deviceId"], "sensor-001");
        assert_eq!(props["attributes"]["type"], "device");
    }

    #[test]
    fn parses_client_envelope() {
        let body = r#"{
            "name": "device-sensor-001",
            "properties": {
                "authenticationName": "sensor-001-authnID",
                "state": "Disabled",
                "attributes": {"deviceId": "sensor-001", "type": "device"},
                "provisioningState": "Succeeded"
            }
        }"#;
        let envelope: ClientEnvelope = serde_json::from_str(body).unwrap();
        let client = ClientResource::from(envelope);

        assert_eq!(client.name, "device-sensor-001");
        assert_eq!(client.authentication_name, "sensor-001-authnID");
        assert_eq!(client.state, ClientState::Disabled);
        assert_eq!(client.device_id.as_deref(), Some("sensor-001"));
    }

    #[test]
    fn parses_list_page_with_next_link() {
        let body = r#"{"value": [{"name": "device-a1b"}, {"name": "grafana"}], "nextLink": "https://x/next"}"#;
        let page: ClientPage = serde_json::from_str(body).unwrap();
        assert_eq!(page.value.len(), 2);
        assert_eq!(page.next_link.as_deref(), Some("https://x/next"));
    }

    #[test]
    fn classifies_statuses() {
        let arm = r#"{"error": {"code": "ServerBusy", "message": "try later"}}"#;

        assert!(classify_status("op", "c", StatusCode::NOT_FOUND, "").is_not_found());
        assert!(classify_status("op", "c", StatusCode::CONFLICT, "").is_conflict());
        assert!(classify_status("op", "c", StatusCode::PRECONDITION_FAILED, "").is_conflict());

        match classify_status("op", "c", StatusCode::SERVICE_UNAVAILABLE, arm) {
            RegistryError::Transient { message, .. } => assert_eq!(message, "ServerBusy: try later"),
            other => panic!("expected transient, got {other:?}"),
        }
        assert!(matches!(
            classify_status("op", "c", StatusCode::TOO_MANY_REQUESTS, ""),
            RegistryError::Transient { .. }
        ));
        assert!(matches!(
            classify_status("op", "c", StatusCode::FORBIDDEN, ""),
            RegistryError::Rejected { status: Some(403), .. }
        ));
    }

    #[test]
    fn from_settings_requires_namespace_coordinates() {
        let err = EventGridControlPlane::from_settings(&BrokerSettings::default()).unwrap_err();
        assert!(matches!(err, RegistryError::Config(_)));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transient() {
        let mut settings = settings();
        settings.endpoint = "http://127.0.0.1:9".into();
        let plane = EventGridControlPlane::new(
            reqwest::Client::builder()
                .timeout(std::time::Duration::from_millis(500))
                .build()
                .unwrap(),
            &settings,
            Arc::new(StaticToken::new("t")),
        );

        let err = plane.get_client("device-sensor-001").await.unwrap_err();
        assert!(matches!(err, RegistryError::Transient { .. }));
    }
}
