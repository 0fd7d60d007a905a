//! MES Client (C5): a stateless HTTP client holding a bearer token and an
//! `empresa-id` header (spec §4.4). Grounded on `handler/discord.rs`'s
//! POST/JSON/status-check pattern for the request shape, and on
//! `original_source/monitor_industrial/sispro_connector.py` for the
//! endpoint paths, query parameters and headers.

use crate::model::{Increment, Order, Station};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Every MES operation surfaces exactly one of these (spec §4.4). `Ok`
/// carries the typed success payload.
#[derive(Debug)]
pub enum MesOutcome<T> {
    Ok(T),
    AuthExpired,
    NotFound,
    Transient(String),
    Permanent(String),
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    success: bool,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct EmptyEnvelope {
    success: bool,
}

#[derive(Debug, Deserialize)]
pub struct OrderProgress {
    #[serde(rename = "quantityPending")]
    pub quantity_pending: i64,
    #[serde(rename = "progressRatio")]
    pub progress_ratio: f64,
}

/// The recipe document returned by `/estatus`. Advisory only — the engine
/// never requires it to count pieces (spec §4.4), so its shape is kept
/// loose rather than modeled field-by-field.
#[derive(Debug, Deserialize)]
pub struct OrderRecipe {
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct IncrementPayload<'a> {
    #[serde(rename = "orderCode")]
    order_code: &'a str,
    upc: &'a str,
    #[serde(rename = "stationId")]
    station_id: u64,
    #[serde(rename = "userId")]
    user_id: u64,
    quantity: i64,
    fingerprint: &'a str,
    #[serde(rename = "occurredAt")]
    occurred_at: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    success: bool,
    accepted: Option<usize>,
}

pub struct MesClient {
    client: reqwest::Client,
    base_url: String,
    company_id: u64,
    username: String,
    password: String,
    token: Arc<RwLock<Option<String>>>,
}

impl MesClient {
    pub fn new(
        base_url: impl Into<String>,
        company_id: u64,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            company_id,
            username: username.into(),
            password: password.into(),
            token: Arc::new(RwLock::new(None)),
        }
    }

    async fn headers(&self) -> reqwest::header::HeaderMap {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "empresa-id",
            self.company_id.to_string().parse().expect("numeric header value"),
        );
        if let Some(token) = self.token.read().await.as_ref() {
            let value = format!("Bearer {token}");
            if let Ok(header_value) = value.parse() {
                headers.insert(reqwest::header::AUTHORIZATION, header_value);
            }
        }
        headers
    }

    /// POST `/api/auth/login_local` using the credentials configured at
    /// construction (spec §4.4). Called on boot and, via `reauthenticate`,
    /// on `AuthExpired` — the Replicator never supplies its own credentials,
    /// since it only ever holds the token, not the password (spec §5: "only
    /// the Replicator refreshes").
    pub async fn authenticate(&self) -> MesOutcome<()> {
        let url = format!("{}/api/auth/login_local", self.base_url);
        let result = tokio::time::timeout(
            DEFAULT_TIMEOUT,
            self.client
                .post(&url)
                .json(&LoginRequest {
                    username: &self.username,
                    password: &self.password,
                })
                .headers(self.headers().await)
                .send(),
        )
        .await;

        let response = match result {
            Err(_) => return MesOutcome::Transient("login timed out".to_string()),
            Ok(Err(e)) => return MesOutcome::Transient(e.to_string()),
            Ok(Ok(r)) => r,
        };

        if response.status().as_u16() == 401 {
            return MesOutcome::AuthExpired;
        }
        if response.status().is_server_error() {
            return MesOutcome::Transient(format!("login returned {}", response.status()));
        }
        if !response.status().is_success() {
            return MesOutcome::Permanent(format!("login returned {}", response.status()));
        }

        match response.json::<LoginResponse>().await {
            Ok(body) if body.success => {
                if let Some(token) = body.token {
                    *self.token.write().await = Some(token);
                    MesOutcome::Ok(())
                } else {
                    MesOutcome::Permanent("login succeeded without a token".to_string())
                }
            }
            Ok(_) => MesOutcome::Permanent("login rejected".to_string()),
            Err(e) => MesOutcome::Transient(e.to_string()),
        }
    }

    /// Refreshes the bearer token against the stored credentials. An alias
    /// for `authenticate` kept at the Replicator's call site (spec §4.5
    /// step 4: "On `AuthExpired`, refresh token once and retry the same
    /// batch") so the reauthentication path reads as a distinct recovery
    /// step rather than a repeat of the boot-time login call.
    pub async fn reauthenticate(&self) -> MesOutcome<()> {
        self.authenticate().await
    }

    /// GET `/api/estacionesTrabajo`. Cached for session lifetime by the
    /// caller; the client itself performs no caching.
    pub async fn list_stations(&self) -> MesOutcome<Vec<Station>> {
        let url = format!("{}/api/estacionesTrabajo", self.base_url);
        self.get_envelope(&url).await
    }

    /// GET `/api/ordenesDeFabricacion/listarAsignadas?estacionTrabajoId=N`.
    pub async fn list_assigned_orders(&self, station_id: u64) -> MesOutcome<Vec<Order>> {
        let url = format!(
            "{}/api/ordenesDeFabricacion/listarAsignadas?estacionTrabajoId={}",
            self.base_url, station_id
        );
        self.get_envelope(&url).await
    }

    /// GET `/api/ordenesDeFabricacion/estatus?orden=N`. Advisory recipe
    /// lookup performed once on order selection; failures never block the
    /// `ORDER_SELECTED -> AWAITING_UPC` transition (spec §4.6).
    pub async fn get_order_recipe(&self, order_doc_num: &str) -> MesOutcome<OrderRecipe> {
        let url = format!(
            "{}/api/ordenesDeFabricacion/estatus?orden={}",
            self.base_url, order_doc_num
        );
        self.get_envelope(&url).await
    }

    /// GET `/api/ordenesDeFabricacion/avance?ordenFabricacion=X`.
    pub async fn get_order_progress(&self, order_code: &str) -> MesOutcome<OrderProgress> {
        let url = format!(
            "{}/api/ordenesDeFabricacion/avance?ordenFabricacion={}",
            self.base_url, order_code
        );
        self.get_envelope(&url).await
    }

    /// POST `/api/lecturaUPC/registrar` for a batch of increments.
    /// Idempotent by fingerprint server-side.
    pub async fn upload_increments(&self, batch: &[Increment]) -> MesOutcome<usize> {
        let url = format!("{}/api/lecturaUPC/registrar", self.base_url);
        let payload: Vec<IncrementPayload> = batch
            .iter()
            .map(|i| IncrementPayload {
                order_code: &i.order_code,
                upc: &i.upc,
                station_id: i.station_id,
                user_id: i.user_id,
                quantity: i.quantity,
                fingerprint: &i.fingerprint,
                occurred_at: i.occurred_at.to_rfc3339(),
            })
            .collect();

        let result = tokio::time::timeout(
            UPLOAD_TIMEOUT,
            self.client
                .post(&url)
                .json(&payload)
                .headers(self.headers().await)
                .send(),
        )
        .await;

        let response = match result {
            Err(_) => return MesOutcome::Transient("upload timed out".to_string()),
            Ok(Err(e)) => return MesOutcome::Transient(e.to_string()),
            Ok(Ok(r)) => r,
        };

        if response.status().as_u16() == 401 {
            return MesOutcome::AuthExpired;
        }
        if response.status().is_server_error() {
            return MesOutcome::Transient(format!("upload returned {}", response.status()));
        }
        if !response.status().is_success() {
            return MesOutcome::Permanent(format!("upload returned {}", response.status()));
        }

        match response.json::<UploadResponse>().await {
            Ok(body) if body.success => MesOutcome::Ok(body.accepted.unwrap_or(batch.len())),
            Ok(_) => MesOutcome::Permanent("upload rejected".to_string()),
            Err(e) => MesOutcome::Transient(e.to_string()),
        }
    }

    /// POST `/api/ordenesDeFabricacion/cerrarOrden`.
    pub async fn close_order(&self, order_code: &str, station_id: u64) -> MesOutcome<()> {
        #[derive(Serialize)]
        struct CloseRequest<'a> {
            #[serde(rename = "ordenFabricacion")]
            order_code: &'a str,
            #[serde(rename = "estacionId")]
            station_id: u64,
        }

        let url = format!("{}/api/ordenesDeFabricacion/cerrarOrden", self.base_url);
        let result = tokio::time::timeout(
            DEFAULT_TIMEOUT,
            self.client
                .post(&url)
                .json(&CloseRequest {
                    order_code,
                    station_id,
                })
                .headers(self.headers().await)
                .send(),
        )
        .await;

        let response = match result {
            Err(_) => return MesOutcome::Transient("close order timed out".to_string()),
            Ok(Err(e)) => return MesOutcome::Transient(e.to_string()),
            Ok(Ok(r)) => r,
        };

        if response.status().as_u16() == 401 {
            return MesOutcome::AuthExpired;
        }
        if response.status().as_u16() == 404 {
            return MesOutcome::NotFound;
        }
        if response.status().is_server_error() {
            return MesOutcome::Transient(format!("close order returned {}", response.status()));
        }
        if !response.status().is_success() {
            return MesOutcome::Permanent(format!("close order returned {}", response.status()));
        }

        match response.json::<EmptyEnvelope>().await {
            Ok(body) if body.success => MesOutcome::Ok(()),
            Ok(_) => MesOutcome::Permanent("close order rejected".to_string()),
            Err(e) => MesOutcome::Transient(e.to_string()),
        }
    }

    async fn get_envelope<T>(&self, url: &str) -> MesOutcome<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let result = tokio::time::timeout(
            DEFAULT_TIMEOUT,
            self.client.get(url).headers(self.headers().await).send(),
        )
        .await;

        let response = match result {
            Err(_) => return MesOutcome::Transient(format!("{url} timed out")),
            Ok(Err(e)) => return MesOutcome::Transient(e.to_string()),
            Ok(Ok(r)) => r,
        };

        if response.status().as_u16() == 401 {
            return MesOutcome::AuthExpired;
        }
        if response.status().as_u16() == 404 {
            return MesOutcome::NotFound;
        }
        if response.status().is_server_error() {
            return MesOutcome::Transient(format!("{url} returned {}", response.status()));
        }
        if !response.status().is_success() {
            return MesOutcome::Permanent(format!("{url} returned {}", response.status()));
        }

        match response.json::<Envelope<T>>().await {
            Ok(body) if body.success => match body.data {
                Some(data) => MesOutcome::Ok(data),
                None => MesOutcome::NotFound,
            },
            Ok(_) => MesOutcome::Permanent(format!("{url} reported failure")),
            Err(e) => MesOutcome::Transient(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn headers_include_empresa_id_and_no_auth_before_login() {
        let client = MesClient::new("http://localhost", 42, "operator", "secret");
        let headers = client.headers().await;
        assert_eq!(headers.get("empresa-id").unwrap(), "42");
        assert!(headers.get(reqwest::header::AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn headers_include_bearer_token_after_login() {
        let client = MesClient::new("http://localhost", 1, "operator", "secret");
        *client.token.write().await = Some("abc123".to_string());
        let headers = client.headers().await;
        assert_eq!(
            headers.get(reqwest::header::AUTHORIZATION).unwrap(),
            "Bearer abc123"
        );
    }
}
