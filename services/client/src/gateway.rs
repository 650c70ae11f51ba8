//! API Gateway
//!
//! Token-gated calls against the dialogue backend. Every call asks the
//! `CredentialProvider` for a fresh token; nothing is cached between calls,
//! and nothing here touches session state. Callers route results through
//! the `SessionStateStore`.

use crate::{
    credentials::CredentialProvider,
    error::ApiError,
    models::{DialogueTurn, FinalizationResult, InitializedSession, SendMessagePayload, Statistics},
    transport::{Transport, TransportFailure},
};
use reqwest::{
    Method,
    header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue},
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use therapy_sim_core::{patient::PatientSummary, snapshot::SessionSnapshot};
use tracing::{debug, info, instrument, warn};

pub const INITIALIZE_PATH: &str = "/paciente/inicializar";
pub const PATIENT_SUMMARY_PATH: &str = "/paciente/resumen";
pub const STATUS_PATH: &str = "/sesion/estado";
pub const SEND_MESSAGE_PATH: &str = "/enviar_mensaje";
pub const FINALIZE_PATH: &str = "/sesion/finalizar";
pub const STATISTICS_PATH: &str = "/estadisticas";

#[derive(Clone)]
pub struct ApiGateway {
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialProvider>,
}

impl ApiGateway {
    pub fn new(transport: Arc<dyn Transport>, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            transport,
            credentials,
        }
    }

    /// Starts (or resumes) the operator's session with a new patient.
    ///
    /// Not safe to retry blindly: the backend may treat a repeat call as a
    /// new initialization.
    #[instrument(skip(self))]
    pub async fn initialize_session(&self) -> Result<InitializedSession, ApiError> {
        let body = self
            .call(
                Method::POST,
                INITIALIZE_PATH,
                Some(Value::Object(Default::default())),
                "Error al inicializar el paciente",
            )
            .await?;
        // The backend has returned the summary JSON-encoded inside a string.
        let body = match body {
            Value::String(inner) => serde_json::from_str(&inner)
                .map_err(|e| ApiError::Decode(format!("initialize: {}", e)))?,
            other => other,
        };
        let initialized: InitializedSession = decode("initialize", body)?;
        info!(
            session_id = ?initialized.snapshot.session_id,
            session_number = ?initialized.snapshot.session_number,
            "Session initialized"
        );
        Ok(initialized)
    }

    /// Reads the current session status. Read-only.
    #[instrument(skip(self))]
    pub async fn fetch_status(&self) -> Result<SessionSnapshot, ApiError> {
        let body = self
            .call(
                Method::GET,
                STATUS_PATH,
                None,
                "No se pudo obtener el estado de la sesión",
            )
            .await?;
        decode("status", body)
    }

    /// Sends one operator message and returns the counterpart's turn.
    ///
    /// Blank input fails with `ApiError::Validation` before any request.
    #[instrument(skip(self, text), fields(len = text.len()))]
    pub async fn send_message(&self, text: &str) -> Result<DialogueTurn, ApiError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ApiError::Validation(
                "El mensaje no puede estar vacío".to_string(),
            ));
        }
        let payload = serde_json::to_value(SendMessagePayload {
            text: text.to_string(),
        })
        .map_err(|e| ApiError::Decode(e.to_string()))?;

        let body = self
            .call(
                Method::POST,
                SEND_MESSAGE_PATH,
                Some(payload),
                "Error al enviar el mensaje",
            )
            .await?;
        let turn: DialogueTurn = decode("send_message", body)?;
        debug!(
            session_completed = turn.session_completed,
            has_checklist = turn.checklist.is_some(),
            "Counterpart replied"
        );
        Ok(turn)
    }

    /// Closes the session. Finalizing a session that is already closed is
    /// reported as success.
    #[instrument(skip(self))]
    pub async fn finalize_session(&self) -> Result<FinalizationResult, ApiError> {
        let result = self
            .call(
                Method::POST,
                FINALIZE_PATH,
                Some(Value::Object(Default::default())),
                "Error al finalizar la sesión",
            )
            .await;
        match result {
            Ok(Value::Null) => Ok(FinalizationResult {
                success: true,
                ..Default::default()
            }),
            Ok(body) => decode("finalize", body),
            Err(ApiError::Transport {
                status: Some(404 | 409),
                detail,
            }) => {
                info!(%detail, "Session was already finalized");
                Ok(FinalizationResult::already_finalized())
            }
            Err(e) => Err(e),
        }
    }

    /// Aggregate statistics; independent of any active session.
    #[instrument(skip(self))]
    pub async fn fetch_statistics(&self) -> Result<Statistics, ApiError> {
        let body = self
            .call(
                Method::GET,
                STATISTICS_PATH,
                None,
                "Error al cargar estadísticas",
            )
            .await?;
        decode("statistics", body)
    }

    #[instrument(skip(self))]
    pub async fn fetch_patient_summary(&self) -> Result<PatientSummary, ApiError> {
        let body = self
            .call(
                Method::GET,
                PATIENT_SUMMARY_PATH,
                None,
                "No se pudo obtener el resumen del paciente",
            )
            .await?;
        decode("patient_summary", body)
    }

    async fn headers(&self) -> Result<HeaderMap, ApiError> {
        let token = self.credentials.get_token().await.ok_or(ApiError::Auth)?;
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
            warn!("Credential provider returned a token that is not a valid header value");
            ApiError::Auth
        })?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        fallback: &str,
    ) -> Result<Value, ApiError> {
        let headers = self.headers().await?;
        self.transport
            .request(method, path, body, headers)
            .await
            .map_err(|TransportFailure { status, detail }| ApiError::Transport {
                status,
                detail: detail.unwrap_or_else(|| fallback.to_string()),
            })
    }
}

fn decode<T: DeserializeOwned>(operation: &str, body: Value) -> Result<T, ApiError> {
    serde_json::from_value(body).map_err(|e| ApiError::Decode(format!("{}: {}", operation, e)))
}
