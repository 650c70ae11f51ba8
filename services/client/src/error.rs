//! Errors surfaced by the session client.

/// Errors returned by `ApiGateway` operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// No credential could be obtained. Callers should redirect to login.
    #[error("Not authenticated")]
    Auth,
    /// The input was rejected before any request was made.
    #[error("Invalid input: {0}")]
    Validation(String),
    /// The request failed in transit or the server answered with an error.
    #[error("Request failed{}: {detail}", .status.map(|s| format!(" with status {s}")).unwrap_or_default())]
    Transport { status: Option<u16>, detail: String },
    /// The server answered successfully but the body had an unexpected shape.
    #[error("Unexpected response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn transport(status: Option<u16>, detail: impl Into<String>) -> Self {
        ApiError::Transport {
            status,
            detail: detail.into(),
        }
    }

    /// The HTTP status, when the server answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Transport { status, .. } => *status,
            _ => None,
        }
    }

    /// Text suitable for showing to the operator.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Auth => "Tu sesión ha expirado. Inicia sesión de nuevo.".to_string(),
            ApiError::Validation(reason) => reason.clone(),
            ApiError::Transport { detail, .. } => detail.clone(),
            ApiError::Decode(_) => "Respuesta inesperada del servidor".to_string(),
        }
    }
}

/// Errors returned by `OrchestratorHandle` commands.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("The session orchestrator has shut down")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_display() {
        assert_eq!(ApiError::Auth.to_string(), "Not authenticated");
        assert_eq!(
            ApiError::Validation("El mensaje no puede estar vacío".into()).to_string(),
            "Invalid input: El mensaje no puede estar vacío"
        );
        assert_eq!(
            ApiError::transport(Some(503), "Servicio no disponible").to_string(),
            "Request failed with status 503: Servicio no disponible"
        );
        assert_eq!(
            ApiError::transport(None, "connection refused").to_string(),
            "Request failed: connection refused"
        );
    }

    #[test]
    fn test_user_message_uses_server_detail() {
        let err = ApiError::transport(Some(400), "Sesión no encontrada");
        assert_eq!(err.user_message(), "Sesión no encontrada");
        assert_eq!(err.status(), Some(400));
        assert_eq!(ApiError::Auth.status(), None);
    }

    #[test]
    fn test_orchestrator_error_wraps_api_error() {
        let err: OrchestratorError = ApiError::Auth.into();
        assert_eq!(err.to_string(), "Not authenticated");
        assert_eq!(
            OrchestratorError::Closed.to_string(),
            "The session orchestrator has shut down"
        );
    }
}
