//! Session Snapshots
//!
//! The authoritative, server-owned session state as last confirmed by the
//! backend. Field names on the wire follow the backend's JSON.

use crate::checklist::ChecklistSnapshot;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    #[serde(rename = "tiene_sesion_activa", default)]
    pub active: bool,
    #[serde(rename = "sesion_id", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(
        rename = "numero_sesion",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub session_number: Option<u32>,
    #[serde(rename = "tiempo_transcurrido_minutos", default)]
    pub elapsed_minutes: u32,
    #[serde(rename = "tiempo_restante_minutos", default)]
    pub remaining_minutes: u32,
    #[serde(rename = "checklist_actual", default)]
    pub checklist: ChecklistSnapshot,
    #[serde(rename = "checklist_completado", default)]
    pub completed: bool,
    #[serde(rename = "mensaje", default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SessionSnapshot {
    /// The sentinel stored when there is no active session.
    pub fn inactive() -> Self {
        Self::default()
    }

    /// Returns a copy of this snapshot carrying a newer checklist, as
    /// reported by a dialogue turn.
    pub fn with_checklist(&self, checklist: ChecklistSnapshot, completed: bool) -> Self {
        Self {
            checklist,
            completed: self.completed || completed,
            ..self.clone()
        }
    }

    /// Whether `other` belongs to the same session lifetime as `self`.
    ///
    /// Snapshots without a session id are assumed to continue the current
    /// session; only two different ids mark a new one.
    pub fn same_session(&self, other: &SessionSnapshot) -> bool {
        match (&self.session_id, &other.session_id) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}
