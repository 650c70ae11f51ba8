//! Request and Response Models
//!
//! Payloads exchanged with the dialogue backend. Field names on the wire
//! follow the backend's JSON; the Rust names describe what they hold.

use serde::{Deserialize, Serialize};
use therapy_sim_core::{
    checklist::ChecklistSnapshot, patient::PatientSummary, snapshot::SessionSnapshot,
};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SendMessagePayload {
    #[serde(rename = "user_input")]
    pub text: String,
}

/// The counterpart's answer to one operator message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DialogueTurn {
    #[serde(rename = "mensaje_paciente")]
    pub counterpart_text: String,
    #[serde(
        rename = "checklist_terapeutico",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub checklist: Option<ChecklistSnapshot>,
    #[serde(rename = "sesionCompletada", alias = "sesion_completada", default)]
    pub session_completed: bool,
}

/// What the backend returns when a session is initialized: the session state
/// and, when available, the patient assigned to it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(from = "InitializedSessionWire")]
pub struct InitializedSession {
    #[serde(flatten)]
    pub snapshot: SessionSnapshot,
    #[serde(flatten)]
    pub patient: PatientSummary,
}

/// Both halves read from one flat object, so a key claimed by one is not
/// seen by the other.
#[derive(Deserialize)]
struct InitializedSessionWire {
    #[serde(flatten)]
    snapshot: SessionSnapshot,
    #[serde(flatten)]
    patient: PatientSummary,
}

impl From<InitializedSessionWire> for InitializedSession {
    fn from(wire: InitializedSessionWire) -> Self {
        let InitializedSessionWire {
            mut snapshot,
            mut patient,
        } = wire;
        patient.session_number = patient.session_number.or(snapshot.session_number);
        snapshot.session_number = snapshot.session_number.or(patient.session_number);
        Self { snapshot, patient }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct FinalizationResult {
    #[serde(alias = "exito", default = "default_true")]
    pub success: bool,
    #[serde(rename = "mensaje", default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Set locally when the backend reports the session was already closed.
    #[serde(skip)]
    pub already_finalized: bool,
}

fn default_true() -> bool {
    true
}

impl FinalizationResult {
    pub fn already_finalized() -> Self {
        Self {
            success: true,
            message: None,
            already_finalized: true,
        }
    }
}

/// Aggregate practice statistics for the signed-in operator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Statistics {
    #[serde(rename = "total_sesiones", default)]
    pub total_sessions: u32,
    #[serde(rename = "sesion_checklist_completados", default)]
    pub sessions_with_checklist_completed: u32,
    #[serde(rename = "tiempo_total_minutos", default)]
    pub total_minutes: f64,
    #[serde(rename = "tiempo_promedio_minutos", default)]
    pub average_minutes: f64,
}

impl Statistics {
    /// Share of sessions whose checklist was completed, rounded to a whole
    /// percentage. Zero when there are no sessions.
    pub fn checklist_completion_percentage(&self) -> u32 {
        if self.total_sessions == 0 {
            return 0;
        }
        let ratio = self.sessions_with_checklist_completed as f64 / self.total_sessions as f64;
        (ratio * 100.0).round() as u32
    }
}

/// Renders a duration in minutes as `"1h 5m"`, or `"45m"` under an hour.
pub fn format_minutes(minutes: f64) -> String {
    let total = minutes.max(0.0).round() as u64;
    let (hours, mins) = (total / 60, total % 60);
    if hours > 0 {
        format!("{}h {}m", hours, mins)
    } else {
        format!("{}m", mins)
    }
}
