pub mod checklist;
pub mod patient;
pub mod protocol;
pub mod snapshot;
pub mod store;
pub mod timer;
pub mod transcript;

use transcript::Message;

/// Notifications the session core forwards to its collaborators.
///
/// This enum decouples session logic from presentation: a UI turns these
/// into toasts, sidebar updates or a logout, the core never does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Remaining time crossed a warning mark.
    ThresholdReached { minutes_remaining: u32 },
    /// The session ran out of time. The collaborator should log out.
    SessionExpired,
    /// A checklist item became completed.
    ChecklistItemCompleted { id: String },
    /// The backend reported the whole checklist as done.
    SessionCompleted,
    /// A message was appended to the transcript.
    MessageAppended(Message),
    /// A message could not be delivered; carries a user-facing reason.
    SendFailed { message: String },
    /// No credential was available; the collaborator should redirect to login.
    AuthenticationRequired,
}
