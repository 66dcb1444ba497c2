//! Interview call sessions: the state machine, the controller that runs it
//! against the adapters, the view projection and journal recovery.

mod clock;
mod controller;
mod error;
mod recovery;
mod state;
mod view;

pub use clock::{Clock, SystemClock};
pub use controller::{open_meeting, CallController, CallOptions};
pub use error::{CallError, ErrorCause};
pub use recovery::{RecoveryOptions, RecoveryReport, SubmissionRecovery};
pub use state::{
    CallEvent, CallSession, CallSnapshot, CallStatus, ChatMessage, Effect, JoinCredentials,
    ParticipantRole,
};
pub use view::{format_elapsed, CallView, ChatLine};
