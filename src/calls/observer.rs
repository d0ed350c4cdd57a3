use sfucore::types::{AvFlags, CallId, Cid, SpeakerState, TermCode, UserId};

use super::error::CallError;
use super::state::CallState;

/// Receives call notifications. Every method defaults to doing nothing.
///
/// Called from the call's task; implementations should return quickly.
pub trait CallObserver: Send + Sync {
    fn on_state_changed(&self, _call_id: &CallId, _state: CallState) {}
    fn on_participant_added(&self, _call_id: &CallId, _user: &UserId) {}
    fn on_participant_removed(&self, _call_id: &CallId, _user: &UserId) {}
    fn on_session_added(&self, _call_id: &CallId, _cid: Cid, _user: &UserId) {}
    fn on_session_removed(&self, _call_id: &CallId, _cid: Cid) {}
    fn on_av_flags_changed(&self, _call_id: &CallId, _cid: Cid, _av: AvFlags) {}
    fn on_speak_requests(&self, _call_id: &CallId, _cids: &[Cid]) {}
    fn on_speaker_state(&self, _call_id: &CallId, _state: SpeakerState) {}
    fn on_moderator_changed(&self, _call_id: &CallId, _user: &UserId, _is_moderator: bool) {}
    fn on_relay_error(&self, _call_id: &CallId, _code: i32, _msg: &str) {}
    /// Failures of work the call did on its own, such as key rotation.
    fn on_error(&self, _call_id: &CallId, _error: &CallError) {}
    fn on_terminated(&self, _call_id: &CallId, _code: TermCode) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl CallObserver for NoopObserver {}
