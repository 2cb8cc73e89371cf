//! The application callback contract.
//!
//! The agent notifies the embedding application at every state change and at
//! every step outcome. The application may simply observe, may rewrite the
//! outgoing request document or target filename, may take over a step
//! entirely ([`CallbackResult::AppSuccess`] / [`CallbackResult::AppFailed`]),
//! or may end the session ([`CallbackResult::Stop`]).
//!
//! Callbacks run on the agent's worker thread; return promptly.

use super::storage::ChunkInfo;
use super::{AgentState, ConnectionKind, MAX_FILE_LEN, MAX_JSON_DOC_LEN, ServerInfo};
use super::error::OtaError;
use heapless::String;

/// Why the callback is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackReason {
    /// The agent is about to run the named state's action.
    StateChange,
    /// The state's action succeeded.
    Success,
    /// The state's action failed.
    Failure,
}

/// The application's verdict, returned from every callback.
///
/// The agent only acts on the verdict when the reason was
/// [`CallbackReason::StateChange`]; for `Success`/`Failure` notifications a
/// [`CallbackResult::Stop`] still ends the session, other values are
/// informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackResult {
    /// Continue with the agent's own action for this state.
    Continue,
    /// End the current update session cleanly (the agent keeps running).
    Stop,
    /// The application performed the step itself; treat as success and skip
    /// the agent's action.
    AppSuccess,
    /// The application performed the step itself and it failed; skip the
    /// agent's action and treat as failure.
    AppFailed,
}

/// Everything the application gets to see (and partially modify) during a
/// callback.
pub struct CallbackEvent<'a> {
    /// Why the callback fired.
    pub reason: CallbackReason,
    /// The state the agent is in.
    pub state: AgentState,
    /// The session's last error, if any.
    pub error: Option<OtaError>,
    /// The transport in use.
    pub connection: ConnectionKind,
    /// The broker/server the agent is talking to, when connected or about
    /// to connect.
    pub server: Option<&'a ServerInfo>,
    /// Total bytes expected for the image; 0 until known.
    pub total_size: u32,
    /// Bytes written to storage so far.
    pub bytes_written: u32,
    /// Download progress in percent; 0 until the total size is known.
    pub percentage: u32,
    /// The per-session unique pub/sub topic, when one exists.
    pub unique_topic: Option<&'a str>,
    /// For download/result states: the file name about to be requested.
    /// The application may rewrite it.
    pub file: Option<&'a mut String<MAX_FILE_LEN>>,
    /// For request-sending states: the outgoing JSON document. The
    /// application may rewrite it.
    pub json_doc: Option<&'a mut String<MAX_JSON_DOC_LEN>>,
    /// For [`AgentState::StorageWrite`]: the chunk about to be written.
    pub chunk: Option<&'a ChunkInfo<'a>>,
}

impl core::fmt::Debug for CallbackEvent<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CallbackEvent")
            .field("reason", &self.reason)
            .field("state", &self.state)
            .field("error", &self.error)
            .field("bytes_written", &self.bytes_written)
            .finish()
    }
}

impl<'a> CallbackEvent<'a> {
    /// A bare event with no buffers attached; the session fills in the rest.
    pub(crate) fn new(
        reason: CallbackReason,
        state: AgentState,
        error: Option<OtaError>,
        connection: ConnectionKind,
    ) -> Self {
        Self {
            reason,
            state,
            error,
            connection,
            server: None,
            total_size: 0,
            bytes_written: 0,
            percentage: 0,
            unique_topic: None,
            file: None,
            json_doc: None,
            chunk: None,
        }
    }
}

/// The application-side observer an agent is started with.
///
/// Implement this on whatever owns your application's update policy. A
/// no-op implementation (always [`CallbackResult::Continue`]) gives the
/// agent's default behavior throughout.
pub trait AppCallback {
    /// Called at every state change and step outcome; see
    /// [`CallbackEvent`].
    fn on_event(&mut self, event: &mut CallbackEvent<'_>) -> CallbackResult;

    /// Called when a successful session wants to reboot into the new image
    /// (`reboot_upon_completion` set). The library cannot reset the host
    /// itself; platforms wire their reset here. The default does nothing,
    /// in which case the new image boots whenever the device next resets.
    fn reboot(&mut self) {}
}

impl<F> AppCallback for F
where
    F: FnMut(&mut CallbackEvent<'_>) -> CallbackResult,
{
    fn on_event(&mut self, event: &mut CallbackEvent<'_>) -> CallbackResult {
        self(event)
    }
}
