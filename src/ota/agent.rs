//! The agent orchestrator: state machine, worker thread, and public handle.
//!
//! [`OtaAgent::start`] spawns one worker thread that owns the whole update
//! session and walks a transition table. Each table entry names the action
//! to run for a state, the next state on success and on failure, the error
//! recorded on failure, and where a STOP verdict from the application lands.
//! Every step offers the application callback a chance to observe the
//! transition, take the step over, or stop the session; a STOP always wins
//! at the end of the step.
//!
//! Outside the worker, the returned [`AgentHandle`] is the only way in:
//! `stop` (also on drop), `get_update_now`, and the state / last-error
//! accessors. Only one agent may exist per process.

use super::callback::{AppCallback, CallbackEvent, CallbackReason, CallbackResult};
use super::chunk::PacketLog;
use super::config::{AgentConfig, DEFAULT_DATA_FILE, DEFAULT_JOB_FILE, UpdateFlow};
use super::error::{OtaError, OtaStatus};
use super::event::{Clock, EventWord, StdClock, Timers, bits};
use super::job::{JobDecision, JobDocument};
use super::storage::{ChunkInfo, OtaStorage, StorageContext};
use super::transport::{Credentials, Transport, TransportAdapter};
use super::{
    AgentState, ConnectionKind, MAX_FILE_LEN, MAX_JSON_DOC_LEN, MAX_TOPIC_LEN, ServerInfo,
};
use crate::network::Connect;
use core::fmt::Write as _;
use heapless::{String, Vec};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Process-wide singleton guard.
static AGENT_RUNNING: AtomicBool = AtomicBool::new(false);

/// State shared between the worker thread and the public handle.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) events: EventWord,
    state: Mutex<AgentState>,
    last_error: Mutex<Option<OtaError>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            events: EventWord::new(),
            state: Mutex::new(AgentState::Initializing),
            last_error: Mutex::new(None),
        }
    }
}

/// Network-side parameters for [`OtaAgent::start`].
pub struct NetworkParams<N> {
    /// The transport the agent starts every session on.
    pub connection: ConnectionKind,
    /// Broker or server to contact.
    pub server: ServerInfo,
    /// File to request over HTTP: the job document (job flow) or the image
    /// (direct flow). Empty selects the conventional default.
    pub file: &'static str,
    /// Optional broker/server credentials.
    pub credentials: Option<Credentials>,
    /// Request the whole image with one pub/sub request (default publisher
    /// behavior) instead of chunk by chunk.
    pub mqtt_one_call: bool,
    /// The connection factory the transports build on.
    pub connect: N,
}

impl<N> core::fmt::Debug for NetworkParams<N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NetworkParams")
            .field("connection", &self.connection)
            .field("server", &self.server)
            .field("file", &self.file)
            .finish()
    }
}

/// Agent-side parameters for [`OtaAgent::start`].
#[derive(Debug)]
pub struct AgentParams<CB> {
    /// Timing, retries, flow toggles and device identity.
    pub config: AgentConfig,
    /// The application's observer.
    pub callback: CB,
}

/// Buffers a caller may attach to a callback invocation.
#[derive(Default)]
pub struct CbBuffers<'a> {
    /// Editable target file name.
    pub file: Option<&'a mut String<MAX_FILE_LEN>>,
    /// Editable outgoing request document.
    pub json_doc: Option<&'a mut String<MAX_JSON_DOC_LEN>>,
    /// Chunk descriptor for storage-write notifications.
    pub chunk: Option<&'a ChunkInfo<'a>>,
}

impl core::fmt::Debug for CbBuffers<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CbBuffers").finish()
    }
}

/// Everything one session carries besides the transport and the storage
/// interface.
///
/// Transport adapters receive this to invoke the application callback,
/// account progress, and honor timers mid-phase.
pub struct SessionCore<CB> {
    pub(crate) config: AgentConfig,
    pub(crate) callback: CB,
    pub(crate) shared: Arc<Shared>,
    pub(crate) timers: Timers,
    pub(crate) clock: StdClock,

    pub(crate) storage_ctx: StorageContext,
    pub(crate) packet_log: PacketLog,

    pub(crate) stop_session: bool,
    pub(crate) storage_open: bool,
    pub(crate) reboot_after_result: bool,

    pub(crate) initial_kind: ConnectionKind,
    pub(crate) initial_server: ServerInfo,
    pub(crate) curr_kind: ConnectionKind,
    pub(crate) curr_server: ServerInfo,

    pub(crate) default_file: &'static str,
    pub(crate) http_file: String<MAX_FILE_LEN>,
    pub(crate) job_doc: Vec<u8, MAX_JSON_DOC_LEN>,
    pub(crate) parsed_job: Option<JobDocument>,
    pub(crate) job_decision: Option<JobDecision>,
    pub(crate) unique_topic: String<MAX_TOPIC_LEN>,
    pub(crate) session_nonce: u16,

    pub(crate) connect_retry_count: u8,
    pub(crate) download_retry_count: u8,
    pub(crate) retry_pending: bool,
}

impl<CB> core::fmt::Debug for SessionCore<CB> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SessionCore")
            .field("state", &*self.shared.state.lock().unwrap())
            .field("server", &self.curr_server)
            .field("bytes_written", &self.storage_ctx.total_bytes_written)
            .finish()
    }
}

impl<CB: AppCallback> SessionCore<CB> {
    /// The shared event word.
    pub(crate) fn events(&self) -> &EventWord {
        &self.shared.events
    }

    /// Fire any expired timers into the event word.
    pub(crate) fn fire_timers(&mut self) {
        let now = self.clock.now_ms();
        self.timers.fire_expired(now, &self.shared.events);
    }

    /// (Re-)arm the per-packet watchdog.
    pub(crate) fn arm_packet_timer(&mut self) {
        if self.config.packet_interval_secs > 0 {
            let now = self.clock.now_ms();
            self.timers
                .arm(now, self.config.packet_interval_secs, bits::PACKET_TIMEOUT);
        }
    }

    pub(crate) fn state(&self) -> AgentState {
        *self.shared.state.lock().unwrap()
    }

    pub(crate) fn set_state(&self, state: AgentState) {
        let mut current = self.shared.state.lock().unwrap();
        if *current != state {
            log::debug!("state {} -> {}", current.as_str(), state.as_str());
            *current = state;
        }
    }

    pub(crate) fn last_error(&self) -> Option<OtaError> {
        *self.shared.last_error.lock().unwrap()
    }

    pub(crate) fn set_last_error(&self, error: Option<OtaError>) {
        *self.shared.last_error.lock().unwrap() = error;
    }

    /// Invoke the application callback.
    ///
    /// Progress, server and topic context ride along; `buffers` attaches
    /// whatever the calling site lets the application edit.
    pub(crate) fn call_cb(
        &mut self,
        reason: CallbackReason,
        state: AgentState,
        buffers: CbBuffers<'_>,
    ) -> CallbackResult {
        let server = self.curr_server.clone();
        let topic = self.unique_topic.clone();

        let mut event = CallbackEvent::new(reason, state, self.last_error(), self.curr_kind);
        event.server = Some(&server);
        event.total_size = self.storage_ctx.total_image_size;
        event.bytes_written = self.storage_ctx.total_bytes_written;
        event.percentage = self.storage_ctx.percentage();
        if !topic.is_empty() {
            event.unique_topic = Some(topic.as_str());
        }
        event.file = buffers.file;
        event.json_doc = buffers.json_doc;
        event.chunk = buffers.chunk;

        self.callback.on_event(&mut event)
    }

    /// Run one data block through the storage-write step: callback,
    /// storage, accounting.
    pub(crate) fn write_chunk<S: OtaStorage>(
        &mut self,
        storage: &mut S,
        chunk: &ChunkInfo<'_>,
    ) -> OtaStatus {
        let verdict = self.call_cb(
            CallbackReason::StateChange,
            AgentState::StorageWrite,
            CbBuffers {
                chunk: Some(chunk),
                ..CbBuffers::default()
            },
        );
        match verdict {
            CallbackResult::Continue => {
                if let Err(err) = storage.write(&mut self.storage_ctx, chunk) {
                    log::error!("storage write at {} failed: {}", chunk.offset, err);
                    self.shared.events.set(bits::STORAGE_ERROR);
                    return err.into();
                }
            }
            CallbackResult::Stop => {
                self.stop_session = true;
                return OtaError::AppReturnedStop.into();
            }
            CallbackResult::AppSuccess => {}
            CallbackResult::AppFailed => return OtaError::WriteStorage.into(),
        }
        self.storage_ctx.apply_write(chunk);
        OtaStatus::Success
    }

    /// `<prepend>/<board>/publish_notify` - where the publisher listens for
    /// requests.
    pub(crate) fn publisher_listen_topic(&self) -> String<MAX_TOPIC_LEN> {
        let mut topic = String::new();
        let _ = write!(
            topic,
            "{}/{}/{}",
            self.config.company_prepend, self.config.board, self.config.publisher_listen_topic
        );
        topic
    }

    /// Mint this session's unique response topic.
    pub(crate) fn new_unique_topic(&mut self) {
        self.session_nonce = (self.clock.now_ms() & 0xFFFF) as u16;
        self.unique_topic.clear();
        let _ = write!(
            self.unique_topic,
            "{}/{}/OTAImage/{}",
            self.config.company_prepend, self.config.board, self.session_nonce
        );
    }

    /// The availability query sent to the publisher.
    pub(crate) fn availability_request(&self) -> Result<String<MAX_JSON_DOC_LEN>, OtaError> {
        self.request_doc("Update Availability", None)
    }

    /// The whole-image download request.
    pub(crate) fn download_request(&self) -> Result<String<MAX_JSON_DOC_LEN>, OtaError> {
        self.request_doc("Request Update", None)
    }

    /// A single-chunk download request.
    pub(crate) fn chunk_request(
        &self,
        offset: u32,
        size: u32,
    ) -> Result<String<MAX_JSON_DOC_LEN>, OtaError> {
        self.request_doc("Request Data Chunk", Some((offset, size)))
    }

    fn request_doc(
        &self,
        message: &str,
        chunk: Option<(u32, u32)>,
    ) -> Result<String<MAX_JSON_DOC_LEN>, OtaError> {
        let identity = &self.config.identity;
        let mut doc: String<MAX_JSON_DOC_LEN> = String::new();
        write!(
            doc,
            "{{\"Message\":\"{}\", \"Manufacturer\": \"{}\", \"ManufacturerID\": \"{}\", \
             \"ProductID\": \"{}\", \"SerialNumber\": \"{}\", \"BoardName\": \"{}\", \
             \"Version\": \"{}\", \"UniqueTopicName\": \"{}\"",
            message,
            identity.manufacturer,
            identity.manufacturer_id,
            identity.product,
            identity.serial_number,
            self.config.board,
            self.config.version,
            self.unique_topic,
        )
        .map_err(|_| OtaError::OutOfMemory)?;
        if let Some((offset, size)) = chunk {
            write!(
                doc,
                ", \"Filename\": \"{}\", \"Offset\": \"{}\", \"Size\": \"{}\"",
                self.http_file, offset, size
            )
            .map_err(|_| OtaError::OutOfMemory)?;
        }
        write!(doc, "}}").map_err(|_| OtaError::OutOfMemory)?;
        Ok(doc)
    }
}

/// What a state's entry in the transition table runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateAction {
    WaitForStart,
    DetermineFlow,
    Connect,
    JobDownload,
    Disconnect,
    JobParse,
    JobRedirect,
    StorageOpen,
    DataDownload,
    StorageClose,
    VerifyImage,
    ResultRedirect,
    ResultSend,
    Complete,
}

/// One row of the transition table.
struct StateEntry {
    state: AgentState,
    /// Whether the orchestrator delivers the STATE_CHANGE callback itself.
    /// Download/result-send states deliver it from inside the adapter with
    /// the request buffers attached.
    start_callback: bool,
    action: StateAction,
    success_next: AgentState,
    /// Recorded as the session error when the action fails without a more
    /// specific job error.
    failure_error: OtaError,
    failure_next: AgentState,
    /// Where a STOP verdict lands. STOP wins at the end of the step.
    app_stop_next: AgentState,
    /// Where a *successful* step routes while a session error is pending,
    /// so teardown states unwind toward result reporting instead of
    /// continuing the happy path.
    error_unwind_next: Option<AgentState>,
}

const STATE_TABLE: &[StateEntry] = &[
    StateEntry {
        state: AgentState::AgentWaiting,
        start_callback: true,
        action: StateAction::WaitForStart,
        success_next: AgentState::StartUpdate,
        failure_error: OtaError::General,
        failure_next: AgentState::Exiting,
        app_stop_next: AgentState::Exiting,
        error_unwind_next: None,
    },
    StateEntry {
        state: AgentState::StartUpdate,
        start_callback: true,
        action: StateAction::DetermineFlow,
        success_next: AgentState::JobConnect,
        failure_error: OtaError::General,
        // A "failure" here is normally the UseDirectFlow signal: skip the
        // job fetch and open storage.
        failure_next: AgentState::StorageOpen,
        app_stop_next: AgentState::OtaComplete,
        error_unwind_next: None,
    },
    StateEntry {
        state: AgentState::JobConnect,
        start_callback: true,
        action: StateAction::Connect,
        success_next: AgentState::JobDownload,
        failure_error: OtaError::Connect,
        failure_next: AgentState::AgentWaiting,
        app_stop_next: AgentState::OtaComplete,
        error_unwind_next: None,
    },
    StateEntry {
        state: AgentState::JobDownload,
        start_callback: false,
        action: StateAction::JobDownload,
        success_next: AgentState::JobDisconnect,
        failure_error: OtaError::GetJob,
        failure_next: AgentState::JobDisconnect,
        app_stop_next: AgentState::JobDisconnect,
        error_unwind_next: None,
    },
    StateEntry {
        state: AgentState::JobDisconnect,
        start_callback: true,
        action: StateAction::Disconnect,
        success_next: AgentState::JobParse,
        failure_error: OtaError::Disconnect,
        failure_next: AgentState::OtaComplete,
        app_stop_next: AgentState::OtaComplete,
        // A failed job fetch means no update; skip parsing and wrap up.
        error_unwind_next: Some(AgentState::OtaComplete),
    },
    StateEntry {
        state: AgentState::JobParse,
        start_callback: true,
        action: StateAction::JobParse,
        success_next: AgentState::JobRedirect,
        failure_error: OtaError::MalformedJobDoc,
        failure_next: AgentState::ResultRedirect,
        app_stop_next: AgentState::OtaComplete,
        error_unwind_next: None,
    },
    StateEntry {
        state: AgentState::JobRedirect,
        start_callback: true,
        action: StateAction::JobRedirect,
        success_next: AgentState::StorageOpen,
        failure_error: OtaError::Redirect,
        failure_next: AgentState::ResultRedirect,
        app_stop_next: AgentState::OtaComplete,
        error_unwind_next: None,
    },
    StateEntry {
        state: AgentState::StorageOpen,
        start_callback: true,
        action: StateAction::StorageOpen,
        success_next: AgentState::DataConnect,
        failure_error: OtaError::OpenStorage,
        failure_next: AgentState::ResultRedirect,
        app_stop_next: AgentState::OtaComplete,
        error_unwind_next: None,
    },
    StateEntry {
        state: AgentState::DataConnect,
        start_callback: true,
        action: StateAction::Connect,
        success_next: AgentState::DataDownload,
        failure_error: OtaError::Connect,
        failure_next: AgentState::ResultRedirect,
        app_stop_next: AgentState::OtaComplete,
        error_unwind_next: None,
    },
    StateEntry {
        state: AgentState::DataDownload,
        start_callback: false,
        action: StateAction::DataDownload,
        success_next: AgentState::DataDisconnect,
        failure_error: OtaError::GetData,
        failure_next: AgentState::DataDisconnect,
        app_stop_next: AgentState::DataDisconnect,
        error_unwind_next: None,
    },
    StateEntry {
        state: AgentState::DataDisconnect,
        start_callback: true,
        action: StateAction::Disconnect,
        success_next: AgentState::StorageClose,
        failure_error: OtaError::Disconnect,
        failure_next: AgentState::StorageClose,
        app_stop_next: AgentState::OtaComplete,
        error_unwind_next: Some(AgentState::StorageClose),
    },
    StateEntry {
        state: AgentState::StorageClose,
        start_callback: true,
        action: StateAction::StorageClose,
        success_next: AgentState::Verify,
        failure_error: OtaError::CloseStorage,
        failure_next: AgentState::ResultRedirect,
        app_stop_next: AgentState::OtaComplete,
        // Never verify (and never mark pending) a download that already
        // failed.
        error_unwind_next: Some(AgentState::ResultRedirect),
    },
    StateEntry {
        state: AgentState::Verify,
        start_callback: true,
        action: StateAction::VerifyImage,
        success_next: AgentState::ResultRedirect,
        failure_error: OtaError::Verify,
        failure_next: AgentState::ResultRedirect,
        app_stop_next: AgentState::ResultRedirect,
        error_unwind_next: None,
    },
    StateEntry {
        state: AgentState::ResultRedirect,
        start_callback: true,
        action: StateAction::ResultRedirect,
        success_next: AgentState::ResultConnect,
        failure_error: OtaError::Redirect,
        // A "failure" here is normally the UseDirectFlow signal: skip
        // result reporting.
        failure_next: AgentState::OtaComplete,
        app_stop_next: AgentState::OtaComplete,
        error_unwind_next: None,
    },
    StateEntry {
        state: AgentState::ResultConnect,
        start_callback: true,
        action: StateAction::Connect,
        success_next: AgentState::ResultSend,
        failure_error: OtaError::Connect,
        failure_next: AgentState::OtaComplete,
        app_stop_next: AgentState::OtaComplete,
        error_unwind_next: None,
    },
    StateEntry {
        state: AgentState::ResultSend,
        start_callback: false,
        action: StateAction::ResultSend,
        success_next: AgentState::ResultDisconnect,
        failure_error: OtaError::SendingResult,
        failure_next: AgentState::ResultDisconnect,
        app_stop_next: AgentState::ResultDisconnect,
        error_unwind_next: None,
    },
    StateEntry {
        state: AgentState::ResultDisconnect,
        start_callback: true,
        action: StateAction::Disconnect,
        success_next: AgentState::OtaComplete,
        failure_error: OtaError::Disconnect,
        failure_next: AgentState::OtaComplete,
        app_stop_next: AgentState::OtaComplete,
        error_unwind_next: None,
    },
    StateEntry {
        state: AgentState::OtaComplete,
        start_callback: true,
        action: StateAction::Complete,
        success_next: AgentState::AgentWaiting,
        failure_error: OtaError::General,
        failure_next: AgentState::AgentWaiting,
        app_stop_next: AgentState::AgentWaiting,
        error_unwind_next: None,
    },
];

fn entry_for(state: AgentState) -> Option<&'static StateEntry> {
    STATE_TABLE.iter().find(|entry| entry.state == state)
}

/// One update session's moving parts, owned by the worker thread.
pub(crate) struct Session<T, S, CB> {
    pub(crate) core: SessionCore<CB>,
    pub(crate) transport: T,
    pub(crate) storage: S,
}

impl<T, S, CB> Session<T, S, CB>
where
    T: TransportAdapter,
    S: OtaStorage,
    CB: AppCallback,
{
    /// The worker's main loop: walk the transition table until `Exiting`.
    pub(crate) fn run(&mut self) {
        self.core.set_state(AgentState::AgentWaiting);
        self.core.stop_session = false;
        self.core.set_last_error(None);

        {
            let now = self.core.clock.now_ms();
            self.core
                .timers
                .arm(now, self.core.config.initial_check_secs, bits::START_UPDATE);
        }

        while self.core.state() != AgentState::Exiting {
            let state = self.core.state();
            let Some(entry) = entry_for(state) else {
                log::error!("state {} not in the transition table", state.as_str());
                self.core.set_state(AgentState::Exiting);
                break;
            };

            let mut result = OtaStatus::Success;
            let mut verdict = CallbackResult::Continue;
            if entry.start_callback {
                verdict =
                    self.core
                        .call_cb(CallbackReason::StateChange, state, CbBuffers::default());
            }
            match verdict {
                CallbackResult::Continue => {
                    result = self.action(entry.action);
                    if state == AgentState::AgentWaiting && result == OtaStatus::Exiting {
                        break;
                    }
                }
                CallbackResult::Stop => {
                    log::info!("application stopped the session at {}", state.as_str());
                    self.core.stop_session = true;
                    result = OtaError::AppReturnedStop.into();
                }
                CallbackResult::AppSuccess => result = OtaStatus::Success,
                CallbackResult::AppFailed => result = OtaError::AppReturnedStop.into(),
            }

            let mut new_state = entry.success_next;

            if result.is_success() {
                match self
                    .core
                    .call_cb(CallbackReason::Success, state, CbBuffers::default())
                {
                    CallbackResult::Stop => {
                        self.core.stop_session = true;
                        result = OtaError::AppReturnedStop.into();
                    }
                    CallbackResult::AppFailed => {
                        result = OtaStatus::Error(entry.failure_error);
                    }
                    CallbackResult::Continue | CallbackResult::AppSuccess => {}
                }
            }

            if !result.is_success() {
                new_state = entry.failure_next;

                let skip_signal = matches!(
                    result,
                    OtaStatus::UseDirectFlow | OtaStatus::ChangingServer
                ) && matches!(
                    state,
                    AgentState::StartUpdate | AgentState::ResultRedirect
                );
                if skip_signal {
                    // Not an error: skip the job fetch / result report. Any
                    // session error already recorded stays recorded.
                    result = OtaStatus::Success;
                } else {
                    let error = match result.error() {
                        Some(
                            specific @ (OtaError::NotAJobDoc
                            | OtaError::MalformedJobDoc
                            | OtaError::WrongBoard
                            | OtaError::InvalidVersion
                            | OtaError::AppReturnedStop),
                        ) => specific,
                        _ => entry.failure_error,
                    };
                    self.core.set_last_error(Some(error));

                    if self
                        .core
                        .call_cb(CallbackReason::Failure, state, CbBuffers::default())
                        == CallbackResult::Stop
                    {
                        self.core.stop_session = true;
                    }
                }
            } else if self.core.last_error().is_some() {
                // Unwinding after an earlier failure: teardown states route
                // toward result reporting instead of the happy path.
                if let Some(unwind) = entry.error_unwind_next {
                    new_state = unwind;
                }
            }

            // Retry policy.
            if state == AgentState::DataDownload
                && self.core.last_error() == Some(OtaError::GetData)
            {
                self.core.download_retry_count += 1;
                if self.core.download_retry_count < self.core.config.max_download_tries {
                    log::info!(
                        "download retry {} of {}",
                        self.core.download_retry_count,
                        self.core.config.max_download_tries
                    );
                    // Still connected: reopen storage (erasing only if
                    // bytes were written) and try again.
                    new_state = AgentState::StorageOpen;
                    self.core.set_last_error(None);
                }
            } else if matches!(
                state,
                AgentState::JobConnect | AgentState::DataConnect | AgentState::ResultConnect
            ) && self.core.last_error() == Some(OtaError::Connect)
            {
                self.core.connect_retry_count += 1;
                let now = self.core.clock.now_ms();
                if self.core.connect_retry_count < self.core.config.connect_retries {
                    log::info!(
                        "connect retry {} of {}",
                        self.core.connect_retry_count,
                        self.core.config.connect_retries
                    );
                    new_state = AgentState::AgentWaiting;
                    self.core.set_last_error(None);
                    self.core.retry_pending = true;
                    self.core.timers.arm(
                        now,
                        self.core.config.retry_interval_secs,
                        bits::START_UPDATE,
                    );
                } else {
                    log::error!(
                        "connect retries exhausted after {} attempts",
                        self.core.connect_retry_count
                    );
                    new_state = AgentState::AgentWaiting;
                    self.core.set_last_error(Some(OtaError::AppExceededRetries));
                    self.core
                        .timers
                        .arm(now, self.core.config.next_check_secs, bits::START_UPDATE);
                }
            }

            // STOP always wins at the end of the step.
            if self.core.stop_session {
                new_state = entry.app_stop_next;
            }

            self.core.set_state(new_state);
        }

        self.core.timers.cancel_all();
        self.core.set_state(AgentState::Exiting);
        log::info!("agent worker exiting");
    }

    fn action(&mut self, action: StateAction) -> OtaStatus {
        let Self {
            core,
            transport,
            storage,
        } = self;
        match action {
            StateAction::WaitForStart => Self::wait_for_start(core),
            StateAction::DetermineFlow => Self::determine_flow(core, transport),
            StateAction::Connect => Self::connect(core, transport),
            StateAction::JobDownload => Self::job_download(core, transport),
            StateAction::Disconnect => transport.disconnect(core),
            StateAction::JobParse => Self::job_parse(core),
            StateAction::JobRedirect => Self::job_redirect(core, transport),
            StateAction::StorageOpen => Self::storage_open(core, storage),
            StateAction::DataDownload => Self::data_download(core, transport, storage),
            StateAction::StorageClose => Self::storage_close(core, storage),
            StateAction::VerifyImage => Self::verify(core, storage),
            StateAction::ResultRedirect => Self::result_redirect(core, transport),
            StateAction::ResultSend => {
                let success = core.last_error().is_none();
                transport.report_result(core, success)
            }
            StateAction::Complete => Self::complete(core, transport, storage),
        }
    }

    /// Block in `AgentWaiting` until a start or shutdown event.
    ///
    /// The previous session's error stays queryable for the whole wait (and
    /// after a stop); it is only cleared once a new session actually
    /// begins.
    fn wait_for_start(core: &mut SessionCore<CB>) -> OtaStatus {
        loop {
            core.fire_timers();
            let timeout = core
                .timers
                .until_next(core.clock.now_ms())
                // Wake at least occasionally so re-armed timers are seen.
                .or(Some(Duration::from_secs(3600)));
            let hits = core
                .events()
                .wait_any(bits::SHUTDOWN_NOW | bits::START_UPDATE, timeout);
            if hits & bits::SHUTDOWN_NOW != 0 {
                log::info!("shutdown requested");
                core.timers.cancel_all();
                return OtaStatus::Exiting;
            }
            if hits & bits::START_UPDATE != 0 {
                // A retry wake continues the same logical session; anything
                // else starts fresh.
                if !core.retry_pending {
                    core.connect_retry_count = 0;
                    core.download_retry_count = 0;
                }
                core.retry_pending = false;
                core.stop_session = false;
                core.set_last_error(None);
                core.job_doc.clear();
                core.parsed_job = None;
                core.job_decision = None;
                core.reboot_after_result = false;
                core.new_unique_topic();
                return OtaStatus::Success;
            }
        }
    }

    /// Restore the initial connection and pick the session flow.
    fn determine_flow(core: &mut SessionCore<CB>, transport: &mut T) -> OtaStatus {
        core.curr_kind = core.initial_kind;
        core.curr_server = core.initial_server.clone();
        if transport.set_kind(core.curr_kind).is_err() {
            return OtaError::Redirect.into();
        }

        core.http_file.clear();
        let file = if core.default_file.is_empty() {
            match core.config.use_flow {
                UpdateFlow::Job => DEFAULT_JOB_FILE,
                UpdateFlow::Direct => DEFAULT_DATA_FILE,
            }
        } else {
            core.default_file
        };
        let _ = core.http_file.push_str(file);

        match core.config.use_flow {
            UpdateFlow::Job => {
                log::info!("OTA begin, job flow [{}]", core.http_file);
                OtaStatus::Success
            }
            UpdateFlow::Direct => {
                log::info!("OTA begin, direct flow [{}]", core.http_file);
                OtaStatus::UseDirectFlow
            }
        }
    }

    fn connect(core: &mut SessionCore<CB>, transport: &mut T) -> OtaStatus {
        if transport.is_connected() {
            log::info!("already connected");
            return OtaStatus::AlreadyConnected;
        }

        let status = transport.connect(core);
        if !status.is_success() {
            // Let the adapter clean up any half-open connection.
            let _ = transport.disconnect(core);
        }
        log::info!(
            "{} connection to {}:{} {}",
            core.curr_kind.as_str(),
            core.curr_server.host,
            core.curr_server.port,
            if status.is_success() { "succeeded" } else { "failed" }
        );
        status
    }

    fn job_download(core: &mut SessionCore<CB>, transport: &mut T) -> OtaStatus {
        if core.config.job_check_timeout_secs > 0 {
            let now = core.clock.now_ms();
            core.timers
                .arm(now, core.config.job_check_timeout_secs, bits::DOWNLOAD_TIMEOUT);
        }
        let status = transport.download_job(core);
        core.timers.cancel(bits::DOWNLOAD_TIMEOUT);
        status
    }

    fn job_parse(core: &mut SessionCore<CB>) -> OtaStatus {
        let raw = core.job_doc.clone();
        match JobDocument::parse(
            &raw,
            core.config.version,
            core.config.board,
            core.curr_kind,
            &core.curr_server,
        ) {
            Ok((job, decision)) => {
                core.parsed_job = Some(job);
                core.job_decision = Some(decision);
                log::info!(
                    "job parse succeeded ({})",
                    match decision {
                        JobDecision::SameServer => "same server",
                        JobDecision::ChangingServer => "changing server",
                    }
                );
                OtaStatus::Success
            }
            Err(err) => {
                log::error!("job parse failed: {}", err);
                err.into()
            }
        }
    }

    /// Point the data phase wherever the job document says.
    fn job_redirect(core: &mut SessionCore<CB>, transport: &mut T) -> OtaStatus {
        let Some(job) = core.parsed_job.as_ref() else {
            return OtaError::Redirect.into();
        };

        if !job.file.is_empty() {
            core.http_file = job.file.clone();
        }

        if core.job_decision == Some(JobDecision::ChangingServer) {
            core.curr_kind = job.connection;
            core.curr_server = job.server.clone();
            if transport.set_kind(core.curr_kind).is_err() {
                return OtaError::Redirect.into();
            }
            log::info!(
                "job redirect to data server {}:{}",
                core.curr_server.host,
                core.curr_server.port
            );
        }
        OtaStatus::Success
    }

    fn storage_open(core: &mut SessionCore<CB>, storage: &mut S) -> OtaStatus {
        core.storage_ctx.reboot_upon_completion = core.config.reboot_upon_completion;
        core.storage_ctx.validate_after_reboot = core.config.validate_after_reboot;

        // On a download retry that never wrote anything the slot is still
        // erased; skip the expensive erase.
        if core.download_retry_count == 0 || core.storage_ctx.total_bytes_written > 0 {
            if let Err(err) = storage.open(&mut core.storage_ctx) {
                log::error!("storage open failed: {}", err);
                return OtaError::OpenStorage.into();
            }
        }
        core.storage_open = true;
        log::info!("storage open");
        OtaStatus::Success
    }

    fn data_download(core: &mut SessionCore<CB>, transport: &mut T, storage: &mut S) -> OtaStatus {
        if core.config.data_check_timeout_secs > 0 {
            let now = core.clock.now_ms();
            core.timers.arm(
                now,
                core.config.data_check_timeout_secs,
                bits::DOWNLOAD_TIMEOUT,
            );
        }

        core.storage_ctx.reset_progress();
        core.packet_log.reset();

        let status = transport.download_data(core, storage);

        core.timers.cancel(bits::DOWNLOAD_TIMEOUT);
        core.timers.cancel(bits::PACKET_TIMEOUT);
        log::info!(
            "data download {}",
            if status.is_success() { "succeeded" } else { "failed" }
        );
        status
    }

    fn storage_close(core: &mut SessionCore<CB>, storage: &mut S) -> OtaStatus {
        if core.storage_open {
            if let Err(err) = storage.close(&mut core.storage_ctx) {
                log::error!("storage close failed: {}", err);
                core.storage_open = false;
                return OtaError::CloseStorage.into();
            }
            log::info!("storage closed");
        }
        core.storage_open = false;
        OtaStatus::Success
    }

    fn verify(core: &mut SessionCore<CB>, storage: &mut S) -> OtaStatus {
        match storage.verify(&mut core.storage_ctx) {
            Ok(()) => {
                core.reboot_after_result = core.config.reboot_upon_completion;
                log::info!("image verified and marked pending");
                OtaStatus::Success
            }
            Err(err) => {
                log::error!("image verify failed: {}", err);
                OtaError::Verify.into()
            }
        }
    }

    /// Route result reporting back to the initial connection, or skip it.
    fn result_redirect(core: &mut SessionCore<CB>, transport: &mut T) -> OtaStatus {
        if core.config.use_flow == UpdateFlow::Direct || core.config.do_not_send_result {
            return OtaStatus::UseDirectFlow;
        }
        if !core.stop_session {
            core.curr_kind = core.initial_kind;
            core.curr_server = core.initial_server.clone();
            if transport.set_kind(core.curr_kind).is_err() {
                return OtaError::Redirect.into();
            }
            log::info!(
                "redirect to result server {}:{}",
                core.curr_server.host,
                core.curr_server.port
            );
        }
        OtaStatus::Success
    }

    fn complete(core: &mut SessionCore<CB>, transport: &mut T, storage: &mut S) -> OtaStatus {
        let _ = transport.disconnect(core);
        if core.storage_open {
            let _ = storage.close(&mut core.storage_ctx);
            core.storage_open = false;
        }

        let last_error = core.last_error();
        if last_error.is_none() && !core.stop_session && core.reboot_after_result {
            log::warn!("update staged, rebooting now");
            core.callback.reboot();
        }
        core.reboot_after_result = false;

        let now = core.clock.now_ms();
        core.timers
            .arm(now, core.config.next_check_secs, bits::START_UPDATE);

        match last_error {
            None => log::info!("OTA session done: success"),
            Some(err) => log::info!("OTA session done: {}", err),
        }
        OtaStatus::Success
    }
}

/// The OTA agent entry point.
///
/// See [`OtaAgent::start`].
#[derive(Debug)]
pub struct OtaAgent;

impl OtaAgent {
    /// Start the background agent.
    ///
    /// Spawns the worker thread and returns the owning handle. Only one
    /// agent may run per process; a second start fails with
    /// [`OtaError::AlreadyStarted`].
    ///
    /// # Errors
    ///
    /// * [`OtaError::BadArg`] - configuration outside the documented ranges
    /// * [`OtaError::AlreadyStarted`] - an agent already exists
    pub fn start<N, CB, S>(
        network: NetworkParams<N>,
        agent: AgentParams<CB>,
        storage: S,
    ) -> Result<AgentHandle, OtaError>
    where
        N: Connect + Send + 'static,
        CB: AppCallback + Send + 'static,
        S: OtaStorage + Send + 'static,
    {
        agent.config.validate()?;

        if AGENT_RUNNING
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(OtaError::AlreadyStarted);
        }

        let shared = Arc::new(Shared::new());
        let worker_shared = shared.clone();

        let join = std::thread::Builder::new()
            .name("ota-agent".into())
            .spawn(move || {
                let transport = Transport::new(
                    network.connect,
                    network.connection,
                    network.credentials,
                    network.mqtt_one_call,
                );
                let core = SessionCore {
                    config: agent.config,
                    callback: agent.callback,
                    shared: worker_shared,
                    timers: Timers::new(),
                    clock: StdClock::new(),
                    storage_ctx: StorageContext::default(),
                    packet_log: PacketLog::new(),
                    stop_session: false,
                    storage_open: false,
                    reboot_after_result: false,
                    initial_kind: network.connection,
                    initial_server: network.server.clone(),
                    curr_kind: network.connection,
                    curr_server: network.server,
                    default_file: network.file,
                    http_file: String::new(),
                    job_doc: Vec::new(),
                    parsed_job: None,
                    job_decision: None,
                    unique_topic: String::new(),
                    session_nonce: 0,
                    connect_retry_count: 0,
                    download_retry_count: 0,
                    retry_pending: false,
                };
                let mut session = Session {
                    core,
                    transport,
                    storage,
                };
                session.core.set_state(AgentState::AgentStarted);
                session.run();
            })
            .map_err(|_| OtaError::General)?;

        Ok(AgentHandle {
            shared,
            join: Some(join),
        })
    }
}

/// Owning handle to a running agent.
///
/// Dropping the handle stops the agent ([`AgentHandle::stop`] semantics).
#[derive(Debug)]
pub struct AgentHandle {
    shared: Arc<Shared>,
    join: Option<JoinHandle<()>>,
}

impl AgentHandle {
    /// The agent's current state.
    pub fn state(&self) -> AgentState {
        *self.shared.state.lock().unwrap()
    }

    /// The last session error; `None` means success. Persists across
    /// sessions until the next one starts, and remains queryable after
    /// [`stop`](AgentHandle::stop).
    pub fn last_error(&self) -> Option<OtaError> {
        *self.shared.last_error.lock().unwrap()
    }

    /// Check for an update now, ahead of the timers.
    ///
    /// Timer values are unaffected; the next-check timer is re-armed after
    /// the session as usual.
    ///
    /// # Errors
    ///
    /// * [`OtaError::AlreadyStarted`] - a session is already in progress
    pub fn get_update_now(&self) -> Result<(), OtaError> {
        if self.state() != AgentState::AgentWaiting {
            return Err(OtaError::AlreadyStarted);
        }
        self.shared.events.set(bits::START_UPDATE);
        Ok(())
    }

    /// Stop the agent and join its worker.
    pub fn stop(mut self) -> Option<OtaError> {
        self.shutdown();
        self.last_error()
    }

    fn shutdown(&mut self) {
        if let Some(join) = self.join.take() {
            self.shared.events.set(bits::SHUTDOWN_NOW);
            let _ = join.join();
            AGENT_RUNNING.store(false, Ordering::SeqCst);
        }
    }
}

impl Drop for AgentHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
