//! Mail-filter session engine.
//!
//! Receives the ordered event stream of one SMTP transaction from a transfer
//! agent, drives a user-supplied handler through the per-event callbacks,
//! accumulates the handler's mutation requests, and replays a verdict plus
//! the mutations back to the agent at end-of-message.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

pub mod dispatcher;
pub mod envelope;
pub mod event;
pub mod harness;
pub mod session;
pub mod verdict;

pub use dispatcher::{Dispatch, Dispatcher};
pub use envelope::Envelope;
pub use event::{AuthInfo, Event, Stage};
pub use session::Session;
pub use verdict::{replay, Mutation, Verdict, WireReply};

#[derive(Debug, Error, Diagnostic)]
pub enum MilterError {
    /// An event (or late mutation) arrived outside the allowed protocol
    /// order. Protocol/programming error; the session aborts but other
    /// sessions are unaffected.
    #[error("{event} not allowed in stage {stage}")]
    #[diagnostic(code(milter::stage_violation))]
    StageViolation { event: String, stage: String },

    /// A mutation referenced a recipient or header that does not exist.
    /// Recoverable: the session logs it and continues.
    #[error("{what} not found")]
    #[diagnostic(code(milter::not_found))]
    NotFound { what: String },

    /// Unhandled failure inside a handler callback. The session aborts with
    /// a temporary-failure verdict; retrying is the transfer agent's call.
    #[error("handler failed during {stage}: {message}")]
    #[diagnostic(code(milter::handler_error))]
    Handler { stage: String, message: String },

    /// A handler callback exceeded the configured per-callback timeout.
    #[error("handler callback timed out during {stage}")]
    #[diagnostic(code(milter::timeout))]
    Timeout { stage: String },
}

impl MilterError {
    pub fn handler(stage: Stage, message: impl Into<String>) -> Self {
        MilterError::Handler {
            stage: stage.as_str().to_string(),
            message: message.into(),
        }
    }
}

/// Per-stage status a callback hands back to the engine.
///
/// Anything other than `Continue` at an early stage short-circuits the
/// remaining stages and becomes the final verdict; at `end_of_message` it is
/// the final verdict directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Continue,
    /// Accept and stop further checks for this transaction.
    Accept,
    Reject,
    Discard,
    TempFail,
}

/// The capability set of per-event callbacks a filter implements.
///
/// Every method defaults to a no-op `Continue`, so a handler implements only
/// the events it cares about. Callbacks take `&mut self`: one handler
/// instance serves exactly one session at a time, and per-transaction private
/// state (flags set during `on_header`, say) lives in the handler itself.
/// `on_reset` must clear that state; the session-owned [`Envelope`] is always
/// created fresh per transaction.
#[async_trait]
pub trait MilterCallbacks: Send + Sync {
    async fn on_connect(
        &mut self,
        _hostname: &str,
        _addr: Option<IpAddr>,
        _envelope: &Envelope,
    ) -> Result<Status, MilterError> {
        Ok(Status::Continue)
    }

    async fn on_helo(&mut self, _name: &str, _envelope: &Envelope) -> Result<Status, MilterError> {
        Ok(Status::Continue)
    }

    async fn on_envelope_from(
        &mut self,
        _envelope: &mut Envelope,
    ) -> Result<Status, MilterError> {
        Ok(Status::Continue)
    }

    /// Invoked once per recipient. A `Reject` here drops only this recipient
    /// when the engine runs with per-recipient granularity.
    async fn on_envelope_to(
        &mut self,
        _recipient: &str,
        _envelope: &mut Envelope,
    ) -> Result<Status, MilterError> {
        Ok(Status::Continue)
    }

    /// Invoked once per header, in original message order.
    async fn on_header(
        &mut self,
        _name: &str,
        _value: &str,
        _envelope: &mut Envelope,
    ) -> Result<Status, MilterError> {
        Ok(Status::Continue)
    }

    async fn on_end_of_headers(
        &mut self,
        _envelope: &mut Envelope,
    ) -> Result<Status, MilterError> {
        Ok(Status::Continue)
    }

    async fn on_body(
        &mut self,
        _chunk: &[u8],
        _envelope: &mut Envelope,
    ) -> Result<Status, MilterError> {
        Ok(Status::Continue)
    }

    /// Final chance to queue mutations; the returned status is the terminal
    /// verdict. After this returns the envelope is frozen.
    async fn on_end_of_message(
        &mut self,
        _envelope: &mut Envelope,
    ) -> Result<Status, MilterError> {
        Ok(Status::Continue)
    }

    /// Cleanup hook: runs on abort, and before the instance is reused for a
    /// new transaction on the same connection. Clear per-transaction state
    /// here.
    async fn on_reset(&mut self) {}

    /// Opt-in to instance reuse across transactions on a reused connection.
    /// When `false` (the default) the dispatcher builds a fresh instance per
    /// transaction.
    fn reusable(&self) -> bool {
        false
    }
}

/// Builds one handler instance per session.
pub trait MilterFactory: Send + Sync {
    fn create(&self) -> Box<dyn MilterCallbacks>;
}

impl<F> MilterFactory for F
where
    F: Fn() -> Box<dyn MilterCallbacks> + Send + Sync,
{
    fn create(&self) -> Box<dyn MilterCallbacks> {
        self()
    }
}

/// When the dispatcher releases queued mutations to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyMode {
    /// Header-level mutations are released as dispatch deltas as soon as
    /// they are queued; envelope mutations still wait for end-of-message.
    Immediate,
    /// Everything is relayed in the end-of-message reply.
    #[default]
    Deferred,
}

/// What a `Reject` status at `envelope_to` applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RejectionGranularity {
    WholeMessage,
    #[default]
    PerRecipient,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub reply_mode: ReplyMode,
    pub accept_modifications_on_reject: bool,
    pub recipient_rejection_granularity: RejectionGranularity,
    /// Hostname reported to handlers via [`Envelope::local_host`].
    pub local_host: String,
    /// Optional per-callback timeout enforced by the dispatcher; expiry
    /// aborts the session with a temporary-failure verdict.
    pub callback_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            reply_mode: ReplyMode::default(),
            accept_modifications_on_reject: false,
            recipient_rejection_granularity: RejectionGranularity::default(),
            local_host: "localhost".to_string(),
            callback_timeout: None,
        }
    }
}
