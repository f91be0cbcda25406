use tracing::{debug, warn};
use ulid::Ulid;

use crate::envelope::Envelope;
use crate::event::{Event, Stage};
use crate::verdict::{replay, Mutation, Verdict, WireReply};
use crate::{EngineConfig, MilterCallbacks, MilterError, RejectionGranularity, Status};

/// One filtering transaction: owns the envelope, drives events through the
/// bound handler in strict protocol order, and accumulates the final verdict
/// plus the handler's mutation requests.
///
/// The stage only ever advances forward through the fixed event order, or
/// jumps to a terminal `closed`/`aborted` stage; it never regresses. Events
/// must be fed strictly serially; the dispatcher guarantees this by locking
/// the session around each callback.
pub struct Session {
    id: String,
    stage: Stage,
    envelope: Envelope,
    callbacks: Box<dyn MilterCallbacks>,
    verdict: Verdict,
    config: EngineConfig,
    /// Watermark into the mutation log for incremental relay.
    relayed: usize,
}

impl Session {
    pub fn new(id: impl Into<String>, callbacks: Box<dyn MilterCallbacks>, config: EngineConfig) -> Self {
        let message_id = Ulid::new().to_string();
        let envelope = Envelope::new(message_id, config.local_host.clone());
        Session {
            id: id.into(),
            stage: Stage::Created,
            envelope,
            callbacks,
            verdict: Verdict::default(),
            config,
            relayed: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn verdict(&self) -> Verdict {
        self.verdict
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Feeds one event through the stage guard and the handler callback.
    ///
    /// Returns the per-stage status. An out-of-order event aborts the session
    /// and surfaces a [`MilterError::StageViolation`]; a failing callback
    /// aborts it with a temporary-failure verdict. A recoverable
    /// [`MilterError::NotFound`] from the handler is logged and the session
    /// continues.
    pub async fn feed(&mut self, event: Event) -> Result<Status, MilterError> {
        if matches!(event, Event::Abort) {
            self.abort().await;
            return Ok(Status::Continue);
        }

        let next = event.stage();
        if !self.stage.allows(next) {
            let err = MilterError::StageViolation {
                event: next.as_str().to_string(),
                stage: self.stage.as_str().to_string(),
            };
            warn!(session = %self.id, %err, "out-of-order event, aborting session");
            self.abort().await;
            return Err(err);
        }
        self.stage = next;
        debug!(session = %self.id, stage = %next, "event");

        let result = match &event {
            Event::Connect { hostname, addr } => {
                self.callbacks
                    .on_connect(hostname, *addr, &self.envelope)
                    .await
            }
            Event::Helo { name } => self.callbacks.on_helo(name, &self.envelope).await,
            Event::EnvelopeFrom { sender, auth } => {
                self.envelope.set_sender(sender.clone());
                self.envelope.set_auth(auth.clone());
                self.callbacks.on_envelope_from(&mut self.envelope).await
            }
            Event::EnvelopeTo { recipient } => {
                self.callbacks
                    .on_envelope_to(recipient, &mut self.envelope)
                    .await
            }
            Event::Header { name, value } => {
                self.envelope.push_header(name.clone(), value.clone());
                self.callbacks
                    .on_header(name, value, &mut self.envelope)
                    .await
            }
            Event::EndOfHeaders => self.callbacks.on_end_of_headers(&mut self.envelope).await,
            Event::Body { chunk } => self.callbacks.on_body(chunk, &mut self.envelope).await,
            Event::EndOfMessage => self.callbacks.on_end_of_message(&mut self.envelope).await,
            Event::Abort => unreachable!("handled above"),
        };

        let status = match result {
            Ok(status) => status,
            Err(MilterError::NotFound { what }) => {
                warn!(session = %self.id, stage = %next, %what, "recoverable not-found from handler");
                Status::Continue
            }
            Err(err) => {
                warn!(session = %self.id, stage = %next, %err, "handler failed, aborting with temporary failure");
                self.fail().await;
                return Err(err);
            }
        };

        match &event {
            Event::EnvelopeTo { recipient } => {
                if status == Status::Reject
                    && self.config.recipient_rejection_granularity
                        == RejectionGranularity::PerRecipient
                {
                    // Drop just this recipient; the transaction goes on.
                    debug!(session = %self.id, %recipient, "recipient rejected");
                    return Ok(status);
                }
                if status == Status::Continue {
                    self.envelope.push_recipient(recipient.clone());
                }
            }
            _ => {}
        }

        match status {
            Status::Continue => {
                if next == Stage::EndOfMessage {
                    self.close(Verdict::Accept);
                }
            }
            _ => {
                // Early verdict short-circuits the remaining stages; at
                // end-of-message it is simply the terminal verdict.
                self.close(verdict_for(status));
            }
        }

        Ok(status)
    }

    /// Mutations queued since the last call that may be relayed before
    /// end-of-message. Sender/recipient mutations are never released early;
    /// the transfer-agent protocol only accepts them at end-of-message.
    pub fn drain_delta(&mut self) -> Vec<Mutation> {
        let log = self.envelope.mutations();
        let delta: Vec<Mutation> = log[self.relayed..]
            .iter()
            .filter(|m| m.is_header())
            .cloned()
            .collect();
        self.relayed = log.len();
        delta
    }

    /// The end-of-message reply: final verdict plus the full mutation log in
    /// wire order.
    pub fn wire_reply(&self) -> WireReply {
        replay(
            self.verdict,
            self.envelope.mutations(),
            &self.envelope,
            &self.config,
        )
    }

    /// Reclaims the handler instance, for reuse across transactions when the
    /// handler opts in.
    pub(crate) fn into_callbacks(self) -> Box<dyn MilterCallbacks> {
        self.callbacks
    }

    pub(crate) fn handler_reusable(&self) -> bool {
        self.callbacks.reusable()
    }

    fn close(&mut self, verdict: Verdict) {
        self.verdict = verdict;
        self.envelope.freeze();
        self.stage = Stage::Closed;
    }

    /// Peer abort: pending mutations are discarded and only the cleanup hook
    /// runs.
    async fn abort(&mut self) {
        if self.stage.is_terminal() {
            return;
        }
        self.envelope.discard_mutations();
        self.envelope.freeze();
        self.callbacks.on_reset().await;
        self.stage = Stage::Aborted;
    }

    /// Handler-failure abort: like [`Session::abort`] but the verdict reported
    /// to the transfer agent is a temporary failure.
    async fn fail(&mut self) {
        self.abort().await;
        self.verdict = Verdict::TempFail;
    }

    pub(crate) async fn fail_timeout(&mut self) {
        self.fail().await;
    }
}

fn verdict_for(status: Status) -> Verdict {
    match status {
        Status::Continue => Verdict::Accept,
        Status::Accept => Verdict::AcceptSkip,
        Status::Reject => Verdict::Reject,
        Status::Discard => Verdict::Discard,
        Status::TempFail => Verdict::TempFail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NoOp;

    #[async_trait]
    impl MilterCallbacks for NoOp {}

    /// Rejects the transaction as soon as the envelope sender matches.
    struct RejectSender {
        matched: String,
    }

    #[async_trait]
    impl MilterCallbacks for RejectSender {
        async fn on_envelope_from(
            &mut self,
            envelope: &mut Envelope,
        ) -> Result<Status, MilterError> {
            if envelope.sender() == self.matched {
                return Ok(Status::Reject);
            }
            Ok(Status::Continue)
        }
    }

    struct Failing;

    #[async_trait]
    impl MilterCallbacks for Failing {
        async fn on_end_of_headers(
            &mut self,
            _envelope: &mut Envelope,
        ) -> Result<Status, MilterError> {
            Err(MilterError::handler(Stage::EndOfHeaders, "lookup exploded"))
        }
    }

    struct AddsAtEom;

    #[async_trait]
    impl MilterCallbacks for AddsAtEom {
        async fn on_end_of_message(
            &mut self,
            envelope: &mut Envelope,
        ) -> Result<Status, MilterError> {
            envelope.set_header("X-Pmilter", "Enable")?;
            envelope.add_recipient("<new-to@example.com>")?;
            Ok(Status::Continue)
        }
    }

    fn session(callbacks: Box<dyn MilterCallbacks>) -> Session {
        Session::new("conn-1", callbacks, EngineConfig::default())
    }

    async fn feed_through_headers(s: &mut Session) {
        s.feed(Event::Connect {
            hostname: "client.example.com".into(),
            addr: None,
        })
        .await
        .unwrap();
        s.feed(Event::Helo {
            name: "client.example.com".into(),
        })
        .await
        .unwrap();
        s.feed(Event::EnvelopeFrom {
            sender: "<from@example.com>".into(),
            auth: None,
        })
        .await
        .unwrap();
        s.feed(Event::EnvelopeTo {
            recipient: "<to@example.com>".into(),
        })
        .await
        .unwrap();
        s.feed(Event::Header {
            name: "Subject".into(),
            value: "Hello".into(),
        })
        .await
        .unwrap();
        s.feed(Event::EndOfHeaders).await.unwrap();
    }

    #[tokio::test]
    async fn full_transaction_defaults_to_accept() {
        let mut s = session(Box::new(NoOp));
        feed_through_headers(&mut s).await;
        s.feed(Event::EndOfMessage).await.unwrap();
        assert_eq!(s.stage(), Stage::Closed);
        assert_eq!(s.verdict(), Verdict::Accept);
        assert_eq!(s.envelope().recipients(), &["<to@example.com>"]);
    }

    #[tokio::test]
    async fn out_of_order_event_is_stage_violation_and_aborts() {
        let mut s = session(Box::new(NoOp));
        s.feed(Event::Connect {
            hostname: "c".into(),
            addr: None,
        })
        .await
        .unwrap();
        let err = s
            .feed(Event::EnvelopeTo {
                recipient: "<to@example.com>".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MilterError::StageViolation { .. }));
        assert_eq!(s.stage(), Stage::Aborted);
    }

    #[tokio::test]
    async fn event_before_connect_is_stage_violation() {
        let mut s = session(Box::new(NoOp));
        let err = s.feed(Event::EndOfMessage).await.unwrap_err();
        assert!(matches!(err, MilterError::StageViolation { .. }));
    }

    #[tokio::test]
    async fn terminal_session_rejects_further_events() {
        let mut s = session(Box::new(NoOp));
        feed_through_headers(&mut s).await;
        s.feed(Event::EndOfMessage).await.unwrap();
        let err = s
            .feed(Event::Body {
                chunk: b"late".to_vec(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MilterError::StageViolation { .. }));
    }

    #[tokio::test]
    async fn early_reject_short_circuits() {
        let mut s = session(Box::new(RejectSender {
            matched: "<spam-from@example.com>".into(),
        }));
        s.feed(Event::Connect {
            hostname: "c".into(),
            addr: None,
        })
        .await
        .unwrap();
        s.feed(Event::Helo { name: "c".into() }).await.unwrap();
        let status = s
            .feed(Event::EnvelopeFrom {
                sender: "<spam-from@example.com>".into(),
                auth: None,
            })
            .await
            .unwrap();
        assert_eq!(status, Status::Reject);
        assert_eq!(s.stage(), Stage::Closed);
        assert_eq!(s.verdict(), Verdict::Reject);
        // No further stage callbacks are delivered.
        assert!(s
            .feed(Event::EnvelopeTo {
                recipient: "<to@example.com>".into()
            })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn handler_error_aborts_with_temporary_failure() {
        let mut s = session(Box::new(Failing));
        s.feed(Event::Connect {
            hostname: "c".into(),
            addr: None,
        })
        .await
        .unwrap();
        s.feed(Event::Helo { name: "c".into() }).await.unwrap();
        s.feed(Event::EnvelopeFrom {
            sender: "<from@example.com>".into(),
            auth: None,
        })
        .await
        .unwrap();
        s.feed(Event::EnvelopeTo {
            recipient: "<to@example.com>".into(),
        })
        .await
        .unwrap();
        let err = s.feed(Event::EndOfHeaders).await.unwrap_err();
        assert!(matches!(err, MilterError::Handler { .. }));
        assert_eq!(s.stage(), Stage::Aborted);
        assert_eq!(s.verdict(), Verdict::TempFail);
        assert_eq!(s.wire_reply().verdict, Verdict::TempFail);
    }

    #[tokio::test]
    async fn abort_discards_queued_mutations() {
        struct QueuesEarly;

        #[async_trait]
        impl MilterCallbacks for QueuesEarly {
            async fn on_envelope_from(
                &mut self,
                envelope: &mut Envelope,
            ) -> Result<Status, MilterError> {
                envelope.set_header("X-Seen", "yes")?;
                envelope.change_sender("<rewritten@example.com>")?;
                Ok(Status::Continue)
            }
        }

        let mut s = session(Box::new(QueuesEarly));
        s.feed(Event::Connect {
            hostname: "c".into(),
            addr: None,
        })
        .await
        .unwrap();
        s.feed(Event::Helo { name: "c".into() }).await.unwrap();
        s.feed(Event::EnvelopeFrom {
            sender: "<from@example.com>".into(),
            auth: None,
        })
        .await
        .unwrap();
        assert_eq!(s.envelope().mutations().len(), 2);
        s.feed(Event::Abort).await.unwrap();
        assert_eq!(s.stage(), Stage::Aborted);
        assert!(s.envelope().mutations().is_empty());
        assert!(s.wire_reply().mutations.is_empty());
    }

    #[tokio::test]
    async fn eom_mutations_are_queued_and_replayed() {
        let mut s = session(Box::new(AddsAtEom));
        feed_through_headers(&mut s).await;
        s.feed(Event::EndOfMessage).await.unwrap();
        let reply = s.wire_reply();
        assert_eq!(reply.verdict, Verdict::Accept);
        assert_eq!(
            reply.recipients,
            &["<to@example.com>", "<new-to@example.com>"]
        );
        // Added header lands after all original headers.
        assert_eq!(
            reply.headers.last(),
            Some(&("X-Pmilter".to_string(), "Enable".to_string()))
        );
        // Envelope mutation precedes the header mutation on the wire.
        assert_eq!(
            reply.mutations,
            vec![
                Mutation::AddRecipient {
                    address: "<new-to@example.com>".into()
                },
                Mutation::AddHeader {
                    name: "X-Pmilter".into(),
                    value: "Enable".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn headers_preserve_input_order() {
        let mut s = session(Box::new(NoOp));
        s.feed(Event::Connect {
            hostname: "c".into(),
            addr: None,
        })
        .await
        .unwrap();
        s.feed(Event::Helo { name: "c".into() }).await.unwrap();
        s.feed(Event::EnvelopeFrom {
            sender: "<from@example.com>".into(),
            auth: None,
        })
        .await
        .unwrap();
        s.feed(Event::EnvelopeTo {
            recipient: "<to@example.com>".into(),
        })
        .await
        .unwrap();
        for (name, value) in [("From", "a"), ("To", "b"), ("Subject", "c"), ("Date", "d")] {
            s.feed(Event::Header {
                name: name.into(),
                value: value.into(),
            })
            .await
            .unwrap();
        }
        s.feed(Event::EndOfHeaders).await.unwrap();
        s.feed(Event::EndOfMessage).await.unwrap();
        let names: Vec<_> = s.envelope().headers().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["From", "To", "Subject", "Date"]);
    }

    #[tokio::test]
    async fn per_recipient_reject_drops_only_that_recipient() {
        struct RejectOne;

        #[async_trait]
        impl MilterCallbacks for RejectOne {
            async fn on_envelope_to(
                &mut self,
                recipient: &str,
                _envelope: &mut Envelope,
            ) -> Result<Status, MilterError> {
                if recipient == "<blocked@example.com>" {
                    return Ok(Status::Reject);
                }
                Ok(Status::Continue)
            }
        }

        let mut s = session(Box::new(RejectOne));
        s.feed(Event::Connect {
            hostname: "c".into(),
            addr: None,
        })
        .await
        .unwrap();
        s.feed(Event::Helo { name: "c".into() }).await.unwrap();
        s.feed(Event::EnvelopeFrom {
            sender: "<from@example.com>".into(),
            auth: None,
        })
        .await
        .unwrap();
        s.feed(Event::EnvelopeTo {
            recipient: "<ok@example.com>".into(),
        })
        .await
        .unwrap();
        s.feed(Event::EnvelopeTo {
            recipient: "<blocked@example.com>".into(),
        })
        .await
        .unwrap();
        s.feed(Event::EnvelopeTo {
            recipient: "<also-ok@example.com>".into(),
        })
        .await
        .unwrap();
        // Whole transaction still alive.
        assert_eq!(s.stage(), Stage::EnvelopeTo);
        assert_eq!(
            s.envelope().recipients(),
            &["<ok@example.com>", "<also-ok@example.com>"]
        );
    }

    #[tokio::test]
    async fn whole_message_granularity_rejects_transaction() {
        struct RejectOne;

        #[async_trait]
        impl MilterCallbacks for RejectOne {
            async fn on_envelope_to(
                &mut self,
                _recipient: &str,
                _envelope: &mut Envelope,
            ) -> Result<Status, MilterError> {
                Ok(Status::Reject)
            }
        }

        let config = EngineConfig {
            recipient_rejection_granularity: RejectionGranularity::WholeMessage,
            ..EngineConfig::default()
        };
        let mut s = Session::new("conn-1", Box::new(RejectOne), config);
        s.feed(Event::Connect {
            hostname: "c".into(),
            addr: None,
        })
        .await
        .unwrap();
        s.feed(Event::Helo { name: "c".into() }).await.unwrap();
        s.feed(Event::EnvelopeFrom {
            sender: "<from@example.com>".into(),
            auth: None,
        })
        .await
        .unwrap();
        s.feed(Event::EnvelopeTo {
            recipient: "<to@example.com>".into(),
        })
        .await
        .unwrap();
        assert_eq!(s.stage(), Stage::Closed);
        assert_eq!(s.verdict(), Verdict::Reject);
    }

    #[tokio::test]
    async fn not_found_from_handler_is_recoverable() {
        struct RemovesMissing;

        #[async_trait]
        impl MilterCallbacks for RemovesMissing {
            async fn on_end_of_message(
                &mut self,
                envelope: &mut Envelope,
            ) -> Result<Status, MilterError> {
                envelope.remove_recipient("<missing@example.com>")?;
                Ok(Status::Continue)
            }
        }

        let mut s = session(Box::new(RemovesMissing));
        feed_through_headers(&mut s).await;
        let status = s.feed(Event::EndOfMessage).await.unwrap();
        assert_eq!(status, Status::Continue);
        assert_eq!(s.stage(), Stage::Closed);
        assert_eq!(s.verdict(), Verdict::Accept);
    }
}
