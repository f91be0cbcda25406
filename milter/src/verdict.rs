use crate::envelope::Envelope;
use crate::EngineConfig;

/// Final decision for one filtering transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verdict {
    /// Message passed through the whole event chain without an explicit
    /// decision (the default).
    #[default]
    Accept,
    /// Handler explicitly accepted and asked to stop further checks.
    AcceptSkip,
    Reject,
    Discard,
    TempFail,
}

impl Verdict {
    /// The status string used by the conformance harness.
    pub fn as_status_str(&self) -> &'static str {
        match self {
            Verdict::Accept => "pass",
            Verdict::AcceptSkip => "accept",
            Verdict::Reject => "reject",
            Verdict::Discard => "discard",
            Verdict::TempFail => "temporary-failure",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_status_str())
    }
}

/// One queued mutation request. Requests are appended to the session's log in
/// the order the handler issued them and replayed in one pass at
/// end-of-message; the engine never destructively edits the envelope on the
/// wire mid-session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    AddRecipient { address: String },
    RemoveRecipient { address: String },
    ChangeSender { address: String },
    AddHeader { name: String, value: String },
    ChangeHeader { name: String, index: usize, value: String },
    InsertHeader { index: usize, name: String, value: String },
    Quarantine { reason: String },
}

impl Mutation {
    /// Envelope-level mutations may only be announced to the transfer agent
    /// at end-of-message, and must precede header changes on the wire.
    pub fn is_envelope(&self) -> bool {
        matches!(
            self,
            Mutation::AddRecipient { .. }
                | Mutation::RemoveRecipient { .. }
                | Mutation::ChangeSender { .. }
        )
    }

    pub fn is_header(&self) -> bool {
        matches!(
            self,
            Mutation::AddHeader { .. }
                | Mutation::ChangeHeader { .. }
                | Mutation::InsertHeader { .. }
        )
    }
}

/// The reply handed back to the transfer agent at end-of-message: the final
/// verdict, the mutation requests in wire order, and the frozen envelope
/// content for transports that relay full state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireReply {
    pub verdict: Verdict,
    pub mutations: Vec<Mutation>,
    pub sender: String,
    pub recipients: Vec<String>,
    pub headers: Vec<(String, String)>,
}

/// Translates a finished session into the wire reply.
///
/// Wire ordering: queue order is preserved within each group, but envelope
/// mutations (sender/recipient) are replayed before header mutations, with
/// quarantine requests last, as the transfer-agent protocol expects. On
/// reject/discard the mutations are dropped unless the engine is configured
/// to accept modifications on reject.
pub fn replay(
    verdict: Verdict,
    mutations: &[Mutation],
    envelope: &Envelope,
    config: &EngineConfig,
) -> WireReply {
    let relay_mutations = match verdict {
        Verdict::Reject | Verdict::Discard | Verdict::TempFail => {
            if !mutations.is_empty() && !config.accept_modifications_on_reject {
                tracing::warn!(
                    message_id = %envelope.message_id(),
                    verdict = %verdict,
                    dropped = mutations.len(),
                    "dropping queued mutations on non-accepting verdict"
                );
            }
            config.accept_modifications_on_reject
        }
        Verdict::Accept | Verdict::AcceptSkip => true,
    };

    let mut ordered = Vec::new();
    if relay_mutations {
        ordered.extend(mutations.iter().filter(|m| m.is_envelope()).cloned());
        ordered.extend(mutations.iter().filter(|m| m.is_header()).cloned());
        ordered.extend(
            mutations
                .iter()
                .filter(|m| matches!(m, Mutation::Quarantine { .. }))
                .cloned(),
        );
    }

    WireReply {
        verdict,
        mutations: ordered,
        sender: envelope.sender().to_string(),
        recipients: envelope.recipients().to_vec(),
        headers: envelope.headers().to_vec(),
    }
}
