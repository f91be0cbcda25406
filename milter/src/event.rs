use std::net::IpAddr;

/// SASL authentication details announced by the transfer agent at
/// `MAIL FROM` time (the `auth_authen`/`auth_author`/`auth_type` macros).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    /// Authenticated login name.
    pub identity: String,
    /// Authenticated sender, when it differs from the login name.
    pub sender: Option<String>,
    /// SASL mechanism, e.g. `PLAIN` or `LOGIN`.
    pub mechanism: Option<String>,
}

/// One filter-protocol event as delivered by the transfer agent.
///
/// Payloads are immutable once delivered; the session only ever reads them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connect {
        hostname: String,
        addr: Option<IpAddr>,
    },
    Helo {
        name: String,
    },
    EnvelopeFrom {
        sender: String,
        auth: Option<AuthInfo>,
    },
    EnvelopeTo {
        recipient: String,
    },
    Header {
        name: String,
        value: String,
    },
    EndOfHeaders,
    Body {
        chunk: Vec<u8>,
    },
    EndOfMessage,
    /// Transaction aborted by the peer. Legal at any pre-terminal point.
    Abort,
}

/// Protocol stage of a session. Stages only ever advance forward through the
/// fixed event order, or jump to one of the two terminal stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Session exists but no event has been delivered yet.
    Created,
    Connect,
    Helo,
    EnvelopeFrom,
    EnvelopeTo,
    Header,
    EndOfHeaders,
    Body,
    EndOfMessage,
    /// Terminal: the transaction completed (or was short-circuited by an
    /// early verdict).
    Closed,
    /// Terminal: the transaction was aborted; queued mutations are discarded.
    Aborted,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Closed | Stage::Aborted)
    }

    /// Whether `next` is a legal stage to enter from `self`. `envelope_to`,
    /// `header` and `body` are the only repeatable stages; `header` and
    /// `body` may also be absent entirely.
    pub fn allows(&self, next: Stage) -> bool {
        use Stage::*;
        match (self, next) {
            (Created, Connect) => true,
            (Connect, Helo) => true,
            (Helo, EnvelopeFrom) => true,
            (EnvelopeFrom, EnvelopeTo) => true,
            (EnvelopeTo, EnvelopeTo | Header | EndOfHeaders) => true,
            (Header, Header | EndOfHeaders) => true,
            (EndOfHeaders, Body | EndOfMessage) => true,
            (Body, Body | EndOfMessage) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Created => "created",
            Stage::Connect => "connect",
            Stage::Helo => "helo",
            Stage::EnvelopeFrom => "envelope_from",
            Stage::EnvelopeTo => "envelope_to",
            Stage::Header => "header",
            Stage::EndOfHeaders => "end_of_headers",
            Stage::Body => "body",
            Stage::EndOfMessage => "end_of_message",
            Stage::Closed => "closed",
            Stage::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Event {
    /// The stage this event corresponds to. `Abort` maps to the terminal
    /// `Aborted` stage.
    pub fn stage(&self) -> Stage {
        match self {
            Event::Connect { .. } => Stage::Connect,
            Event::Helo { .. } => Stage::Helo,
            Event::EnvelopeFrom { .. } => Stage::EnvelopeFrom,
            Event::EnvelopeTo { .. } => Stage::EnvelopeTo,
            Event::Header { .. } => Stage::Header,
            Event::EndOfHeaders => Stage::EndOfHeaders,
            Event::Body { .. } => Stage::Body,
            Event::EndOfMessage => Stage::EndOfMessage,
            Event::Abort => Stage::Aborted,
        }
    }
}
