//! Scripted conformance driver for handler authors.
//!
//! Feeds a fixture (envelope sender, recipients, headers, optional body)
//! through a dispatcher in protocol order and reports the final verdict and
//! envelope state for assertion, the way an external transfer-agent test
//! server would.

use std::sync::Arc;

use ulid::Ulid;

use crate::dispatcher::Dispatcher;
use crate::event::{Event, Stage};
use crate::verdict::{Mutation, WireReply};
use crate::{EngineConfig, MilterFactory, MilterError};

/// One scripted mail transaction.
#[derive(Debug, Clone, Default)]
pub struct Fixture {
    pub sender: String,
    pub recipients: Vec<String>,
    /// Ordered header list, exactly as the message carries it.
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

/// What the transfer agent would have seen at the end of the transaction.
#[derive(Debug, Clone)]
pub struct Outcome {
    /// `pass`, `accept`, `reject`, `discard` or `temporary-failure`.
    pub status: String,
    pub sender: String,
    pub recipients: Vec<String>,
    pub headers: Vec<(String, String)>,
    pub mutations: Vec<Mutation>,
}

impl From<WireReply> for Outcome {
    fn from(reply: WireReply) -> Self {
        Outcome {
            status: reply.verdict.as_status_str().to_string(),
            sender: reply.sender,
            recipients: reply.recipients,
            headers: reply.headers,
            mutations: reply.mutations,
        }
    }
}

/// Runs `fixture` through a fresh session against `factory`'s handler.
///
/// Early verdicts short-circuit exactly as they would live: once a dispatch
/// carries a reply, no further events are delivered.
pub async fn run(
    factory: Arc<dyn MilterFactory>,
    config: EngineConfig,
    fixture: Fixture,
) -> Result<Outcome, MilterError> {
    let dispatcher = Dispatcher::new(factory, config);
    let session_id = Ulid::new().to_string();

    let mut events = Vec::new();
    events.push(Event::Connect {
        hostname: "client.example.com".to_string(),
        addr: None,
    });
    events.push(Event::Helo {
        name: "client.example.com".to_string(),
    });
    events.push(Event::EnvelopeFrom {
        sender: fixture.sender,
        auth: None,
    });
    for recipient in fixture.recipients {
        events.push(Event::EnvelopeTo { recipient });
    }
    for (name, value) in fixture.headers {
        events.push(Event::Header { name, value });
    }
    events.push(Event::EndOfHeaders);
    if let Some(chunk) = fixture.body {
        events.push(Event::Body { chunk });
    }
    events.push(Event::EndOfMessage);

    for event in events {
        let dispatch = dispatcher.dispatch(&session_id, event).await?;
        if let Some(reply) = dispatch.reply {
            return Ok(reply.into());
        }
    }
    // End-of-message always carries a reply, so an empty script is the only
    // way here.
    Err(MilterError::handler(
        Stage::EndOfMessage,
        "transaction finished without a reply",
    ))
}
