use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, error};

use crate::event::Event;
use crate::session::Session;
use crate::verdict::{Mutation, WireReply};
use crate::{EngineConfig, MilterCallbacks, MilterFactory, MilterError, ReplyMode, Status};

/// Result of feeding one event: the per-stage status, the mutation delta
/// queued since the last dispatch for this session (empty in deferred reply
/// mode, and never sender/recipient mutations before end-of-message), and the
/// full wire reply once the session reached a terminal stage.
#[derive(Debug)]
pub struct Dispatch {
    pub status: Status,
    pub mutations: Vec<Mutation>,
    pub reply: Option<WireReply>,
}

/// Binds a handler factory to incoming sessions and routes events to them.
///
/// Sessions with distinct ids are fully independent and run in parallel;
/// events for one id are serialized behind that session's own lock, so a
/// second event for the same id waits until the prior callback returned.
/// The registry map is the only state shared across sessions.
pub struct Dispatcher {
    factory: Arc<dyn MilterFactory>,
    config: EngineConfig,
    sessions: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Session>>>>,
    /// Handler instances that opted into reuse, parked between transactions
    /// on the same connection.
    parked: Mutex<HashMap<String, Box<dyn MilterCallbacks>>>,
}

impl Dispatcher {
    pub fn new(factory: Arc<dyn MilterFactory>, config: EngineConfig) -> Self {
        Dispatcher {
            factory,
            config,
            sessions: Mutex::new(HashMap::new()),
            parked: Mutex::new(HashMap::new()),
        }
    }

    /// Looks up or creates the session for `session_id` and feeds `event`.
    ///
    /// A stage violation is returned as an error; it is the caller's
    /// protocol bug and never corrupts other sessions. A handler failure or
    /// callback timeout is absorbed here: the error goes to the log and the
    /// returned dispatch carries the session's temporary-failure reply.
    pub async fn dispatch(
        &self,
        session_id: &str,
        event: Event,
    ) -> Result<Dispatch, MilterError> {
        let session = self.session_for(session_id).await;
        let stage = event.stage();

        let mut guard = session.lock().await;
        let result = match self.config.callback_timeout {
            Some(limit) => match tokio::time::timeout(limit, guard.feed(event)).await {
                Ok(result) => result,
                Err(_) => {
                    guard.fail_timeout().await;
                    Err(MilterError::Timeout {
                        stage: stage.as_str().to_string(),
                    })
                }
            },
            None => guard.feed(event).await,
        };

        let dispatch = match result {
            Ok(status) => {
                let reply = guard.is_terminal().then(|| guard.wire_reply());
                let mutations = match self.config.reply_mode {
                    ReplyMode::Immediate if reply.is_none() => guard.drain_delta(),
                    _ => Vec::new(),
                };
                Dispatch {
                    status,
                    mutations,
                    reply,
                }
            }
            Err(err @ MilterError::StageViolation { .. }) => {
                drop(guard);
                drop(session);
                self.remove(session_id);
                return Err(err);
            }
            Err(err) => {
                error!(session = session_id, %err, "session failed");
                Dispatch {
                    status: Status::TempFail,
                    mutations: Vec::new(),
                    reply: Some(guard.wire_reply()),
                }
            }
        };

        let terminal = guard.is_terminal();
        drop(guard);
        if terminal {
            // Drop our own handle first so the finished session can be
            // unwrapped and its handler parked.
            drop(session);
            self.remove(session_id);
        }
        Ok(dispatch)
    }

    /// Number of in-flight sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn session_for(&self, session_id: &str) -> Arc<tokio::sync::Mutex<Session>> {
        if let Some(existing) = self.sessions.lock().unwrap().get(session_id) {
            return existing.clone();
        }

        // New transaction: reuse a parked handler instance for this
        // connection after its cleanup hook ran, otherwise build a fresh one.
        let parked = self.parked.lock().unwrap().remove(session_id);
        let callbacks = match parked {
            Some(mut callbacks) => {
                debug!(session = session_id, "reusing handler for new transaction");
                callbacks.on_reset().await;
                callbacks
            }
            None => self.factory.create(),
        };

        let created = Arc::new(tokio::sync::Mutex::new(Session::new(
            session_id,
            callbacks,
            self.config.clone(),
        )));
        self.sessions
            .lock()
            .unwrap()
            .entry(session_id.to_string())
            .or_insert(created)
            .clone()
    }

    /// Releases a finished session; a reuse-capable handler is parked for the
    /// next transaction on this connection.
    fn remove(&self, session_id: &str) {
        let removed = self.sessions.lock().unwrap().remove(session_id);
        if let Some(arc) = removed {
            // A concurrent dispatch still holding the session keeps it alive
            // until it returns; the handler is simply not parked then.
            if let Ok(mutex) = Arc::try_unwrap(arc) {
                let session = mutex.into_inner();
                if session.handler_reusable() {
                    self.parked
                        .lock()
                        .unwrap()
                        .insert(session_id.to_string(), session.into_callbacks());
                }
            }
        }
    }
}
