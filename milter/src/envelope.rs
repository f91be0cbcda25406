use std::time::SystemTime;

use crate::event::AuthInfo;
use crate::verdict::Mutation;
use crate::MilterError;

/// Mutable per-session record of the in-flight message: sender, recipients,
/// headers and session metadata, plus the ordered log of mutation requests
/// queued by the handler.
///
/// An envelope is exclusively owned by its session; handler callbacks receive
/// it as `&mut Envelope` for the duration of one callback only. Mutation
/// operations queue requests for replay at end-of-message; recipient and
/// header edits also update the local state so later reads see them.
#[derive(Debug)]
pub struct Envelope {
    sender: String,
    recipients: Vec<String>,
    headers: Vec<(String, String)>,
    auth: Option<AuthInfo>,

    message_id: String,
    receive_time: SystemTime,
    local_host: String,

    mutations: Vec<Mutation>,
    frozen: bool,
}

impl Envelope {
    pub(crate) fn new(message_id: String, local_host: String) -> Self {
        Envelope {
            sender: String::new(),
            recipients: Vec::new(),
            headers: Vec::new(),
            auth: None,
            message_id,
            receive_time: SystemTime::now(),
            local_host,
            mutations: Vec::new(),
            frozen: false,
        }
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    /// Headers in original message order, followed by any pairs the handler
    /// appended via [`Envelope::set_header`].
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// First header value matching `name` (case-insensitive), per milter
    /// convention.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// SASL authentication info, when the transaction was authenticated.
    pub fn auth(&self) -> Option<&AuthInfo> {
        self.auth.as_ref()
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn receive_time(&self) -> SystemTime {
        self.receive_time
    }

    pub fn local_host(&self) -> &str {
        &self.local_host
    }

    /// Queues a sender rewrite and makes it visible to later reads. Fails
    /// with a stage violation once the envelope is frozen.
    pub fn change_sender(&mut self, address: impl Into<String>) -> Result<(), MilterError> {
        self.check_unfrozen("change_sender")?;
        let address = address.into();
        self.sender = address.clone();
        self.mutations.push(Mutation::ChangeSender { address });
        Ok(())
    }

    /// Queues a recipient addition. Idempotent: an address already on the
    /// list (by exact string) is not added or queued again.
    pub fn add_recipient(&mut self, address: impl Into<String>) -> Result<(), MilterError> {
        self.check_unfrozen("add_recipient")?;
        let address = address.into();
        if self.recipients.iter().any(|r| *r == address) {
            return Ok(());
        }
        self.recipients.push(address.clone());
        self.mutations.push(Mutation::AddRecipient { address });
        Ok(())
    }

    /// Queues a recipient removal. An address never added yields
    /// [`MilterError::NotFound`]; the session treats that as recoverable.
    pub fn remove_recipient(&mut self, address: &str) -> Result<(), MilterError> {
        self.check_unfrozen("remove_recipient")?;
        let pos = self
            .recipients
            .iter()
            .position(|r| r == address)
            .ok_or_else(|| MilterError::NotFound {
                what: format!("recipient {}", address),
            })?;
        self.recipients.remove(pos);
        self.mutations.push(Mutation::RemoveRecipient {
            address: address.to_string(),
        });
        Ok(())
    }

    /// Queues a header addition and appends the pair to the visible list.
    /// Header names are not unique: setting an existing name appends an
    /// additional pair rather than overwriting (lookups return the first
    /// match).
    pub fn set_header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), MilterError> {
        self.check_unfrozen("set_header")?;
        let (name, value) = (name.into(), value.into());
        self.headers.push((name.clone(), value.clone()));
        self.mutations.push(Mutation::AddHeader { name, value });
        Ok(())
    }

    /// Queues a rewrite of the `index`-th occurrence (zero-based) of header
    /// `name` and updates the visible pair. [`MilterError::NotFound`] when no
    /// such occurrence exists.
    pub fn change_header(
        &mut self,
        name: &str,
        index: usize,
        value: impl Into<String>,
    ) -> Result<(), MilterError> {
        self.check_unfrozen("change_header")?;
        let value = value.into();
        let slot = self
            .headers
            .iter_mut()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .nth(index)
            .ok_or_else(|| MilterError::NotFound {
                what: format!("header {}[{}]", name, index),
            })?;
        slot.1 = value.clone();
        self.mutations.push(Mutation::ChangeHeader {
            name: name.to_string(),
            index,
            value,
        });
        Ok(())
    }

    /// Queues a header insertion at `index` (clamped to the list length) and
    /// updates the visible list.
    pub fn insert_header(
        &mut self,
        index: usize,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), MilterError> {
        self.check_unfrozen("insert_header")?;
        let (name, value) = (name.into(), value.into());
        let index = index.min(self.headers.len());
        self.headers.insert(index, (name.clone(), value.clone()));
        self.mutations.push(Mutation::InsertHeader { index, name, value });
        Ok(())
    }

    /// Queues a quarantine request for the message.
    pub fn quarantine(&mut self, reason: impl Into<String>) -> Result<(), MilterError> {
        self.check_unfrozen("quarantine")?;
        self.mutations.push(Mutation::Quarantine {
            reason: reason.into(),
        });
        Ok(())
    }

    /// Mutation requests queued so far, in the order the handler issued them.
    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    fn check_unfrozen(&self, op: &str) -> Result<(), MilterError> {
        if self.frozen {
            return Err(MilterError::StageViolation {
                event: op.to_string(),
                stage: "closed".to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn set_sender(&mut self, sender: String) {
        self.sender = sender;
    }

    pub(crate) fn set_auth(&mut self, auth: Option<AuthInfo>) {
        if self.auth.is_none() {
            self.auth = auth;
        }
    }

    pub(crate) fn push_recipient(&mut self, recipient: String) {
        if !self.recipients.iter().any(|r| *r == recipient) {
            self.recipients.push(recipient);
        }
    }

    pub(crate) fn push_header(&mut self, name: String, value: String) {
        self.headers.push((name, value));
    }

    pub(crate) fn freeze(&mut self) {
        self.frozen = true;
    }

    pub(crate) fn discard_mutations(&mut self) {
        self.mutations.clear();
    }
}
