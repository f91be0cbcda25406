/// The filters shipped with this crate.
///
/// `TransferCallbacks` copies messages whose `Subject` flags an emergency to
/// a configured list of addresses and tags them; `EnvelopeCallbacks` covers
/// the envelope-editing patterns (early reject, sender rewrite, recipient
/// addition).
use async_trait::async_trait;
use milter::{Envelope, MilterCallbacks, MilterError, Status};
use tracing::info;

/// Flags a transaction during `on_header` when the `Subject` mentions
/// `EMERGENCY`, then copies it to each configured emergency address at
/// end-of-message and tags it with `X-Pmilter: Enable`.
///
/// The flag is handler-private per-transaction state; `on_reset` clears it so
/// the instance can serve the next transaction on a reused connection.
pub struct TransferCallbacks {
    emergency_addresses: Vec<String>,
    need_transfer: bool,
}

impl TransferCallbacks {
    pub fn new(emergency_addresses: Vec<String>) -> Self {
        TransferCallbacks {
            emergency_addresses,
            need_transfer: false,
        }
    }
}

#[async_trait]
impl MilterCallbacks for TransferCallbacks {
    async fn on_header(
        &mut self,
        name: &str,
        value: &str,
        _envelope: &mut Envelope,
    ) -> Result<Status, MilterError> {
        if name.eq_ignore_ascii_case("subject") && value.contains("EMERGENCY") {
            self.need_transfer = true;
        }
        Ok(Status::Continue)
    }

    async fn on_end_of_message(
        &mut self,
        envelope: &mut Envelope,
    ) -> Result<Status, MilterError> {
        if self.need_transfer {
            info!(
                message_id = %envelope.message_id(),
                "emergency mail, transferring"
            );
            for address in &self.emergency_addresses {
                envelope.add_recipient(address.clone())?;
            }
            envelope.set_header("X-Pmilter", "Enable")?;
        }
        Ok(Status::Continue)
    }

    async fn on_reset(&mut self) {
        self.need_transfer = false;
    }

    fn reusable(&self) -> bool {
        true
    }
}

/// Envelope-editing example filter:
///
/// - rejects `<spam-from@example.com>` as soon as the sender is announced,
/// - rewrites `<change-from@example.com>` to `<new-from@example.com>`,
/// - adds `<new-to@example.com>` when `<add-to@example.com>` is a recipient.
#[derive(Default)]
pub struct EnvelopeCallbacks;

#[async_trait]
impl MilterCallbacks for EnvelopeCallbacks {
    async fn on_envelope_from(&mut self, envelope: &mut Envelope) -> Result<Status, MilterError> {
        if envelope.sender() == "<spam-from@example.com>" {
            info!(sender = envelope.sender(), "rejecting sender");
            return Ok(Status::Reject);
        }
        Ok(Status::Continue)
    }

    async fn on_end_of_message(
        &mut self,
        envelope: &mut Envelope,
    ) -> Result<Status, MilterError> {
        if envelope.sender() == "<change-from@example.com>" {
            envelope.change_sender("<new-from@example.com>")?;
        }
        if envelope
            .recipients()
            .iter()
            .any(|r| r == "<add-to@example.com>")
        {
            envelope.add_recipient("<new-to@example.com>")?;
        }
        Ok(Status::Continue)
    }
}
