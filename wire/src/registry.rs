//! Transaction registry: cancel handles and response routing.
//!
//! Both sides keep one of these per process. The controller registers a
//! cancel handle plus a response channel per inbound HTTP transaction; the
//! agent registers a cancel handle per outbound HTTP call. Duplicate ids are
//! a programming error: the registration is refused and logged, the
//! existing entry wins.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::frame::TunnelControl;

#[derive(Debug, Default)]
pub struct TransactionRegistry {
    cancels: DashMap<String, CancellationToken>,
    responders: DashMap<String, mpsc::Sender<TunnelControl>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the cancel handle for `id`. Returns `false` (and keeps the
    /// existing handle) when `id` is already registered.
    pub fn register_cancel(&self, id: &str, token: CancellationToken) -> bool {
        match self.cancels.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                error!(transaction_id = %id, "duplicate transaction id, dropping new registration");
                false
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(token);
                true
            }
        }
    }

    /// Idempotent.
    pub fn unregister_cancel(&self, id: &str) {
        self.cancels.remove(id);
    }

    /// Invoke the cancel handle for `id` if one is registered. Never fails.
    pub fn cancel(&self, id: &str) {
        if let Some(entry) = self.cancels.get(id) {
            entry.value().cancel();
        } else {
            debug!(transaction_id = %id, "cancel for unknown transaction, ignoring");
        }
    }

    /// Attach the response channel for `id`. Same duplicate policy as
    /// [`register_cancel`](Self::register_cancel).
    pub fn register_responder(&self, id: &str, tx: mpsc::Sender<TunnelControl>) -> bool {
        match self.responders.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                error!(transaction_id = %id, "duplicate responder registration, dropping");
                false
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(tx);
                true
            }
        }
    }

    pub fn unregister_responder(&self, id: &str) {
        self.responders.remove(id);
    }

    /// Deliver a response frame to the transaction's channel. Returns
    /// `false` when no responder is registered or the receiving end is
    /// gone; the caller drops the frame either way (trailing chunks after a
    /// cancel are expected and tolerated).
    pub async fn respond(&self, id: &str, control: TunnelControl) -> bool {
        let tx = match self.responders.get(id) {
            Some(entry) => entry.value().clone(),
            None => {
                debug!(transaction_id = %id, "response frame for unknown transaction, dropping");
                return false;
            }
        };
        tx.send(control).await.is_ok()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.cancels.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.cancels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cancels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_id_keeps_existing_handle() {
        let registry = TransactionRegistry::new();
        let first = CancellationToken::new();
        let second = CancellationToken::new();
        assert!(registry.register_cancel("t1", first.clone()));
        assert!(!registry.register_cancel("t1", second.clone()));

        registry.cancel("t1");
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
    }

    #[test]
    fn cancel_unknown_id_is_a_noop() {
        let registry = TransactionRegistry::new();
        registry.cancel("nope");
        assert!(registry.is_empty());
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = TransactionRegistry::new();
        registry.register_cancel("t1", CancellationToken::new());
        registry.unregister_cancel("t1");
        registry.unregister_cancel("t1");
        assert!(!registry.contains("t1"));
    }

    #[tokio::test]
    async fn respond_routes_to_the_registered_channel() {
        let registry = TransactionRegistry::new();
        let (tx, mut rx) = mpsc::channel(4);
        registry.register_responder("t1", tx);

        let delivered = registry
            .respond("t1", TunnelControl::CancelRequest { id: "t1".into() })
            .await;
        assert!(delivered);
        assert_eq!(
            rx.recv().await,
            Some(TunnelControl::CancelRequest { id: "t1".into() })
        );
    }

    #[tokio::test]
    async fn respond_after_unregister_drops_the_frame() {
        let registry = TransactionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        registry.register_responder("t1", tx);
        registry.unregister_responder("t1");

        let delivered = registry
            .respond("t1", TunnelControl::CancelRequest { id: "t1".into() })
            .await;
        assert!(!delivered);
    }
}
