//! Observation registry
//!
//! Fixed-capacity table of long-lived subscriptions. Mutated only by the
//! worker; survives session teardown and is replayed on reconnect with
//! freshened tokens. Slots are never reclaimed.

use tracing::trace;

use crate::error::{Error, Result, ServerResponse};
use crate::request::{GetHandler, Token};

/// One installed observation: a copy of the originating request plus the
/// token the server currently associates with it.
pub struct ObservationRecord {
    /// Static path prefix from the originating submit
    pub path_prefix: &'static str,
    /// Path below the prefix
    pub path: String,
    /// CoAP content-format requested for notifications
    pub content_type: u32,
    /// Notification sink
    pub handler: GetHandler,
    /// Token notifications are correlated against; refreshed on
    /// re-establishment
    pub token: Token,
}

/// Fixed-capacity observation table.
pub struct ObservationRegistry {
    slots: Vec<Option<ObservationRecord>>,
}

impl ObservationRegistry {
    /// Create a registry with `capacity` slots.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    /// Install a record in the first unused slot.
    ///
    /// Fails with [`Error::MemAlloc`] when every slot is in use; the
    /// caller is expected to size the capacity up front.
    pub fn insert(&mut self, record: ObservationRecord) -> Result<()> {
        match self.slots.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(record);
                Ok(())
            }
            None => Err(Error::MemAlloc),
        }
    }

    /// Deliver a received PDU to every observation whose token matches.
    ///
    /// Returns the number of observations notified. The same PDU may also
    /// satisfy the in-flight request; that correlation happens elsewhere.
    pub fn notify(&self, token: Token, response: &ServerResponse, payload: &[u8]) -> usize {
        let mut delivered = 0;
        for record in self.slots.iter().flatten() {
            if record.token == token && !record.token.is_empty() {
                trace!(path = %record.path, "observation notified");
                (record.handler)(response, &record.path, payload);
                delivered += 1;
            }
        }
        delivered
    }

    /// Iterate the in-use records mutably, for re-establishment.
    pub fn records_mut(&mut self) -> impl Iterator<Item = &mut ObservationRecord> {
        self.slots.iter_mut().flatten()
    }

    /// Number of in-use slots.
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Whether no observation is installed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total slot count.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn record(path: &str, token: Token, hits: Arc<AtomicUsize>) -> ObservationRecord {
        ObservationRecord {
            path_prefix: ".d/",
            path: path.to_string(),
            content_type: 50,
            handler: Arc::new(move |_, _, _| {
                hits.fetch_add(1, Ordering::SeqCst);
            }),
            token,
        }
    }

    #[test]
    fn insert_fails_when_full() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut registry = ObservationRegistry::with_capacity(2);
        let token = Token::from_bytes(&[1]);

        assert!(registry.insert(record("a", token, hits.clone())).is_ok());
        assert!(registry.insert(record("b", token, hits.clone())).is_ok());
        assert_eq!(
            registry.insert(record("c", token, hits)).err(),
            Some(Error::MemAlloc)
        );
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn notify_matches_on_token() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut registry = ObservationRegistry::with_capacity(4);
        let token_a = Token::from_bytes(&[1, 2]);
        let token_b = Token::from_bytes(&[3, 4]);

        registry.insert(record("a", token_a, hits.clone())).unwrap();
        registry.insert(record("b", token_b, hits.clone())).unwrap();

        let response = ServerResponse::from_code(2, 5);
        assert_eq!(registry.notify(token_a, &response, b"{}"), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Unknown token reaches no one.
        assert_eq!(registry.notify(Token::from_bytes(&[9]), &response, b"{}"), 0);
    }

    #[test]
    fn unassigned_tokens_never_match() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut registry = ObservationRegistry::with_capacity(1);
        registry
            .insert(record("a", Token::default(), hits.clone()))
            .unwrap();

        let response = ServerResponse::from_code(2, 5);
        assert_eq!(registry.notify(Token::default(), &response, b"{}"), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reestablishment_refreshes_tokens() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut registry = ObservationRegistry::with_capacity(2);
        registry
            .insert(record("a", Token::from_bytes(&[1]), hits.clone()))
            .unwrap();

        for observation in registry.records_mut() {
            observation.token = Token::from_bytes(&[7, 7]);
        }

        let response = ServerResponse::from_code(2, 5);
        assert_eq!(registry.notify(Token::from_bytes(&[7, 7]), &response, b"1"), 1);
    }
}
