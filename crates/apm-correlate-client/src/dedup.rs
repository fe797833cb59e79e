//! In-flight request deduplication
//!
//! Tracks which dedup keys currently have a request dispatched and not yet
//! finished. The table is bounded; when it is full the oldest active key is
//! evicted, which can let one duplicate through under extreme load.

use crate::request::PendingRequest;
use apm_correlate_core::DedupKey;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

#[derive(Default)]
struct Table {
    /// key -> (owning request id, admission sequence)
    active: HashMap<DedupKey, (u64, u64)>,
    /// admission sequence -> key, oldest first
    order: BTreeMap<u64, DedupKey>,
    next_seq: u64,
}

/// Bounded table of keys with work in flight
pub struct Deduplicator {
    capacity: usize,
    table: Mutex<Table>,
}

impl Deduplicator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            table: Mutex::new(Table::default()),
        }
    }

    /// Returns true if the request's key is already active. Otherwise the
    /// request becomes the key's owner and false is returned.
    pub fn is_duplicate(&self, request: &PendingRequest) -> bool {
        let key = request.dedup_key();
        let mut table = self.table.lock();

        if table.active.contains_key(&key) {
            return true;
        }

        if table.active.len() >= self.capacity {
            if let Some((_, oldest)) = table.order.pop_first() {
                table.active.remove(&oldest);
                warn!(
                    method = %oldest.operation,
                    dim = %oldest.dim_name,
                    value = %oldest.dim_value,
                    "Dedup table full, evicting oldest in-flight key"
                );
            }
        }

        let seq = table.next_seq;
        table.next_seq += 1;
        table.order.insert(seq, key.clone());
        table.active.insert(key, (request.id(), seq));
        false
    }

    /// Clear the request's key if this request still owns it
    pub fn release(&self, request: &PendingRequest) {
        let key = request.dedup_key();
        let mut table = self.table.lock();

        let seq = match table.active.get(&key) {
            Some(&(owner, seq)) if owner == request.id() => seq,
            _ => return,
        };
        table.active.remove(&key);
        table.order.remove(&seq);
    }

    /// Number of active keys
    pub fn len(&self) -> usize {
        self.table.lock().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apm_correlate_core::{Correlation, Lifecycle, Operation};
    use std::sync::Arc;

    fn request(id: u64, operation: Operation, corr_type: &str, value: &str) -> PendingRequest {
        PendingRequest::new(
            id,
            operation,
            Arc::new(Correlation::new("host", "web-1", corr_type, value)),
            Lifecycle::new().token(),
            Box::new(|_| {}),
        )
    }

    #[test]
    fn test_second_request_is_duplicate() {
        let dedup = Deduplicator::new(10);
        let first = request(1, Operation::Upsert, "service", "checkout");
        let second = request(2, Operation::Upsert, "service", "payments");

        assert!(!dedup.is_duplicate(&first));
        assert!(dedup.is_duplicate(&second));
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn test_different_operation_or_type_is_not_duplicate() {
        let dedup = Deduplicator::new(10);
        assert!(!dedup.is_duplicate(&request(1, Operation::Upsert, "service", "a")));
        assert!(!dedup.is_duplicate(&request(2, Operation::Delete, "service", "a")));
        assert!(!dedup.is_duplicate(&request(3, Operation::Upsert, "environment", "a")));
        assert_eq!(dedup.len(), 3);
    }

    #[test]
    fn test_release_allows_next_request() {
        let dedup = Deduplicator::new(10);
        let first = request(1, Operation::Upsert, "service", "checkout");
        let second = request(2, Operation::Upsert, "service", "checkout");

        assert!(!dedup.is_duplicate(&first));
        dedup.release(&first);
        assert!(dedup.is_empty());
        assert!(!dedup.is_duplicate(&second));
    }

    #[test]
    fn test_release_by_non_owner_is_ignored() {
        let dedup = Deduplicator::new(10);
        let owner = request(1, Operation::Upsert, "service", "checkout");
        let duplicate = request(2, Operation::Upsert, "service", "checkout");

        assert!(!dedup.is_duplicate(&owner));
        assert!(dedup.is_duplicate(&duplicate));
        dedup.release(&duplicate);
        assert_eq!(dedup.len(), 1);
        assert!(dedup.is_duplicate(&duplicate));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let dedup = Deduplicator::new(2);
        let a = request(1, Operation::Upsert, "a", "1");
        let b = request(2, Operation::Upsert, "b", "1");
        let c = request(3, Operation::Upsert, "c", "1");

        assert!(!dedup.is_duplicate(&a));
        assert!(!dedup.is_duplicate(&b));
        assert!(!dedup.is_duplicate(&c));
        assert_eq!(dedup.len(), 2);

        // `a` was evicted, so the same key is admitted again
        assert!(!dedup.is_duplicate(&request(4, Operation::Upsert, "a", "2")));
        // `b` went out with the previous admission, `c` goes out now
        assert!(!dedup.is_duplicate(&request(5, Operation::Upsert, "b", "2")));
        assert_eq!(dedup.len(), 2);

        // the evicted owner's release must not clear the new owner
        dedup.release(&a);
        assert!(dedup.is_duplicate(&request(6, Operation::Upsert, "a", "3")));
    }

    #[test]
    fn test_concurrent_admission() {
        let dedup = Arc::new(Deduplicator::new(1000));
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let dedup = dedup.clone();
                std::thread::spawn(move || {
                    let mut admitted = 0;
                    for i in 0..100u64 {
                        let req = request(t * 100 + i, Operation::Upsert, &format!("k{}", i), "v");
                        if !dedup.is_duplicate(&req) {
                            admitted += 1;
                        }
                    }
                    admitted
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 100);
        assert_eq!(dedup.len(), 100);
    }
}
