use std::{
    collections::{HashSet, VecDeque},
    sync::Mutex,
};

use crate::error::{BadDataReceived, Error};

/// How many decrypt-side IVs are remembered per master key.
pub(crate) const REPLAY_CACHE_CAPACITY: usize = 256;

/// A bounded set of initialization vectors already seen on inbound streams.
///
/// Replaying a recorded ciphertext stream re-presents its IV, so a hit here
/// rejects the connection before any upstream dial happens. The bound keeps
/// memory constant; protection is therefore best-effort over the last
/// [`REPLAY_CACHE_CAPACITY`] connections, which is all the protocol
/// offers.
#[derive(Debug)]
pub(crate) struct ReplayCache(Mutex<Inner>);

#[derive(Debug)]
struct Inner {
    seen: HashSet<Vec<u8>>,
    order: VecDeque<Vec<u8>>,
    capacity: usize,
}

impl ReplayCache {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        ReplayCache(Mutex::new(Inner {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }))
    }

    /// Insert a new IV into the replay cache.
    /// Returns `Ok(())` if the IV has not been seen (i.e., accepted).
    pub(crate) fn check_or_insert(&self, iv: &[u8]) -> Result<(), Error> {
        let mut inner = self.0.lock().unwrap();

        if inner.seen.contains(iv) {
            return Err(BadDataReceived::ReusedIv.into());
        }

        inner.seen.insert(iv.to_vec());
        inner.order.push_back(iv.to_vec());

        while inner.order.len() > inner.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.seen.remove(&oldest);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_rejects_duplicate() {
        let cache = ReplayCache::with_capacity(16);

        let iv = [1u8; 16];
        assert!(cache.check_or_insert(&iv).is_ok());
        assert!(cache.check_or_insert(&iv).is_err());
    }

    #[test]
    fn test_distinct_ivs_accepted() {
        let cache = ReplayCache::with_capacity(16);
        for i in 0..16u8 {
            assert!(cache.check_or_insert(&[i; 16]).is_ok());
        }
    }

    #[test]
    fn test_evicts_oldest_past_capacity() {
        let cache = ReplayCache::with_capacity(4);
        for i in 0..4u8 {
            assert!(cache.check_or_insert(&[i; 8]).is_ok());
        }
        // Pushes [0; 8] out of the window.
        assert!(cache.check_or_insert(&[4u8; 8]).is_ok());
        assert!(cache.check_or_insert(&[0u8; 8]).is_ok());
        // [2; 8] is still inside the window.
        assert!(cache.check_or_insert(&[2u8; 8]).is_err());
    }

    #[test]
    fn test_window_covers_full_capacity() {
        let cache = ReplayCache::with_capacity(256);
        for i in 0..=255u8 {
            assert!(cache.check_or_insert(&[i; 16]).is_ok());
        }
        for i in 0..=255u8 {
            assert!(cache.check_or_insert(&[i; 16]).is_err());
        }
    }
}
