use std::collections::HashMap;
use std::sync::Mutex;

use crate::hash::HASH_SIZE;

/// A mapping from 32-byte content hash to a boolean flag, guarded by a single
/// mutex. Used for the post-suppression caches and emitted-chain dedup: keys
/// are only ever written once (absent -> true), reads of absent keys return
/// false, and there is no eviction for the lifetime of the process.
#[derive(Default)]
pub struct LockedMap {
    inner: Mutex<HashMap<[u8; HASH_SIZE], bool>>,
}

impl LockedMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: [u8; HASH_SIZE]) -> bool {
        *self
            .inner
            .lock()
            .expect("locked map poisoned")
            .get(&key)
            .unwrap_or(&false)
    }

    pub fn set(&self, key: [u8; HASH_SIZE], value: bool) {
        self.inner
            .lock()
            .expect("locked map poisoned")
            .insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn absent_keys_read_false() {
        let m = LockedMap::new();
        assert!(!m.get([0u8; 32]));
    }

    #[test]
    fn set_then_get() {
        let m = LockedMap::new();
        let k = [7u8; 32];
        m.set(k, true);
        assert!(m.get(k));
        m.set(k, false);
        assert!(!m.get(k));
    }

    #[test]
    fn concurrent_writers_do_not_lose_updates() {
        let m = Arc::new(LockedMap::new());
        let mut handles = Vec::new();
        for i in 0..8u8 {
            let m = m.clone();
            handles.push(std::thread::spawn(move || {
                for j in 0..100u8 {
                    let mut k = [0u8; 32];
                    k[0] = i;
                    k[1] = j;
                    m.set(k, true);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        for i in 0..8u8 {
            for j in 0..100u8 {
                let mut k = [0u8; 32];
                k[0] = i;
                k[1] = j;
                assert!(m.get(k));
            }
        }
    }
}
