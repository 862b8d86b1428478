use std::collections::VecDeque;

/// Free-list cap for recycled listener ids.
pub const LISTENER_ID_POOL_CAP: usize = 1000;

/// Hands out non-negative integer ids and recycles released ones.
///
/// At most `cap` released ids are remembered; anything released beyond that
/// is forgotten and the counter keeps growing.
#[derive(Debug, Clone)]
pub struct IdPool {
    free: VecDeque<u64>,
    next: u64,
    cap: usize,
}

impl Default for IdPool {
    fn default() -> Self {
        IdPool::new(LISTENER_ID_POOL_CAP)
    }
}

impl IdPool {
    pub fn new(cap: usize) -> Self {
        IdPool {
            free: VecDeque::new(),
            next: 0,
            cap,
        }
    }

    /// Next id, taken from the free list first when `reuse` is set.
    pub fn next_id(&mut self, reuse: bool) -> u64 {
        if reuse {
            if let Some(id) = self.free.pop_front() {
                return id;
            }
        }
        let id = self.next;
        self.next += 1;
        id
    }

    pub fn release(&mut self, id: u64) {
        if self.free.len() < self.cap && !self.free.contains(&id) {
            self.free.push_back(id);
        }
    }

    /// Release a row id. Only canonical integer strings ("0", "17", not "007")
    /// ever came from this pool, so anything else is ignored.
    pub fn release_str(&mut self, id: &str) {
        if let Ok(parsed) = id.parse::<u64>() {
            if parsed.to_string() == id {
                self.release(parsed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_sequential() {
        let mut pool = IdPool::default();
        assert_eq!(pool.next_id(true), 0);
        assert_eq!(pool.next_id(true), 1);
        assert_eq!(pool.next_id(false), 2);
    }

    #[test]
    fn test_released_ids_are_reused_in_order() {
        let mut pool = IdPool::default();
        for _ in 0..4 {
            pool.next_id(true);
        }
        pool.release(2);
        pool.release(0);
        pool.release(2);

        assert_eq!(pool.next_id(false), 4);
        assert_eq!(pool.next_id(true), 2);
        assert_eq!(pool.next_id(true), 0);
        assert_eq!(pool.next_id(true), 5);
    }

    #[test]
    fn test_free_list_is_capped() {
        let mut pool = IdPool::new(1);
        pool.next_id(true);
        pool.next_id(true);
        pool.release(0);
        pool.release(1);

        assert_eq!(pool.next_id(true), 0);
        assert_eq!(pool.next_id(true), 2);
    }

    #[test]
    fn test_release_str_ignores_non_canonical_ids() {
        let mut pool = IdPool::default();
        pool.release_str("fido");
        pool.release_str("07");
        pool.release_str("-1");
        assert_eq!(pool.next_id(true), 0);

        pool.release_str("0");
        assert_eq!(pool.next_id(true), 0);
    }
}
