//! Long-term logical locks on rows, as opposed to the short-term page
//! latches owned by the buffer pool.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::{Condvar, Mutex};

use crate::{RecordId, TxnId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug)]
pub enum LockError {
    Deadlock,
}

/// A request for a lock by a transaction.
#[derive(Debug, Clone)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    granted: bool,
}

/// FIFO queue of lock requests for one record.
#[derive(Debug, Default)]
struct LockRequestQueue {
    requests: VecDeque<LockRequest>,
    shared_granted: usize,
    exclusive_granted: bool,
}

impl LockRequestQueue {
    fn recount(&mut self) {
        self.shared_granted = self
            .requests
            .iter()
            .filter(|r| r.granted && r.mode == LockMode::Shared)
            .count();
        self.exclusive_granted = self
            .requests
            .iter()
            .any(|r| r.granted && r.mode == LockMode::Exclusive);
    }
}

/// The lock manager: shared/exclusive row locks with FIFO queuing and
/// waits-for deadlock detection. On a detected cycle the requesting
/// transaction is the victim and receives `LockError::Deadlock`.
#[derive(Debug, Default)]
pub struct LockManager {
    lock_table: Mutex<HashMap<RecordId, LockRequestQueue>>,
    cvar: Condvar,
    /// Maps a waiting transaction to the transactions it waits for.
    waits_for: Mutex<HashMap<TxnId, HashSet<TxnId>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_shared(&self, txn_id: TxnId, rid: RecordId) -> Result<(), LockError> {
        self.lock(txn_id, rid, LockMode::Shared)
    }

    pub fn lock_exclusive(&self, txn_id: TxnId, rid: RecordId) -> Result<(), LockError> {
        self.lock(txn_id, rid, LockMode::Exclusive)
    }

    fn lock(&self, txn_id: TxnId, rid: RecordId, mode: LockMode) -> Result<(), LockError> {
        let mut lock_table = self.lock_table.lock();

        if let Some(queue) = lock_table.get_mut(&rid) {
            if let Some(held) = queue
                .requests
                .iter()
                .find(|r| r.txn_id == txn_id && r.granted)
            {
                if held.mode == LockMode::Exclusive || held.mode == mode {
                    return Ok(());
                }
                // Shared held, exclusive wanted: drop the shared grant and
                // queue the upgrade like a fresh request.
                queue.requests.retain(|r| r.txn_id != txn_id);
                queue.recount();
            }
        }

        let queue = lock_table.entry(rid).or_default();
        queue.requests.push_back(LockRequest {
            txn_id,
            mode,
            granted: false,
        });

        loop {
            Self::try_grant(rid, &mut lock_table);

            let granted = lock_table
                .get(&rid)
                .and_then(|q| q.requests.iter().find(|r| r.txn_id == txn_id))
                .is_some_and(|r| r.granted);
            if granted {
                self.remove_from_waits_for(txn_id);
                return Ok(());
            }

            self.update_waits_for(txn_id, &lock_table);
            if self.detect_deadlock(txn_id) {
                let queue = lock_table.get_mut(&rid).unwrap();
                queue.requests.retain(|r| r.txn_id != txn_id);
                queue.recount();
                if queue.requests.is_empty() {
                    lock_table.remove(&rid);
                }
                self.remove_from_waits_for(txn_id);
                self.cvar.notify_all();
                return Err(LockError::Deadlock);
            }

            self.cvar.wait(&mut lock_table);
        }
    }

    /// Releases every lock `txn_id` holds or waits for and wakes blocked
    /// requesters.
    pub fn unlock_all(&self, txn_id: TxnId) {
        let mut lock_table = self.lock_table.lock();
        let mut affected = Vec::new();

        lock_table.retain(|rid, queue| {
            let before = queue.requests.len();
            queue.requests.retain(|r| r.txn_id != txn_id);
            if queue.requests.len() < before {
                affected.push(*rid);
            }
            !queue.requests.is_empty()
        });

        self.remove_from_waits_for(txn_id);

        for rid in affected {
            if let Some(queue) = lock_table.get_mut(&rid) {
                queue.recount();
            }
            Self::try_grant(rid, &mut lock_table);
        }

        self.cvar.notify_all();
    }

    fn try_grant(rid: RecordId, lock_table: &mut HashMap<RecordId, LockRequestQueue>) {
        let Some(queue) = lock_table.get_mut(&rid) else {
            return;
        };
        for req in queue.requests.iter_mut() {
            if req.granted {
                continue;
            }
            let compatible = match req.mode {
                LockMode::Shared => !queue.exclusive_granted,
                LockMode::Exclusive => queue.shared_granted == 0 && !queue.exclusive_granted,
            };
            if !compatible {
                // The first incompatible request blocks the rest: FIFO order.
                break;
            }
            req.granted = true;
            match req.mode {
                LockMode::Shared => queue.shared_granted += 1,
                LockMode::Exclusive => queue.exclusive_granted = true,
            }
        }
    }

    fn update_waits_for(
        &self,
        waiter: TxnId,
        lock_table: &HashMap<RecordId, LockRequestQueue>,
    ) {
        let mut waits_for = self.waits_for.lock();
        let edges = waits_for.entry(waiter).or_default();
        edges.clear();

        for queue in lock_table.values() {
            let Some(wait_req) = queue
                .requests
                .iter()
                .find(|r| r.txn_id == waiter && !r.granted)
            else {
                continue;
            };
            for holder in queue.requests.iter().filter(|r| r.granted) {
                let compatible = wait_req.mode == LockMode::Shared
                    && holder.mode == LockMode::Shared;
                if !compatible && holder.txn_id != waiter {
                    edges.insert(holder.txn_id);
                }
            }
        }
    }

    fn remove_from_waits_for(&self, txn_id: TxnId) {
        let mut waits_for = self.waits_for.lock();
        waits_for.remove(&txn_id);
        for edges in waits_for.values_mut() {
            edges.remove(&txn_id);
        }
    }

    fn detect_deadlock(&self, start: TxnId) -> bool {
        let waits_for = self.waits_for.lock();
        let mut visited = HashSet::new();
        let mut path = HashSet::new();
        Self::dfs(start, &waits_for, &mut visited, &mut path)
    }

    fn dfs(
        current: TxnId,
        waits_for: &HashMap<TxnId, HashSet<TxnId>>,
        visited: &mut HashSet<TxnId>,
        path: &mut HashSet<TxnId>,
    ) -> bool {
        visited.insert(current);
        path.insert(current);
        if let Some(edges) = waits_for.get(&current) {
            for &next in edges {
                if path.contains(&next) {
                    return true;
                }
                if !visited.contains(&next) && Self::dfs(next, waits_for, visited, path) {
                    return true;
                }
            }
        }
        path.remove(&current);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn shared_locks_coexist() {
        let lm = LockManager::new();
        let rid = RecordId::new(1, 0);
        lm.lock_shared(1, rid).unwrap();
        lm.lock_shared(2, rid).unwrap();
        lm.unlock_all(1);
        lm.unlock_all(2);
    }

    #[test]
    fn relocking_is_reentrant() {
        let lm = LockManager::new();
        let rid = RecordId::new(1, 0);
        lm.lock_exclusive(1, rid).unwrap();
        lm.lock_exclusive(1, rid).unwrap();
        lm.lock_shared(1, rid).unwrap();
        lm.unlock_all(1);
    }

    #[test]
    fn exclusive_blocks_until_release() {
        let lm = Arc::new(LockManager::new());
        let rid = RecordId::new(3, 1);
        lm.lock_exclusive(1, rid).unwrap();

        let lm2 = lm.clone();
        let handle = thread::spawn(move || {
            lm2.lock_exclusive(2, rid).unwrap();
            lm2.unlock_all(2);
        });

        thread::sleep(Duration::from_millis(50));
        lm.unlock_all(1);
        handle.join().unwrap();
    }

    #[test]
    fn crossing_waits_report_deadlock() {
        let lm = Arc::new(LockManager::new());
        let a = RecordId::new(1, 0);
        let b = RecordId::new(2, 0);

        lm.lock_exclusive(1, a).unwrap();
        lm.lock_exclusive(2, b).unwrap();

        let lm2 = lm.clone();
        let handle = thread::spawn(move || {
            // Blocks until txn 1 gives up a.
            let res = lm2.lock_exclusive(2, a);
            lm2.unlock_all(2);
            res
        });

        thread::sleep(Duration::from_millis(50));
        // Completes the cycle: 1 -> b -> 2 -> a -> 1. One side must lose.
        let res1 = lm.lock_exclusive(1, b);
        lm.unlock_all(1);
        let res2 = handle.join().unwrap();
        assert!(res1.is_err() || res2.is_err());
    }
}
