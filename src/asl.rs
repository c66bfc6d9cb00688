// The Active Semaphore List: a sorted map from semaphore id to the queue of
// processes blocked on it. A descriptor is on the list exactly as long as
// its queue is non-empty. Two sentinels bracket the list so insertion never
// has to treat the head or an empty list specially.

use crate::devices::SemId;
use crate::pcb::{PcbPool, Pid, ProcQueue, MAXPROC};

const LOWER: i64 = -1;
const UPPER: i64 = i64::MAX;

struct SemDesc {
    key: i64,
    queue: ProcQueue,
    next: Option<usize>,
}

pub struct Asl {
    descs: Vec<SemDesc>,
    free: Option<usize>,
}

impl Asl {
    pub fn new() -> Self {
        let mut descs = Vec::with_capacity(MAXPROC + 2);
        descs.push(SemDesc { key: LOWER, queue: ProcQueue::new(), next: Some(1) });
        descs.push(SemDesc { key: UPPER, queue: ProcQueue::new(), next: None });
        for _ in 0..MAXPROC {
            descs.push(SemDesc { key: LOWER, queue: ProcQueue::new(), next: None });
        }
        let mut free = None;
        for d in (2..MAXPROC + 2).rev() {
            descs[d].next = free;
            free = Some(d);
        }
        Asl { descs, free }
    }

    /// Last descriptor with a key strictly below `key`; thanks to the
    /// sentinels this always exists and always has a successor.
    fn find_prev(&self, key: i64) -> usize {
        let mut cursor = 0;
        loop {
            let next = self.descs[cursor].next.unwrap();
            if self.descs[next].key >= key {
                return cursor;
            }
            cursor = next;
        }
    }

    /// Block `p` on `sem`, allocating and splicing in a descriptor if the
    /// semaphore has no waiters yet. True means the descriptor pool was
    /// exhausted and nothing was changed.
    pub fn insert_blocked(&mut self, pool: &mut PcbPool, sem: SemId, p: Pid) -> bool {
        let key = sem as i64;
        let prev = self.find_prev(key);
        let mut desc = self.descs[prev].next.unwrap();
        if self.descs[desc].key != key {
            let fresh = match self.free {
                Some(fresh) => fresh,
                None => return true,
            };
            self.free = self.descs[fresh].next;
            self.descs[fresh].key = key;
            self.descs[fresh].queue = ProcQueue::new();
            self.descs[fresh].next = Some(desc);
            self.descs[prev].next = Some(fresh);
            desc = fresh;
        }
        self.descs[desc].queue.enqueue(pool, p);
        pool.pcb_mut(p).sem = Some(sem);
        false
    }

    /// Unblock and return the head waiter of `sem`, clearing its semaphore
    /// link. The descriptor is recycled once its queue drains.
    pub fn remove_blocked(&mut self, pool: &mut PcbPool, sem: SemId) -> Option<Pid> {
        let key = sem as i64;
        let prev = self.find_prev(key);
        let desc = self.descs[prev].next.unwrap();
        if self.descs[desc].key != key {
            return None;
        }
        let head = self.descs[desc].queue.dequeue(pool)?;
        pool.pcb_mut(head).sem = None;
        self.recycle_if_empty(prev, desc);
        Some(head)
    }

    /// Remove `p` from the queue of the semaphore it is blocked on. The
    /// semaphore link is deliberately left set; termination reads it.
    pub fn out_blocked(&mut self, pool: &mut PcbPool, p: Pid) -> Option<Pid> {
        let sem = pool.pcb(p).sem?;
        let key = sem as i64;
        let prev = self.find_prev(key);
        let desc = self.descs[prev].next.unwrap();
        if self.descs[desc].key != key {
            return None;
        }
        let removed = self.descs[desc].queue.remove(pool, p)?;
        self.recycle_if_empty(prev, desc);
        Some(removed)
    }

    pub fn head_blocked(&self, pool: &PcbPool, sem: SemId) -> Option<Pid> {
        let key = sem as i64;
        let prev = self.find_prev(key);
        let desc = self.descs[prev].next.unwrap();
        if self.descs[desc].key != key {
            return None;
        }
        self.descs[desc].queue.head(pool)
    }

    fn recycle_if_empty(&mut self, prev: usize, desc: usize) {
        if self.descs[desc].queue.is_empty() {
            self.descs[prev].next = self.descs[desc].next;
            self.descs[desc].next = self.free;
            self.free = Some(desc);
        }
    }

    /// Active semaphores in list order with their waiters, head first.
    pub fn entries(&self, pool: &PcbPool) -> Vec<(SemId, Vec<Pid>)> {
        let mut result = Vec::new();
        let mut cursor = self.descs[0].next;
        while let Some(d) = cursor {
            if self.descs[d].key == UPPER {
                break;
            }
            result.push((self.descs[d].key as SemId, self.descs[d].queue.pids(pool)));
            cursor = self.descs[d].next;
        }
        result
    }

    pub fn semaphores(&self) -> Vec<SemId> {
        let mut result = Vec::new();
        let mut cursor = self.descs[0].next;
        while let Some(d) = cursor {
            if self.descs[d].key == UPPER {
                break;
            }
            result.push(self.descs[d].key as SemId);
            cursor = self.descs[d].next;
        }
        result
    }
}

impl Default for Asl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_sorted_and_recycles_descriptors() {
        let mut pool = PcbPool::new();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let c = pool.allocate().unwrap();
        let mut asl = Asl::new();
        assert!(!asl.insert_blocked(&mut pool, 7, a));
        assert!(!asl.insert_blocked(&mut pool, 3, b));
        assert!(!asl.insert_blocked(&mut pool, 11, c));
        assert_eq!(asl.semaphores(), vec![3, 7, 11]);
        assert_eq!(asl.remove_blocked(&mut pool, 7), Some(a));
        assert_eq!(asl.semaphores(), vec![3, 11]);
        assert_eq!(pool.pcb(a).sem, None);
        assert_eq!(asl.remove_blocked(&mut pool, 7), None);
    }

    #[test]
    fn wait_queues_are_fifo() {
        let mut pool = PcbPool::new();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let mut asl = Asl::new();
        asl.insert_blocked(&mut pool, 5, a);
        asl.insert_blocked(&mut pool, 5, b);
        assert_eq!(asl.head_blocked(&pool, 5), Some(a));
        assert_eq!(asl.remove_blocked(&mut pool, 5), Some(a));
        assert_eq!(asl.remove_blocked(&mut pool, 5), Some(b));
        assert_eq!(asl.semaphores(), Vec::<SemId>::new());
    }

    #[test]
    fn out_blocked_keeps_the_semaphore_link() {
        let mut pool = PcbPool::new();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let mut asl = Asl::new();
        asl.insert_blocked(&mut pool, 9, a);
        asl.insert_blocked(&mut pool, 9, b);
        assert_eq!(asl.out_blocked(&mut pool, b), Some(b));
        assert_eq!(pool.pcb(b).sem, Some(9));
        assert_eq!(asl.entries(&pool), vec![(9, vec![a])]);
        assert_eq!(asl.out_blocked(&mut pool, b), None);
    }

    #[test]
    fn descriptor_pool_exhaustion_is_reported() {
        let mut pool = PcbPool::new();
        let mut asl = Asl::new();
        for sem in 0..MAXPROC {
            let p = pool.allocate().unwrap();
            assert!(!asl.insert_blocked(&mut pool, sem, p));
        }
        // Every descriptor is in use and the pool is empty; one more
        // distinct semaphore must fail without touching anything.
        assert!(asl.insert_blocked(&mut pool, MAXPROC, 0));
        assert_eq!(asl.semaphores().len(), MAXPROC);
    }
}
