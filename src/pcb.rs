// Process control blocks. The pool owns every PCB; queues and the process
// tree are views made of index links, so a PCB can sit on the free list, on
// one queue and in the tree without anybody owning it twice.

use crate::devices::SemId;
use crate::processor::ProcessorState;

pub const MAXPROC: usize = 20;

pub type Pid = usize;

pub struct Pcb {
    pub state: ProcessorState,
    /// CPU time charged to this process, in microseconds.
    pub time: u64,
    /// TOD at the last dispatch; elapsed time is charged on every block.
    pub start_tod: u64,
    /// Semaphore this process is blocked on, if any.
    pub sem: Option<SemId>,
    /// Support-structure id consumed by pass-up, 1-based.
    pub support: Option<usize>,
    next: Option<Pid>,
    prev: Option<Pid>,
    parent: Option<Pid>,
    child: Option<Pid>,
    sib_left: Option<Pid>,
    sib_right: Option<Pid>,
    free: bool,
}

impl Pcb {
    fn blank() -> Self {
        Pcb {
            state: ProcessorState::new(),
            time: 0,
            start_tod: 0,
            sem: None,
            support: None,
            next: None,
            prev: None,
            parent: None,
            child: None,
            sib_left: None,
            sib_right: None,
            free: true,
        }
    }
}

pub struct PcbPool {
    slots: Vec<Pcb>,
    free_head: Option<Pid>,
}

impl PcbPool {
    pub fn new() -> Self {
        let mut pool = PcbPool {
            slots: (0..MAXPROC).map(|_| Pcb::blank()).collect(),
            free_head: None,
        };
        for p in (0..MAXPROC).rev() {
            pool.slots[p].next = pool.free_head;
            pool.free_head = Some(p);
        }
        pool
    }
    /// Pop a PCB off the free list with every field cleared, or None when
    /// the pool is exhausted.
    pub fn allocate(&mut self) -> Option<Pid> {
        let p = self.free_head?;
        self.free_head = self.slots[p].next;
        self.slots[p] = Pcb::blank();
        self.slots[p].free = false;
        Some(p)
    }
    pub fn release(&mut self, p: Pid) {
        self.slots[p].free = true;
        self.slots[p].next = self.free_head;
        self.free_head = Some(p);
    }
    pub fn pcb(&self, p: Pid) -> &Pcb {
        &self.slots[p]
    }
    pub fn pcb_mut(&mut self, p: Pid) -> &mut Pcb {
        &mut self.slots[p]
    }
    pub fn is_free(&self, p: Pid) -> bool {
        self.slots[p].free
    }
    pub fn free_count(&self) -> usize {
        self.slots.iter().filter(|pcb| pcb.free).count()
    }

    /// Prepend `p` to `parent`'s child list.
    pub fn insert_child(&mut self, parent: Pid, p: Pid) {
        let old = self.slots[parent].child;
        self.slots[p].parent = Some(parent);
        self.slots[p].sib_left = None;
        self.slots[p].sib_right = old;
        if let Some(old) = old {
            self.slots[old].sib_left = Some(p);
        }
        self.slots[parent].child = Some(p);
    }
    /// Detach and return the head of `parent`'s child list.
    pub fn remove_first_child(&mut self, parent: Pid) -> Option<Pid> {
        let c = self.slots[parent].child?;
        self.slots[parent].child = self.slots[c].sib_right;
        if let Some(next) = self.slots[c].sib_right {
            self.slots[next].sib_left = None;
        }
        self.slots[c].parent = None;
        self.slots[c].sib_left = None;
        self.slots[c].sib_right = None;
        Some(c)
    }
    /// Unlink `p` from its parent's child list, wherever it sits in it.
    pub fn detach(&mut self, p: Pid) -> Option<Pid> {
        let parent = self.slots[p].parent?;
        if self.slots[parent].child == Some(p) {
            return self.remove_first_child(parent);
        }
        let left = self.slots[p].sib_left;
        let right = self.slots[p].sib_right;
        if let Some(left) = left {
            self.slots[left].sib_right = right;
        }
        if let Some(right) = right {
            self.slots[right].sib_left = left;
        }
        self.slots[p].parent = None;
        self.slots[p].sib_left = None;
        self.slots[p].sib_right = None;
        Some(p)
    }
    pub fn first_child(&self, p: Pid) -> Option<Pid> {
        self.slots[p].child
    }
    pub fn parent_of(&self, p: Pid) -> Option<Pid> {
        self.slots[p].parent
    }
    pub fn children(&self, p: Pid) -> Vec<Pid> {
        let mut result = Vec::new();
        let mut cursor = self.slots[p].child;
        while let Some(c) = cursor {
            result.push(c);
            cursor = self.slots[c].sib_right;
        }
        result
    }
}

/// A circular doubly-linked FIFO identified by its tail; the tail's `next`
/// is the head. Insert-at-tail and remove-from-head are O(1).
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct ProcQueue {
    tail: Option<Pid>,
}

impl ProcQueue {
    pub fn new() -> Self {
        ProcQueue { tail: None }
    }
    pub fn is_empty(&self) -> bool {
        self.tail.is_none()
    }
    pub fn enqueue(&mut self, pool: &mut PcbPool, p: Pid) {
        match self.tail {
            None => {
                pool.slots[p].next = Some(p);
                pool.slots[p].prev = Some(p);
            }
            Some(tail) => {
                let head = pool.slots[tail].next.unwrap();
                pool.slots[tail].next = Some(p);
                pool.slots[p].prev = Some(tail);
                pool.slots[p].next = Some(head);
                pool.slots[head].prev = Some(p);
            }
        }
        self.tail = Some(p);
    }
    pub fn dequeue(&mut self, pool: &mut PcbPool) -> Option<Pid> {
        let tail = self.tail?;
        let head = pool.slots[tail].next.unwrap();
        if head == tail {
            self.tail = None;
        } else {
            let next = pool.slots[head].next.unwrap();
            pool.slots[tail].next = Some(next);
            pool.slots[next].prev = Some(tail);
        }
        pool.slots[head].next = None;
        pool.slots[head].prev = None;
        Some(head)
    }
    pub fn remove(&mut self, pool: &mut PcbPool, p: Pid) -> Option<Pid> {
        if !self.pids(pool).contains(&p) {
            return None;
        }
        let prev = pool.slots[p].prev.unwrap();
        let next = pool.slots[p].next.unwrap();
        if prev == p {
            self.tail = None;
        } else {
            pool.slots[prev].next = Some(next);
            pool.slots[next].prev = Some(prev);
            if self.tail == Some(p) {
                self.tail = Some(prev);
            }
        }
        pool.slots[p].next = None;
        pool.slots[p].prev = None;
        Some(p)
    }
    pub fn head(&self, pool: &PcbPool) -> Option<Pid> {
        self.tail.map(|tail| pool.slots[tail].next.unwrap())
    }
    /// Members head-first; also the membership test for audits.
    pub fn pids(&self, pool: &PcbPool) -> Vec<Pid> {
        let mut result = Vec::new();
        if let Some(tail) = self.tail {
            let head = pool.slots[tail].next.unwrap();
            let mut cursor = head;
            loop {
                result.push(cursor);
                if cursor == tail {
                    break;
                }
                cursor = pool.slots[cursor].next.unwrap();
            }
        }
        result
    }
    pub fn len(&self, pool: &PcbPool) -> usize {
        self.pids(pool).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhausts_and_recycles() {
        let mut pool = PcbPool::new();
        let mut all = Vec::new();
        for _ in 0..MAXPROC {
            all.push(pool.allocate().unwrap());
        }
        assert_eq!(pool.allocate(), None);
        pool.release(all[3]);
        let p = pool.allocate().unwrap();
        assert_eq!(p, all[3]);
        assert_eq!(pool.pcb(p).time, 0);
        assert_eq!(pool.pcb(p).sem, None);
    }

    #[test]
    fn queue_is_fifo() {
        let mut pool = PcbPool::new();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let c = pool.allocate().unwrap();
        let mut q = ProcQueue::new();
        assert!(q.is_empty());
        q.enqueue(&mut pool, a);
        q.enqueue(&mut pool, b);
        q.enqueue(&mut pool, c);
        assert_eq!(q.head(&pool), Some(a));
        assert_eq!(q.pids(&pool), vec![a, b, c]);
        assert_eq!(q.dequeue(&mut pool), Some(a));
        assert_eq!(q.dequeue(&mut pool), Some(b));
        assert_eq!(q.dequeue(&mut pool), Some(c));
        assert!(q.is_empty());
        assert_eq!(q.dequeue(&mut pool), None);
    }

    #[test]
    fn queue_removes_specific_members() {
        let mut pool = PcbPool::new();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let c = pool.allocate().unwrap();
        let d = pool.allocate().unwrap();
        let mut q = ProcQueue::new();
        for &p in &[a, b, c] {
            q.enqueue(&mut pool, p);
        }
        assert_eq!(q.remove(&mut pool, d), None);
        assert_eq!(q.remove(&mut pool, b), Some(b));
        assert_eq!(q.pids(&pool), vec![a, c]);
        assert_eq!(q.remove(&mut pool, c), Some(c));
        assert_eq!(q.pids(&pool), vec![a]);
        assert_eq!(q.remove(&mut pool, a), Some(a));
        assert!(q.is_empty());
    }

    #[test]
    fn tree_prepends_children_and_detaches() {
        let mut pool = PcbPool::new();
        let root = pool.allocate().unwrap();
        let x = pool.allocate().unwrap();
        let y = pool.allocate().unwrap();
        let z = pool.allocate().unwrap();
        pool.insert_child(root, x);
        pool.insert_child(root, y);
        pool.insert_child(root, z);
        assert_eq!(pool.children(root), vec![z, y, x]);
        assert_eq!(pool.parent_of(y), Some(root));
        pool.detach(y);
        assert_eq!(pool.children(root), vec![z, x]);
        assert_eq!(pool.parent_of(y), None);
        assert_eq!(pool.remove_first_child(root), Some(z));
        assert_eq!(pool.remove_first_child(root), Some(x));
        assert_eq!(pool.remove_first_child(root), None);
    }
}
