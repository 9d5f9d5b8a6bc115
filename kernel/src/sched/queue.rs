//! Run queue.
//!
//! A fixed-capacity FIFO ring of runnable threads. Priorities are a
//! reserved extension point; the current discipline is flat round-robin,
//! so a single queue suffices. The running thread is never in the queue.

use alloc::sync::Arc;

use crate::sched::{Pid, Thread, MAX_PROCESSES, MAX_THREADS};

/// Upper bound on runnable threads: every thread of every process.
pub const RUN_QUEUE_CAPACITY: usize = MAX_PROCESSES * MAX_THREADS;

/// FIFO of threads eligible to run on the next scheduling decision.
pub struct RunQueue {
    slots: [Option<Arc<Thread>>; RUN_QUEUE_CAPACITY],
    head: usize,
    count: usize,
}

impl RunQueue {
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; RUN_QUEUE_CAPACITY],
            head: 0,
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Append a thread at the tail. The capacity covers every thread the
    /// process table can hold, so overflow is a bookkeeping bug.
    pub fn push_back(&mut self, thread: Arc<Thread>) {
        if self.count == RUN_QUEUE_CAPACITY {
            panic!("run queue overflow");
        }
        let tail = (self.head + self.count) % RUN_QUEUE_CAPACITY;
        self.slots[tail] = Some(thread);
        self.count += 1;
    }

    /// Remove and return the head thread.
    pub fn pop_front(&mut self) -> Option<Arc<Thread>> {
        if self.count == 0 {
            return None;
        }
        let thread = self.slots[self.head].take();
        self.head = (self.head + 1) % RUN_QUEUE_CAPACITY;
        self.count -= 1;
        thread
    }

    /// True when `thread` (by identity) is queued.
    pub fn contains(&self, thread: &Arc<Thread>) -> bool {
        self.iter().any(|t| Arc::ptr_eq(t, thread))
    }

    /// Drop every queued thread belonging to `pid`. Returns how many
    /// were removed.
    pub fn remove_process(&mut self, pid: Pid) -> usize {
        let mut kept = [const { None }; RUN_QUEUE_CAPACITY];
        let mut kept_count = 0;
        let mut removed = 0;

        for i in 0..self.count {
            let slot = self.slots[(self.head + i) % RUN_QUEUE_CAPACITY].take();
            match slot {
                Some(t) if t.pid == pid => removed += 1,
                Some(t) => {
                    kept[kept_count] = Some(t);
                    kept_count += 1;
                }
                None => {}
            }
        }

        self.slots = kept;
        self.head = 0;
        self.count = kept_count;
        removed
    }

    fn iter(&self) -> impl Iterator<Item = &Arc<Thread>> {
        (0..self.count).filter_map(move |i| self.slots[(self.head + i) % RUN_QUEUE_CAPACITY].as_ref())
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mm::VirtAddr,
        sched::{Priority, Tid},
    };

    fn thread(pid: u32, tid: u32) -> Arc<Thread> {
        Arc::new(Thread::new(
            Tid(tid),
            Pid(pid),
            Priority::Normal,
            VirtAddr::new(0xBFFF_C000),
            None,
            0x2000,
            crate::mm::PhysAddr::new(0),
        ))
    }

    #[test]
    fn fifo_order_is_preserved() {
        let mut q = RunQueue::new();
        let (a, b, c) = (thread(1, 1), thread(1, 2), thread(1, 3));
        q.push_back(a.clone());
        q.push_back(b.clone());
        q.push_back(c.clone());

        assert!(Arc::ptr_eq(&q.pop_front().unwrap(), &a));
        q.push_back(a.clone());
        assert!(Arc::ptr_eq(&q.pop_front().unwrap(), &b));
        assert!(Arc::ptr_eq(&q.pop_front().unwrap(), &c));
        assert!(Arc::ptr_eq(&q.pop_front().unwrap(), &a));
        assert!(q.pop_front().is_none());
    }

    #[test]
    fn remove_process_filters_only_that_pid() {
        let mut q = RunQueue::new();
        let keep = thread(1, 1);
        q.push_back(thread(2, 1));
        q.push_back(keep.clone());
        q.push_back(thread(2, 2));

        assert_eq!(q.remove_process(Pid(2)), 2);
        assert_eq!(q.len(), 1);
        assert!(q.contains(&keep));
    }

    #[test]
    fn wraparound_keeps_contents_consistent() {
        let mut q = RunQueue::new();
        for round in 0..5 {
            for i in 0..100 {
                q.push_back(thread(1, round * 100 + i));
            }
            for _ in 0..100 {
                assert!(q.pop_front().is_some());
            }
        }
        assert!(q.is_empty());
    }
}
