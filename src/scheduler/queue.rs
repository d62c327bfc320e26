//! Thread-safe waiting queue.
//!
//! Any number of client threads push; the scheduling thread is the only
//! consumer. Entries keep their arrival number so a request taken out for an
//! admission attempt and put back returns to its original place.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::config::AdmissionOrder;
use crate::core::request::{Request, RequestId};
use crate::scheduler::policy::next_candidate;

#[derive(Debug)]
struct Entry {
    arrival: u64,
    request: Request,
}

#[derive(Debug, Default)]
struct Inner {
    entries: VecDeque<Entry>,
    next_arrival: u64,
    /// Set to wake the consumer without new work.
    woken: bool,
}

/// Requests waiting for admission, in arrival order.
#[derive(Debug, Default)]
pub struct WaitingQueue {
    inner: Mutex<Inner>,
    condvar: Condvar,
}

impl WaitingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request and wake the consumer.
    pub fn push(&self, mut request: Request) {
        let mut inner = self.inner.lock();
        let arrival = inner.next_arrival;
        inner.next_arrival += 1;
        request.set_arrival(arrival);
        inner.entries.push_back(Entry { arrival, request });
        self.condvar.notify_all();
    }

    /// Remove a request by id.
    pub fn remove(&self, id: RequestId) -> Option<Request> {
        let mut inner = self.inner.lock();
        let index = inner.entries.iter().position(|e| e.request.id() == id)?;
        inner.entries.remove(index).map(|e| e.request)
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.inner.lock().entries.iter().any(|e| e.request.id() == id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Take the next request to consider for admission.
    ///
    /// Returns the request with its arrival number, needed to
    /// [`restore`](Self::restore) it.
    pub fn pop_next(&self, order: AdmissionOrder) -> Option<(u64, Request)> {
        let mut inner = self.inner.lock();
        let index = next_candidate(
            order,
            inner.entries.iter().map(|e| (e.request.priority(), e.arrival)),
        )?;
        inner
            .entries
            .remove(index)
            .map(|e| (e.arrival, e.request))
    }

    /// Put back a request taken with [`pop_next`](Self::pop_next).
    pub fn restore(&self, arrival: u64, request: Request) {
        let mut inner = self.inner.lock();
        let index = inner.entries.partition_point(|e| e.arrival < arrival);
        inner.entries.insert(index, Entry { arrival, request });
    }

    /// Return a preempted request to its original place in arrival order.
    pub fn requeue(&self, request: Request) {
        self.restore(request.arrival(), request);
    }

    /// Remove every request, in arrival order.
    pub fn drain(&self) -> Vec<Request> {
        self.inner.lock().entries.drain(..).map(|e| e.request).collect()
    }

    /// Block until the queue is non-empty, [`wake`](Self::wake) is called or
    /// `timeout` passes. Returns whether work is queued.
    pub fn wait_for_work(&self, timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        if inner.entries.is_empty() && !inner.woken {
            self.condvar.wait_for(&mut inner, timeout);
        }
        inner.woken = false;
        !inner.entries.is_empty()
    }

    /// Wake a consumer blocked in [`wait_for_work`](Self::wait_for_work).
    pub fn wake(&self) {
        self.inner.lock().woken = true;
        self.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::{CacheConfig, SamplingConfig};
    use crate::core::block_manager::BlockManager;

    fn manager() -> Arc<BlockManager> {
        let cache = CacheConfig {
            num_device_blocks: 4,
            num_host_blocks: 4,
            ..CacheConfig::default()
        };
        Arc::new(BlockManager::new(&cache, 1).unwrap())
    }

    fn request(id: RequestId, priority: i32, manager: &Arc<BlockManager>) -> Request {
        Request::new(id, vec![1, 2, 3], SamplingConfig::default(), Arc::clone(manager))
            .with_priority(priority)
    }

    #[test]
    fn test_fcfs_and_restore() {
        let m = manager();
        let queue = WaitingQueue::new();
        queue.push(request(1, 0, &m));
        queue.push(request(2, 5, &m));

        let (arrival, first) = queue.pop_next(AdmissionOrder::FirstComeFirstServed).unwrap();
        assert_eq!(first.id(), 1);
        queue.restore(arrival, first);

        let ids: Vec<_> = queue.drain().iter().map(Request::id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_requeue_keeps_arrival_order() {
        let m = manager();
        let queue = WaitingQueue::new();
        queue.push(request(1, 0, &m));
        queue.push(request(2, 0, &m));
        let (_, first) = queue.pop_next(AdmissionOrder::FirstComeFirstServed).unwrap();
        queue.push(request(3, 0, &m));

        queue.requeue(first);
        let ids: Vec<_> = queue.drain().iter().map(Request::id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_priority_order() {
        let m = manager();
        let queue = WaitingQueue::new();
        queue.push(request(1, 0, &m));
        queue.push(request(2, 5, &m));
        queue.push(request(3, 5, &m));

        let (_, first) = queue.pop_next(AdmissionOrder::Priority).unwrap();
        assert_eq!(first.id(), 2);
        let (_, second) = queue.pop_next(AdmissionOrder::Priority).unwrap();
        assert_eq!(second.id(), 3);
    }

    #[test]
    fn test_remove() {
        let m = manager();
        let queue = WaitingQueue::new();
        queue.push(request(7, 0, &m));
        assert!(queue.contains(7));
        assert_eq!(queue.remove(7).map(|r| r.id()), Some(7));
        assert!(queue.remove(7).is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_wake_returns_without_work() {
        let queue = WaitingQueue::new();
        queue.wake();
        assert!(!queue.wait_for_work(Duration::from_secs(5)));
    }
}
