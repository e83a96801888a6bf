//! Completion dispatch: getting filled slots to the consumer and back to the
//! driver
//!
//! Two variants share one contract: every filled slot is delivered exactly
//! once and then returned to the driver, and no slot is ever exposed while
//! the driver owns it.
//!
//! * [`PushDispatcher`]: the driver reports completed work-items; each one is
//!   delivered to the registered handler inline and resubmitted right after.
//! * [`PullDispatcher`]: the consumer asks for the next frame; the slot it got
//!   last time is only resubmitted on the following call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::utils::CachePadded;
use tracing::trace;

use crate::capture::frame::FrameDescriptor;
use crate::error::Result;

/// Consumer hook. Runs inline with delivery and must not block.
pub type FrameHandler = Box<dyn FnMut(&FrameDescriptor<'_>) + Send>;

/// Delivery counters, readable from any thread. Each counter sits on its
/// own cache line.
#[derive(Debug, Default)]
pub struct CaptureStats {
    delivered: CachePadded<AtomicU64>,
    dropped: CachePadded<AtomicU64>,
    cancelled: CachePadded<AtomicU64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Frames handed to a consumer.
    pub delivered: u64,
    /// Frames completed while no handler was registered.
    pub dropped: u64,
    /// Work-items discarded because the stream was stopping.
    pub cancelled: u64,
}

impl CaptureStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camloop_frames_delivered").increment(1);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camloop_frames_dropped").increment(1);
    }

    pub(crate) fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camloop_frames_cancelled").increment(1);
    }
}

/// A work-item the driver has finished with.
pub trait CompletedWork {
    fn is_cancelled(&self) -> bool;

    /// Visit every filled slot carried by this work-item.
    fn for_each_frame(&self, visit: &mut dyn FnMut(&FrameDescriptor<'_>));
}

/// Hands a work-item back to the driver with the same slots attached.
pub trait Resubmit<W> {
    fn resubmit(&mut self, work: W) -> Result<()>;
}

/// What became of a completed work-item.
#[derive(Debug)]
pub enum Disposition<W> {
    Resubmitted,
    /// Cancelled and not resubmitted; the caller decides whether to park it.
    Discarded(W),
}

/// Push-model dispatcher
pub struct PushDispatcher {
    handler: Option<FrameHandler>,
    stats: Arc<CaptureStats>,
}

impl Default for PushDispatcher {
    fn default() -> Self {
        Self::new(Arc::new(CaptureStats::default()))
    }
}

impl PushDispatcher {
    pub fn new(stats: Arc<CaptureStats>) -> Self {
        Self {
            handler: None,
            stats,
        }
    }

    pub fn on_frame(&mut self, handler: FrameHandler) {
        self.handler = Some(handler);
    }

    pub fn stats(&self) -> &Arc<CaptureStats> {
        &self.stats
    }

    /// Deliver one completed work-item, then resubmit it.
    ///
    /// Cancelled work gets no callback and is not resubmitted; it is handed
    /// back as [`Disposition::Discarded`]. Without a handler the frames are
    /// counted as dropped and the work-item still goes back to the driver.
    pub fn complete<W, R>(&mut self, work: W, sink: &mut R) -> Result<Disposition<W>>
    where
        W: CompletedWork,
        R: Resubmit<W>,
    {
        if work.is_cancelled() {
            trace!("discarding cancelled work-item");
            self.stats.record_cancelled();
            return Ok(Disposition::Discarded(work));
        }

        let stats = &self.stats;
        match self.handler.as_mut() {
            Some(handler) => work.for_each_frame(&mut |frame: &FrameDescriptor<'_>| {
                handler(frame);
                stats.record_delivered();
            }),
            None => work.for_each_frame(&mut |_: &FrameDescriptor<'_>| stats.record_dropped()),
        }

        sink.resubmit(work)?;
        Ok(Disposition::Resubmitted)
    }
}

/// Work-items currently held by the session rather than the driver.
///
/// The pool remembers how many items it was built with, so an item the
/// driver consumed on a failed submission shows up as a shortfall.
#[derive(Debug)]
pub struct WorkPool<W> {
    idle: Vec<W>,
    total: usize,
}

impl<W> WorkPool<W> {
    pub fn new(items: Vec<W>) -> Self {
        Self {
            total: items.len(),
            idle: items,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Items the session holds right now.
    pub fn idle(&self) -> usize {
        self.idle.len()
    }

    /// Take back an item the driver returned.
    pub fn park(&mut self, work: W) {
        self.idle.push(work);
    }

    /// True when every item is back in the pool.
    pub fn is_complete(&self) -> bool {
        self.idle.len() == self.total
    }

    /// Hand every idle item to `sink`, stopping at the first failure. Items
    /// not reached yet stay in the pool; the one that failed does not.
    pub fn submit_all<R: Resubmit<W>>(&mut self, sink: &mut R) -> Result<usize> {
        let mut submitted = 0;
        while let Some(work) = self.idle.pop() {
            sink.resubmit(work)?;
            submitted += 1;
        }
        Ok(submitted)
    }
}

/// A slot the device has filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dequeued {
    pub index: u32,
    pub bytes_used: usize,
    pub sequence: u64,
    pub timestamp: Option<Duration>,
}

/// Device queue as seen by the pull dispatcher.
pub trait SlotQueue {
    /// Give `index` to the driver.
    fn submit(&mut self, index: u32) -> Result<()>;

    /// Block until the driver returns a filled slot.
    fn reap(&mut self) -> Result<Dequeued>;
}

/// Pull-model dispatcher
#[derive(Debug, Default)]
pub struct PullDispatcher {
    primed: bool,
    held: Option<u32>,
}

impl PullDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot currently exposed to the consumer, if any.
    pub fn held(&self) -> Option<u32> {
        self.held
    }

    /// Forget all queue state; the next call primes the queue again.
    pub fn reset(&mut self) {
        self.primed = false;
        self.held = None;
    }

    /// Fetch the next filled slot.
    ///
    /// The first call submits all `slot_count` slots. Every later call first
    /// resubmits the slot returned by the previous one, so that slot stays
    /// readable by the consumer until now.
    pub fn next<Q: SlotQueue>(&mut self, queue: &mut Q, slot_count: u32) -> Result<Dequeued> {
        if !self.primed {
            for index in 0..slot_count {
                queue.submit(index)?;
            }
            self.primed = true;
        } else if let Some(previous) = self.held.take() {
            queue.submit(previous)?;
        }

        let filled = queue.reap()?;
        self.held = Some(filled.index);
        Ok(filled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CaptureError;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Work {
        cancelled: bool,
        payload: Vec<u8>,
    }

    impl CompletedWork for Work {
        fn is_cancelled(&self) -> bool {
            self.cancelled
        }

        fn for_each_frame(&self, visit: &mut dyn FnMut(&FrameDescriptor<'_>)) {
            visit(&FrameDescriptor {
                width: 2,
                height: 2,
                data: &self.payload,
                sequence: 0,
                slot: 0,
                device_timestamp: None,
            });
        }
    }

    #[derive(Default)]
    struct Sink {
        resubmitted: usize,
    }

    impl Resubmit<Work> for Sink {
        fn resubmit(&mut self, _work: Work) -> Result<()> {
            self.resubmitted += 1;
            Ok(())
        }
    }

    fn work(cancelled: bool) -> Work {
        Work {
            cancelled,
            payload: vec![1, 2, 3],
        }
    }

    #[test]
    fn counters_do_not_share_cache_lines() {
        let stats = CaptureStats::default();
        let addr = |counter: &CachePadded<AtomicU64>| counter as *const _ as usize;
        let (a, b, c) = (addr(&stats.delivered), addr(&stats.dropped), addr(&stats.cancelled));

        assert!(a.abs_diff(b) >= 64);
        assert!(b.abs_diff(c) >= 64);
        assert!(a.abs_diff(c) >= 64);

        stats.record_dropped();
        stats.record_dropped();
        stats.record_cancelled();
        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                delivered: 0,
                dropped: 2,
                cancelled: 1
            }
        );
    }

    #[test]
    fn push_delivers_then_resubmits() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_handler = seen.clone();
        let mut dispatcher = PushDispatcher::default();
        dispatcher.on_frame(Box::new(move |frame: &FrameDescriptor<'_>| {
            seen_in_handler.lock().unwrap().push(frame.len());
        }));

        let mut sink = Sink::default();
        let outcome = dispatcher.complete(work(false), &mut sink).unwrap();

        assert!(matches!(outcome, Disposition::Resubmitted));
        assert_eq!(*seen.lock().unwrap(), vec![3]);
        assert_eq!(sink.resubmitted, 1);
        assert_eq!(dispatcher.stats().snapshot().delivered, 1);
    }

    #[test]
    fn push_drops_cancelled_work_silently() {
        let calls = Arc::new(Mutex::new(0));
        let calls_in_handler = calls.clone();
        let mut dispatcher = PushDispatcher::default();
        dispatcher.on_frame(Box::new(move |_: &FrameDescriptor<'_>| {
            *calls_in_handler.lock().unwrap() += 1
        }));

        let mut sink = Sink::default();
        let outcome = dispatcher.complete(work(true), &mut sink).unwrap();

        assert!(matches!(outcome, Disposition::Discarded(w) if w.cancelled));
        assert_eq!(*calls.lock().unwrap(), 0);
        assert_eq!(sink.resubmitted, 0);
        assert_eq!(dispatcher.stats().snapshot().cancelled, 1);
    }

    #[test]
    fn push_without_handler_still_resubmits() {
        let mut dispatcher = PushDispatcher::default();
        let mut sink = Sink::default();

        dispatcher.complete(work(false), &mut sink).unwrap();
        dispatcher.complete(work(false), &mut sink).unwrap();

        assert_eq!(sink.resubmitted, 2);
        let stats = dispatcher.stats().snapshot();
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.delivered, 0);
    }

    #[test]
    fn work_pool_submits_everything_and_takes_it_back() {
        let mut pool = WorkPool::new(vec![work(false), work(false), work(false)]);
        assert!(pool.is_complete());

        let mut sink = Sink::default();
        assert_eq!(pool.submit_all(&mut sink).unwrap(), 3);
        assert_eq!(pool.idle(), 0);
        assert!(!pool.is_complete());

        for _ in 0..3 {
            pool.park(work(true));
        }
        assert!(pool.is_complete());
        assert_eq!(pool.total(), 3);
    }

    struct Refusing;

    impl Resubmit<Work> for Refusing {
        fn resubmit(&mut self, _work: Work) -> Result<()> {
            Err(CaptureError::StreamStart("refused".into()))
        }
    }

    #[test]
    fn work_pool_loses_the_item_that_failed() {
        let mut pool = WorkPool::new(vec![work(false), work(false)]);

        let err = pool.submit_all(&mut Refusing).unwrap_err();

        assert!(matches!(err, CaptureError::StreamStart(_)));
        assert_eq!(pool.idle(), 1);
        assert!(!pool.is_complete());
    }

    #[derive(Default)]
    struct Queue {
        pending: VecDeque<u32>,
        log: Vec<String>,
        fail_reap: bool,
    }

    impl SlotQueue for Queue {
        fn submit(&mut self, index: u32) -> Result<()> {
            self.log.push(format!("q{}", index));
            self.pending.push_back(index);
            Ok(())
        }

        fn reap(&mut self) -> Result<Dequeued> {
            if self.fail_reap {
                return Err(CaptureError::fatal(
                    "dequeue",
                    std::io::Error::from_raw_os_error(libc::EIO),
                ));
            }
            let index = self.pending.pop_front().expect("reap on empty queue");
            self.log.push(format!("dq{}", index));
            Ok(Dequeued {
                index,
                bytes_used: 10,
                sequence: 0,
                timestamp: None,
            })
        }
    }

    #[test]
    fn pull_defers_resubmission_by_one_cycle() {
        let mut queue = Queue::default();
        let mut pull = PullDispatcher::new();

        assert_eq!(pull.next(&mut queue, 3).unwrap().index, 0);
        assert_eq!(pull.held(), Some(0));
        assert_eq!(pull.next(&mut queue, 3).unwrap().index, 1);
        assert_eq!(pull.next(&mut queue, 3).unwrap().index, 2);

        assert_eq!(
            queue.log,
            ["q0", "q1", "q2", "dq0", "q0", "dq1", "q1", "dq2"]
        );
    }

    #[test]
    fn pull_reset_primes_again() {
        let mut queue = Queue::default();
        let mut pull = PullDispatcher::new();
        pull.next(&mut queue, 2).unwrap();

        pull.reset();
        queue.pending.clear();
        queue.log.clear();
        pull.next(&mut queue, 2).unwrap();

        assert_eq!(queue.log, ["q0", "q1", "dq0"]);
    }

    #[test]
    fn pull_failure_propagates() {
        let mut queue = Queue {
            fail_reap: true,
            ..Default::default()
        };
        let mut pull = PullDispatcher::new();
        assert!(pull.next(&mut queue, 2).unwrap_err().is_fatal());
        assert_eq!(pull.held(), None);
    }
}
