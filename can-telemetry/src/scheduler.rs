//! Timestamp-driven frame replay
//!
//! [`FrameScheduler`] delivers a predetermined set of frames to a
//! [`ListenerRegistry`] at the wall-clock times recorded in their timestamps,
//! simulating bus traffic without hardware.
//!
//! Scheduled frames live in a min-heap keyed by `(deadline, sequence)` and are
//! drained by one dedicated timer thread, so the number of OS timers does not
//! grow with the number of frames. Frames sharing a deadline are delivered in
//! the order they were scheduled.

use crate::listener::ListenerRegistry;
use crate::types::{now_seconds, Frame, Result, TelemetryError};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct Scheduled {
    deadline: Instant,
    seq: u64,
    frame: Frame,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

#[derive(Default)]
struct QueueState {
    queue: BinaryHeap<Reverse<Scheduled>>,
    next_seq: u64,
    stopped: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    wake: Condvar,
    registry: Arc<ListenerRegistry>,
    delivered: AtomicU64,
}

/// Replays frames into a listener registry at their recorded timestamps
pub struct FrameScheduler {
    shared: Arc<Shared>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl FrameScheduler {
    pub fn new(registry: Arc<ListenerRegistry>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                wake: Condvar::new(),
                registry,
                delivered: AtomicU64::new(0),
            }),
            driver: Mutex::new(None),
        }
    }

    /// Schedule every frame for delivery at its timestamp and return immediately
    ///
    /// Each frame is due after `max(0, frame.timestamp - now)` seconds, measured
    /// from this call. Returns the number of frames scheduled. Fails once the
    /// scheduler has been stopped, and rejects the whole batch with
    /// [`TelemetryError::InvalidFrame`] when a timestamp is not finite or lies
    /// beyond what the monotonic clock can represent.
    pub fn simulate(&self, frames: Vec<Frame>) -> Result<usize> {
        let now_wall = now_seconds();
        let now = Instant::now();
        let deadlines = frames
            .iter()
            .map(|frame| deadline_for(frame, now_wall, now))
            .collect::<Result<Vec<_>>>()?;

        let count = frames.len();
        {
            let mut state = self.shared.state.lock();
            if state.stopped {
                return Err(TelemetryError::InvalidState(
                    "frame scheduler has been stopped".to_string(),
                ));
            }

            for (frame, deadline) in frames.into_iter().zip(deadlines) {
                let seq = state.next_seq;
                state.next_seq += 1;
                state.queue.push(Reverse(Scheduled {
                    deadline,
                    seq,
                    frame,
                }));
            }
        }
        self.shared.wake.notify_all();
        self.ensure_driver()?;

        log::info!("Scheduled {} frame(s) for replay", count);
        Ok(count)
    }

    fn ensure_driver(&self) -> Result<()> {
        let mut driver = self.driver.lock();
        if driver.is_none() {
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name("frame-scheduler".to_string())
                .spawn(move || run_driver(shared))?;
            *driver = Some(handle);
        }
        Ok(())
    }

    /// Cancel every undelivered frame and stop the timer thread
    ///
    /// A delivery already handed to the registry may still complete. Safe to
    /// call repeatedly; returns the number of frames that were discarded.
    pub fn stop(&self) -> usize {
        let discarded = {
            let mut state = self.shared.state.lock();
            if state.stopped {
                return 0;
            }
            state.stopped = true;
            let discarded = state.queue.len();
            state.queue.clear();
            discarded
        };
        self.shared.wake.notify_all();

        if let Some(handle) = self.driver.lock().take() {
            // A listener stopping the scheduler runs on the driver thread itself
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                log::error!("Frame scheduler thread panicked");
            }
        }

        log::info!("Frame scheduler stopped ({} frame(s) discarded)", discarded);
        discarded
    }

    /// Frames scheduled but not yet delivered
    pub fn pending(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Frames delivered since creation
    pub fn delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::Relaxed)
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.state.lock().stopped
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Monotonic delivery time of `frame`, relative to the wall clock `now_wall`
fn deadline_for(frame: &Frame, now_wall: f64, now: Instant) -> Result<Instant> {
    let out_of_range = || {
        TelemetryError::InvalidFrame(format!(
            "frame 0x{:X} timestamp {} cannot be scheduled",
            frame.arbitration_id, frame.timestamp
        ))
    };
    if !frame.timestamp.is_finite() {
        return Err(out_of_range());
    }
    let delay = Duration::try_from_secs_f64((frame.timestamp - now_wall).max(0.0))
        .map_err(|_| out_of_range())?;
    now.checked_add(delay).ok_or_else(out_of_range)
}

fn run_driver(shared: Arc<Shared>) {
    log::debug!("Frame scheduler thread started");
    let mut state = shared.state.lock();

    loop {
        if state.stopped {
            break;
        }
        let next_deadline = state.queue.peek().map(|Reverse(next)| next.deadline);
        match next_deadline {
            None => shared.wake.wait(&mut state),
            Some(deadline) if deadline > Instant::now() => {
                shared.wake.wait_until(&mut state, deadline);
            }
            Some(_) => {
                if let Some(Reverse(item)) = state.queue.pop() {
                    MutexGuard::unlocked(&mut state, || {
                        log::trace!("Replaying frame 0x{:X}", item.frame.arbitration_id);
                        shared.registry.notify(&item.frame);
                        shared.delivered.fetch_add(1, Ordering::Relaxed);
                    });
                }
            }
        }
    }

    log::debug!("Frame scheduler thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::ListenerHandle;

    fn recording_registry() -> (Arc<ListenerRegistry>, Arc<Mutex<Vec<(Instant, u32)>>>) {
        let registry = Arc::new(ListenerRegistry::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        registry.add(ListenerHandle::from_fn(move |frame: &Frame| {
            sink.lock().push((Instant::now(), frame.arbitration_id));
        }));
        (registry, seen)
    }

    fn wait_for(seen: &Mutex<Vec<(Instant, u32)>>, count: usize, limit: Duration) {
        let start = Instant::now();
        while seen.lock().len() < count && start.elapsed() < limit {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_frames_delivered_at_deadlines_in_order() {
        let (registry, seen) = recording_registry();
        let scheduler = FrameScheduler::new(registry);

        let start = Instant::now();
        let now = now_seconds();
        // Given out of order on purpose
        let frames = vec![
            Frame::new(0x456, &[5, 6, 7, 8]).with_timestamp(now + 0.4),
            Frame::new(0x123, &[1, 2, 3, 4]).with_timestamp(now + 0.2),
        ];
        assert_eq!(scheduler.simulate(frames).unwrap(), 2);
        assert!(start.elapsed() < Duration::from_millis(100), "simulate must not block");

        wait_for(&seen, 2, Duration::from_secs(3));
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].1, 0x123);
        assert_eq!(seen[1].1, 0x456);

        let first = seen[0].0.duration_since(start);
        let second = seen[1].0.duration_since(start);
        assert!(first >= Duration::from_millis(195), "first delivered early: {:?}", first);
        assert!(first < Duration::from_millis(350), "first delivered late: {:?}", first);
        assert!(second >= Duration::from_millis(395), "second delivered early: {:?}", second);
        assert!(seen[0].0 < seen[1].0);
    }

    #[test]
    fn test_past_timestamps_are_delivered_immediately() {
        let (registry, seen) = recording_registry();
        let scheduler = FrameScheduler::new(registry);

        let start = Instant::now();
        scheduler
            .simulate(vec![Frame::new(0x1, &[]).with_timestamp(0.0)])
            .unwrap();

        wait_for(&seen, 1, Duration::from_secs(1));
        assert_eq!(seen.lock().len(), 1);
        assert!(start.elapsed() < Duration::from_millis(200));
        assert_eq!(scheduler.delivered(), 1);
    }

    #[test]
    fn test_unschedulable_timestamps_rejected_without_panic() {
        let (registry, seen) = recording_registry();
        let scheduler = FrameScheduler::new(registry);

        let far_future = Frame::new(0x1, &[]).with_timestamp(1.0e19);
        assert!(far_future.validate().is_ok());
        assert!(matches!(
            scheduler.simulate(vec![Frame::new(0x2, &[]).with_timestamp(0.0), far_future]),
            Err(TelemetryError::InvalidFrame(_))
        ));
        assert!(matches!(
            scheduler.simulate(vec![Frame::new(0x3, &[]).with_timestamp(f64::NAN)]),
            Err(TelemetryError::InvalidFrame(_))
        ));

        // A rejected batch schedules nothing; the scheduler stays usable
        assert_eq!(scheduler.pending(), 0);
        scheduler
            .simulate(vec![Frame::new(0x4, &[]).with_timestamp(0.0)])
            .unwrap();
        wait_for(&seen, 1, Duration::from_secs(1));
        let ids: Vec<u32> = seen.lock().iter().map(|(_, id)| *id).collect();
        assert_eq!(ids, vec![0x4]);
    }

    #[test]
    fn test_equal_deadlines_keep_input_order() {
        let (registry, seen) = recording_registry();
        let scheduler = FrameScheduler::new(registry);

        let frames = (0..5u32).map(|i| Frame::new(i, &[]).with_timestamp(0.0)).collect();
        scheduler.simulate(frames).unwrap();

        wait_for(&seen, 5, Duration::from_secs(1));
        let ids: Vec<u32> = seen.lock().iter().map(|(_, id)| *id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_stop_cancels_pending_frames() {
        let (registry, seen) = recording_registry();
        let scheduler = FrameScheduler::new(registry);

        let now = now_seconds();
        scheduler
            .simulate(vec![
                Frame::new(0x10, &[]).with_timestamp(now + 0.3),
                Frame::new(0x20, &[]).with_timestamp(now + 0.5),
            ])
            .unwrap();
        assert_eq!(scheduler.pending(), 2);

        assert_eq!(scheduler.stop(), 2);
        assert_eq!(scheduler.stop(), 0);
        thread::sleep(Duration::from_millis(700));

        assert!(seen.lock().is_empty());
        assert!(scheduler.is_stopped());
        assert!(scheduler.simulate(vec![Frame::new(0x30, &[])]).is_err());
    }

    #[test]
    fn test_repeated_simulate_calls_share_one_timeline() {
        let (registry, seen) = recording_registry();
        let scheduler = FrameScheduler::new(registry);

        let now = now_seconds();
        scheduler
            .simulate(vec![Frame::new(0x2, &[]).with_timestamp(now + 0.3)])
            .unwrap();
        scheduler
            .simulate(vec![Frame::new(0x1, &[]).with_timestamp(now + 0.1)])
            .unwrap();

        wait_for(&seen, 2, Duration::from_secs(2));
        let ids: Vec<u32> = seen.lock().iter().map(|(_, id)| *id).collect();
        assert_eq!(ids, vec![0x1, 0x2]);
    }
}
