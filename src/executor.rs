//! Single-threaded cooperative event loop with posted tasks and deadline
//! timers.
//!
//! One thread calls [`EventLoop::run`]; any thread may post work or arm
//! timers. Tasks run in post order. Timer callbacks fire at or after their
//! deadline, never before. Re-arming a timer while a wait is pending
//! supersedes it: the pending callback is delivered promptly with
//! [`ErrorCode::Cancelled`] and the most recent deadline wins.
//!
//! The loop sleeps on a condvar until the earliest deadline (or a post), so
//! wakeup latency is bounded by condvar precision rather than a polling
//! interval — the batch-plan follower counts its start delay in
//! microseconds.

use crate::clock;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Completion code delivered to posted tasks and timer callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok,
    /// The timer was re-armed while this wait was pending.
    Cancelled,
}

type Callback = Box<dyn FnOnce(ErrorCode) + Send>;

struct TimerEntry {
    deadline_ns: u64,
    seq: u64,
    timer_id: u64,
    generation: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_ns == other.deadline_ns && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline_ns, self.seq).cmp(&(other.deadline_ns, other.seq))
    }
}

struct PendingWait {
    generation: u64,
    cb: Callback,
    timer: Arc<TimerShared>,
}

struct LoopState {
    tasks: VecDeque<(Callback, ErrorCode)>,
    timers: BinaryHeap<Reverse<TimerEntry>>,
    waits: HashMap<u64, PendingWait>,
    stopped: bool,
    next_timer_id: u64,
    next_seq: u64,
}

struct LoopInner {
    state: Mutex<LoopState>,
    cv: Condvar,
}

/// Handle to a cooperative event loop. Cloning shares the loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<LoopInner>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LoopInner {
                state: Mutex::new(LoopState {
                    tasks: VecDeque::new(),
                    timers: BinaryHeap::new(),
                    waits: HashMap::new(),
                    stopped: false,
                    next_timer_id: 0,
                    next_seq: 0,
                }),
                cv: Condvar::new(),
            }),
        }
    }

    /// Enqueue `cb` to run on the loop thread with [`ErrorCode::Ok`]. Tasks
    /// posted from one thread are observed in post order.
    pub fn post_ok(&self, cb: impl FnOnce(ErrorCode) + Send + 'static) {
        let mut st = self.lock();
        st.tasks.push_back((Box::new(cb), ErrorCode::Ok));
        self.inner.cv.notify_one();
    }

    /// Create a timer bound to this loop.
    pub fn timer(&self) -> Timer {
        let id = {
            let mut st = self.lock();
            st.next_timer_id += 1;
            st.next_timer_id
        };
        Timer {
            ev: self.clone(),
            shared: Arc::new(TimerShared {
                id,
                generation: AtomicU64::new(0),
                armed: Mutex::new(None),
            }),
        }
    }

    /// Run the loop on the calling thread until [`stop`](EventLoop::stop).
    /// On stop, pending tasks are drained before returning; unfired timer
    /// waits are discarded.
    pub fn run(&self) {
        let inner = &*self.inner;
        let mut st = self.lock();
        loop {
            if let Some((cb, code)) = st.tasks.pop_front() {
                drop(st);
                cb(code);
                st = self.lock();
                continue;
            }

            // Fire at most one due timer, then give tasks another look.
            let now = clock::now_ns();
            let mut fired = None;
            loop {
                let due = st
                    .timers
                    .peek()
                    .is_some_and(|Reverse(top)| top.deadline_ns <= now);
                if !due {
                    break;
                }
                let entry = st.timers.pop().expect("due timer entry").0;
                let live = st
                    .waits
                    .get(&entry.timer_id)
                    .is_some_and(|w| w.generation == entry.generation);
                if !live {
                    // Superseded by a re-arm; the cancelled callback already
                    // went out through the task queue.
                    continue;
                }
                fired = st.waits.remove(&entry.timer_id);
                break;
            }
            if let Some(wait) = fired {
                *wait.timer.armed.lock().expect("timer lock poisoned") = None;
                drop(st);
                (wait.cb)(ErrorCode::Ok);
                st = self.lock();
                continue;
            }

            if st.stopped {
                while let Some((cb, code)) = st.tasks.pop_front() {
                    drop(st);
                    cb(code);
                    st = self.lock();
                }
                return;
            }

            let next_deadline = st.timers.peek().map(|Reverse(top)| top.deadline_ns);
            match next_deadline {
                Some(deadline_ns) => {
                    let wait_ns = deadline_ns.saturating_sub(clock::now_ns());
                    if wait_ns == 0 {
                        continue;
                    }
                    let (guard, _) = inner
                        .cv
                        .wait_timeout(st, Duration::from_nanos(wait_ns))
                        .expect("event loop lock poisoned");
                    st = guard;
                }
                None => {
                    st = inner.cv.wait(st).expect("event loop lock poisoned");
                }
            }
        }
    }

    /// Ask the loop to exit. Pending tasks still run; `run` then returns.
    pub fn stop(&self) {
        let mut st = self.lock();
        st.stopped = true;
        self.inner.cv.notify_all();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LoopState> {
        self.inner.state.lock().expect("event loop lock poisoned")
    }
}

struct TimerShared {
    id: u64,
    generation: AtomicU64,
    armed: Mutex<Option<u64>>,
}

/// Deadline timer bound to an [`EventLoop`].
///
/// Usage mirrors an async deadline timer: `set_timeout` records the absolute
/// deadline, `async_wait` registers the callback. `set_timeout` on a timer
/// with a pending wait cancels that wait.
#[derive(Clone)]
pub struct Timer {
    ev: EventLoop,
    shared: Arc<TimerShared>,
}

impl Timer {
    /// Arm the timer for an absolute deadline (epoch nanoseconds, see
    /// [`clock::now_ns`]). A pending wait is superseded: its callback is
    /// delivered with [`ErrorCode::Cancelled`].
    pub fn set_timeout(&self, deadline_ns: u64) {
        let mut st = self.ev.lock();
        self.shared.generation.fetch_add(1, Ordering::Relaxed);
        if let Some(wait) = st.waits.remove(&self.shared.id) {
            st.tasks.push_back((wait.cb, ErrorCode::Cancelled));
        }
        *self.shared.armed.lock().expect("timer lock poisoned") = Some(deadline_ns);
        self.ev.inner.cv.notify_one();
    }

    /// The armed deadline, or `None` if the timer is unarmed or has fired.
    pub fn timeout(&self) -> Option<u64> {
        *self.shared.armed.lock().expect("timer lock poisoned")
    }

    /// Register `cb` to run on the loop thread once the armed deadline is
    /// reached. Panics if no deadline was set.
    pub fn async_wait(&self, cb: impl FnOnce(ErrorCode) + Send + 'static) {
        let mut st = self.ev.lock();
        let deadline_ns = self
            .shared
            .armed
            .lock()
            .expect("timer lock poisoned")
            .expect("async_wait requires a prior set_timeout");
        let generation = self.shared.generation.load(Ordering::Relaxed);
        if let Some(old) = st.waits.remove(&self.shared.id) {
            st.tasks.push_back((old.cb, ErrorCode::Cancelled));
        }
        let seq = st.next_seq;
        st.next_seq += 1;
        st.waits.insert(
            self.shared.id,
            PendingWait {
                generation,
                cb: Box::new(cb),
                timer: Arc::clone(&self.shared),
            },
        );
        st.timers.push(Reverse(TimerEntry {
            deadline_ns,
            seq,
            timer_id: self.shared.id,
            generation,
        }));
        self.ev.inner.cv.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn run_on_thread(ev: &EventLoop) -> thread::JoinHandle<()> {
        let ev = ev.clone();
        thread::spawn(move || ev.run())
    }

    #[test]
    fn test_tasks_run_in_post_order() {
        let ev = EventLoop::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = Arc::clone(&log);
            ev.post_ok(move |code| {
                assert_eq!(code, ErrorCode::Ok);
                log.lock().unwrap().push(i);
            });
        }
        let th = run_on_thread(&ev);
        thread::sleep(Duration::from_millis(20));
        ev.stop();
        th.join().unwrap();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_stop_drains_pending_tasks() {
        let ev = EventLoop::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = Arc::clone(&log);
            ev.post_ok(move |_| log.lock().unwrap().push(i));
        }
        ev.stop();
        let th = run_on_thread(&ev);
        th.join().unwrap();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_timer_fires_at_or_after_deadline() {
        let ev = EventLoop::new();
        let timer = ev.timer();
        let fired = Arc::new(Mutex::new(None));
        let deadline = clock::now_ns() + 5_000_000; // +5 ms
        timer.set_timeout(deadline);
        {
            let fired = Arc::clone(&fired);
            timer.async_wait(move |code| {
                *fired.lock().unwrap() = Some((code, clock::now_ns()));
            });
        }
        let th = run_on_thread(&ev);
        thread::sleep(Duration::from_millis(50));
        ev.stop();
        th.join().unwrap();

        let (code, at) = fired.lock().unwrap().expect("timer never fired");
        assert_eq!(code, ErrorCode::Ok);
        assert!(at >= deadline, "fired {}ns early", deadline - at);
        assert_eq!(timer.timeout(), None, "deadline not cleared after firing");
    }

    #[test]
    fn test_rearm_cancels_pending_wait() {
        let ev = EventLoop::new();
        let timer = ev.timer();
        let log: Arc<Mutex<Vec<(&str, ErrorCode)>>> = Arc::new(Mutex::new(Vec::new()));

        timer.set_timeout(clock::now_ns() + 500_000_000); // +500 ms, never reached
        {
            let log = Arc::clone(&log);
            timer.async_wait(move |code| log.lock().unwrap().push(("first", code)));
        }
        timer.set_timeout(clock::now_ns() + 2_000_000); // +2 ms wins
        {
            let log = Arc::clone(&log);
            timer.async_wait(move |code| log.lock().unwrap().push(("second", code)));
        }

        let th = run_on_thread(&ev);
        thread::sleep(Duration::from_millis(50));
        ev.stop();
        th.join().unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![("first", ErrorCode::Cancelled), ("second", ErrorCode::Ok)]
        );
    }

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let ev = EventLoop::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let base = clock::now_ns();
        // Arm out of deadline order; each deadline gets its own timer.
        for (name, offset_ms) in [("c", 6u64), ("a", 2), ("b", 4)] {
            let timer = ev.timer();
            timer.set_timeout(base + offset_ms * 1_000_000);
            let log = Arc::clone(&log);
            timer.async_wait(move |_| log.lock().unwrap().push(name));
        }
        let th = run_on_thread(&ev);
        thread::sleep(Duration::from_millis(60));
        ev.stop();
        th.join().unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_post_from_multiple_threads() {
        let ev = EventLoop::new();
        let count = Arc::new(Mutex::new(0u32));
        let th = run_on_thread(&ev);
        let mut posters = Vec::new();
        for _ in 0..4 {
            let ev = ev.clone();
            let count = Arc::clone(&count);
            posters.push(thread::spawn(move || {
                for _ in 0..50 {
                    let count = Arc::clone(&count);
                    ev.post_ok(move |_| *count.lock().unwrap() += 1);
                }
            }));
        }
        for p in posters {
            p.join().unwrap();
        }
        thread::sleep(Duration::from_millis(50));
        ev.stop();
        th.join().unwrap();
        assert_eq!(*count.lock().unwrap(), 200);
    }
}
