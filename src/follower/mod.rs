//! Deadline-driven executor for externally scheduled GPU batch plans.
//!
//! The upstream scheduler decides *when* every batch runs and stamps the
//! plan with an intended execution time. The follower's whole job is
//! fidelity to that plan: wake at the earliest deadline, dispatch to the
//! right model instance, and never overlap two executions. Start and
//! finish delays against the plan are the primary health signal; either
//! exceeding 100 µs logs a warning.

use crate::clock;
use crate::executor::{ErrorCode, EventLoop, Timer};
use crate::util::pin_to_core;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Delay warning threshold in microseconds.
const DELAY_WARN_US: i64 = 100;

/// One query inside a batch plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanQuery {
    pub global_id: u64,
    pub query_id: u64,
}

/// An externally computed batch plan. Immutable after arrival; consumed
/// exactly once.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub plan_id: u64,
    pub model_index: u32,
    /// Absolute intended start time, epoch nanoseconds.
    pub exec_time_ns: u64,
    /// When the scheduler expects the batch to complete.
    pub expected_finish_time_ns: u64,
    pub queries: Vec<PlanQuery>,
}

/// A loaded model instance the follower can dispatch to. The actual
/// framework call behind `execute` is an external collaborator.
pub trait ModelExecutor: Send + Sync {
    fn model_index(&self) -> u32;

    /// Run the batch synchronously on the calling (follower) thread.
    fn execute(&self, plan: &BatchPlan);
}

struct PlanEntry(BatchPlan);

impl PartialEq for PlanEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.exec_time_ns == other.0.exec_time_ns && self.0.plan_id == other.0.plan_id
    }
}

impl Eq for PlanEntry {}

impl PartialOrd for PlanEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PlanEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.0.exec_time_ns, self.0.plan_id).cmp(&(other.0.exec_time_ns, other.0.plan_id))
    }
}

struct FollowerState {
    models: Vec<Option<Arc<dyn ModelExecutor>>>,
    plans: BinaryHeap<Reverse<PlanEntry>>,
}

struct FollowerCore {
    state: Mutex<FollowerState>,
    is_executing: AtomicBool,
    timer: Timer,
}

impl FollowerCore {
    /// Re-arm the timer for the earliest pending plan. With an empty heap
    /// any armed timer is left to fire and log.
    fn update_timer(self: &Arc<Self>, state: &FollowerState) {
        let Some(Reverse(top)) = state.plans.peek() else {
            return;
        };
        let deadline = top.0.exec_time_ns;
        if self.timer.timeout() != Some(deadline) {
            self.timer.set_timeout(deadline);
            let core = Arc::clone(self);
            self.timer.async_wait(move |err| core.on_timer(err));
        }
    }

    fn on_timer(self: &Arc<Self>, err: ErrorCode) {
        if err != ErrorCode::Ok {
            // Re-armed for a nearer deadline; the new wait covers us.
            return;
        }
        let start_ns = clock::now_ns();

        let plan = {
            let mut st = self.state.lock().expect("follower state poisoned");
            match st.plans.pop() {
                Some(Reverse(PlanEntry(plan))) => plan,
                None => {
                    tracing::error!("timer fired without a batch plan to run");
                    return;
                }
            }
        };

        let model = {
            let st = self.state.lock().expect("follower state poisoned");
            st.models
                .get(plan.model_index as usize)
                .and_then(Clone::clone)
        };
        let Some(model) = model else {
            tracing::error!(
                model_index = plan.model_index,
                plan_id = plan.plan_id,
                "cannot find model for batch plan"
            );
            let st = self.state.lock().expect("follower state poisoned");
            self.update_timer(&st);
            return;
        };

        let start_delay_us = (start_ns as i64 - plan.exec_time_ns as i64) / 1_000;
        if start_delay_us > DELAY_WARN_US {
            tracing::warn!(
                plan_id = plan.plan_id,
                model_index = plan.model_index,
                start_delay_us,
                "huge start delay"
            );
        }
        tracing::debug!(
            plan_id = plan.plan_id,
            model_index = plan.model_index,
            batch_size = plan.queries.len(),
            start_delay_us,
            "executing batch plan"
        );

        let already = self.is_executing.swap(true, Ordering::AcqRel);
        assert!(
            !already,
            "overlapping batch plan: plan {} fired while another batch is executing",
            plan.plan_id
        );

        model.execute(&plan);

        let finish_ns = clock::now_ns();
        let elapse_us = (finish_ns - start_ns) / 1_000;
        let finish_delay_us = (finish_ns as i64 - plan.expected_finish_time_ns as i64) / 1_000;
        tracing::debug!(
            plan_id = plan.plan_id,
            batch_size = plan.queries.len(),
            start_delay_us,
            elapse_us,
            finish_delay_us,
            "batch plan finished"
        );
        if finish_delay_us > DELAY_WARN_US {
            tracing::warn!(
                plan_id = plan.plan_id,
                model_index = plan.model_index,
                start_delay_us,
                finish_delay_us,
                "huge finish delay"
            );
        }

        {
            let st = self.state.lock().expect("follower state poisoned");
            self.update_timer(&st);
        }
        self.is_executing.store(false, Ordering::Release);
    }
}

/// Orders batch plans by intended start time and executes each on its own
/// event-loop thread, at or after its deadline, one at a time.
pub struct PlanFollower {
    ev: EventLoop,
    core: Arc<FollowerCore>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl PlanFollower {
    pub fn new() -> Self {
        let ev = EventLoop::new();
        let timer = ev.timer();
        Self {
            ev,
            core: Arc::new(FollowerCore {
                state: Mutex::new(FollowerState {
                    models: Vec::new(),
                    plans: BinaryHeap::new(),
                }),
                is_executing: AtomicBool::new(false),
                timer,
            }),
            thread: Mutex::new(None),
        }
    }

    /// Spawn the follower thread, optionally pinned to a CPU core.
    pub fn start(&self, pin_core: Option<usize>) {
        let ev = self.ev.clone();
        let handle = std::thread::Builder::new()
            .name("gpu-follower".into())
            .spawn(move || {
                if let Some(core) = pin_core {
                    pin_to_core(core);
                }
                ev.run();
            })
            .expect("spawn follower thread");
        *self.thread.lock().expect("follower thread slot poisoned") = Some(handle);
    }

    /// Stop the loop and join the follower thread.
    pub fn stop(&self) {
        self.ev.stop();
        if let Some(handle) = self
            .thread
            .lock()
            .expect("follower thread slot poisoned")
            .take()
        {
            let _ = handle.join();
        }
    }

    /// Install a model instance. Installing over an occupied slot is a bug.
    pub fn add_model(&self, model: Arc<dyn ModelExecutor>) {
        let index = model.model_index() as usize;
        let mut st = self.core.state.lock().expect("follower state poisoned");
        if st.models.len() <= index {
            st.models.resize_with(index + 1, || None);
        }
        assert!(
            st.models[index].is_none(),
            "model already installed at index {index}"
        );
        st.models[index] = Some(model);
    }

    /// Remove a model instance. The slot must hold exactly this model.
    pub fn remove_model(&self, model: &Arc<dyn ModelExecutor>) {
        let index = model.model_index() as usize;
        let mut st = self.core.state.lock().expect("follower state poisoned");
        let slot = st
            .models
            .get_mut(index)
            .unwrap_or_else(|| panic!("model index {index} out of range"));
        let installed = slot
            .as_ref()
            .unwrap_or_else(|| panic!("no model installed at index {index}"));
        assert!(
            Arc::ptr_eq(installed, model),
            "a different model is installed at index {index}"
        );
        *slot = None;
    }

    /// Accept a plan and schedule the wakeup for the earliest deadline.
    pub fn add_batch_plan(&self, plan: BatchPlan) {
        let mut st = self.core.state.lock().expect("follower state poisoned");
        st.plans.push(Reverse(PlanEntry(plan)));
        self.core.update_timer(&st);
    }

    /// Number of plans waiting to execute.
    pub fn pending_plans(&self) -> usize {
        self.core
            .state
            .lock()
            .expect("follower state poisoned")
            .plans
            .len()
    }
}

impl Default for PlanFollower {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct SleepModel {
        index: u32,
        sleep: Duration,
        executed: Mutex<Vec<u64>>,
    }

    impl SleepModel {
        fn new(index: u32, sleep: Duration) -> Arc<Self> {
            Arc::new(Self {
                index,
                sleep,
                executed: Mutex::new(Vec::new()),
            })
        }
    }

    impl ModelExecutor for SleepModel {
        fn model_index(&self) -> u32 {
            self.index
        }

        fn execute(&self, plan: &BatchPlan) {
            self.executed.lock().unwrap().push(plan.plan_id);
            std::thread::sleep(self.sleep);
        }
    }

    fn plan(plan_id: u64, model_index: u32, exec_time_ns: u64) -> BatchPlan {
        BatchPlan {
            plan_id,
            model_index,
            exec_time_ns,
            expected_finish_time_ns: exec_time_ns + 1_000_000,
            queries: vec![PlanQuery {
                global_id: plan_id,
                query_id: plan_id,
            }],
        }
    }

    #[test]
    #[should_panic(expected = "model already installed")]
    fn test_double_install_is_a_bug() {
        let follower = PlanFollower::new();
        follower.add_model(SleepModel::new(0, Duration::ZERO));
        follower.add_model(SleepModel::new(0, Duration::ZERO));
    }

    #[test]
    fn test_remove_then_reinstall() {
        let follower = PlanFollower::new();
        let model: Arc<dyn ModelExecutor> = SleepModel::new(1, Duration::ZERO);
        follower.add_model(model.clone());
        follower.remove_model(&model);
        follower.add_model(SleepModel::new(1, Duration::ZERO));
    }

    #[test]
    fn test_overlap_guard_aborts_second_execution() {
        // Drive the timer callback directly from two threads. The loop
        // never does this, but a scheduler bug (or a second timer source)
        // would, and the guard must be loud about it.
        let follower = PlanFollower::new();
        let model = SleepModel::new(0, Duration::from_millis(50));
        follower.add_model(model);
        let now = clock::now_ns();
        follower.add_batch_plan(plan(1, 0, now));
        follower.add_batch_plan(plan(2, 0, now + 1));

        let core = Arc::clone(&follower.core);
        let first = std::thread::spawn(move || core.on_timer(ErrorCode::Ok));
        std::thread::sleep(Duration::from_millis(10));

        let core = Arc::clone(&follower.core);
        let second = std::thread::spawn(move || core.on_timer(ErrorCode::Ok));

        assert!(
            second.join().is_err(),
            "second execution overlapped without aborting"
        );
        first.join().unwrap();
    }

    #[test]
    fn test_cancelled_timer_is_absorbed() {
        let follower = PlanFollower::new();
        follower.add_model(SleepModel::new(0, Duration::ZERO));
        follower.add_batch_plan(plan(1, 0, clock::now_ns()));
        // A rearm notice must not pop anything.
        follower.core.on_timer(ErrorCode::Cancelled);
        assert_eq!(follower.pending_plans(), 1);
    }
}
