//! Deadline-ordering behavior of the batch-plan follower.

use axon::{BatchPlan, ModelExecutor, PlanFollower, PlanQuery, clock};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct RecordingModel {
    index: u32,
    log: Mutex<Vec<(u64, u64)>>, // (plan_id, start_ns)
}

impl RecordingModel {
    fn new(index: u32) -> Arc<Self> {
        Arc::new(Self {
            index,
            log: Mutex::new(Vec::new()),
        })
    }

    fn executions(&self) -> Vec<(u64, u64)> {
        self.log.lock().unwrap().clone()
    }
}

impl ModelExecutor for RecordingModel {
    fn model_index(&self) -> u32 {
        self.index
    }

    fn execute(&self, plan: &BatchPlan) {
        self.log.lock().unwrap().push((plan.plan_id, clock::now_ns()));
    }
}

fn plan(plan_id: u64, model_index: u32, exec_time_ns: u64) -> BatchPlan {
    BatchPlan {
        plan_id,
        model_index,
        exec_time_ns,
        expected_finish_time_ns: exec_time_ns + 500_000,
        queries: vec![PlanQuery {
            global_id: plan_id,
            query_id: plan_id,
        }],
    }
}

fn wait_for_executions(model: &RecordingModel, count: usize, timeout: Duration) {
    let deadline = std::time::Instant::now() + timeout;
    while model.log.lock().unwrap().len() < count {
        assert!(
            std::time::Instant::now() < deadline,
            "only {} of {count} plans executed in time",
            model.log.lock().unwrap().len()
        );
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_plans_execute_in_deadline_order() {
    let follower = PlanFollower::new();
    let model = RecordingModel::new(0);
    follower.add_model(model.clone());
    follower.start(None);

    // Insert out of deadline order; plan ids name their offsets.
    let base = clock::now_ns();
    follower.add_batch_plan(plan(300, 0, base + 30_000_000));
    follower.add_batch_plan(plan(100, 0, base + 10_000_000));
    follower.add_batch_plan(plan(200, 0, base + 20_000_000));

    wait_for_executions(&model, 3, Duration::from_secs(2));
    follower.stop();

    let log = model.executions();
    let order: Vec<u64> = log.iter().map(|(id, _)| *id).collect();
    assert_eq!(order, vec![100, 200, 300]);

    for (plan_id, start_ns) in log {
        let deadline = base + plan_id * 100_000;
        assert!(
            start_ns >= deadline,
            "plan {plan_id} started at {start_ns}, before its deadline {deadline}"
        );
    }
    assert_eq!(follower.pending_plans(), 0);
}

#[test]
fn test_earlier_plan_preempts_armed_timer() {
    let follower = PlanFollower::new();
    let model = RecordingModel::new(0);
    follower.add_model(model.clone());
    follower.start(None);

    let base = clock::now_ns();
    // Arm far out, then supersede with a near deadline.
    follower.add_batch_plan(plan(2, 0, base + 60_000_000));
    follower.add_batch_plan(plan(1, 0, base + 5_000_000));

    wait_for_executions(&model, 2, Duration::from_secs(2));
    follower.stop();

    let order: Vec<u64> = model.executions().iter().map(|(id, _)| *id).collect();
    assert_eq!(order, vec![1, 2]);
}

#[test]
fn test_missing_model_drops_plan_and_continues() {
    let follower = PlanFollower::new();
    let model = RecordingModel::new(0);
    follower.add_model(model.clone());
    follower.start(None);

    let base = clock::now_ns();
    // Model 5 was never installed; its plan is logged and dropped, and the
    // follower moves on to the runnable one.
    follower.add_batch_plan(plan(1, 5, base + 2_000_000));
    follower.add_batch_plan(plan(2, 0, base + 8_000_000));

    wait_for_executions(&model, 1, Duration::from_secs(2));
    follower.stop();

    let order: Vec<u64> = model.executions().iter().map(|(id, _)| *id).collect();
    assert_eq!(order, vec![2]);
    assert_eq!(follower.pending_plans(), 0);
}

#[test]
fn test_past_deadline_executes_immediately() {
    let follower = PlanFollower::new();
    let model = RecordingModel::new(3);
    follower.add_model(model.clone());
    follower.start(None);

    // Already late on arrival: fires on the next loop pass.
    follower.add_batch_plan(plan(1, 3, clock::now_ns().saturating_sub(1_000_000)));

    wait_for_executions(&model, 1, Duration::from_secs(2));
    follower.stop();
    assert_eq!(model.executions().len(), 1);
}
