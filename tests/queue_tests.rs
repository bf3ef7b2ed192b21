use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use fleet_dispatch::error::FleetError;
use fleet_dispatch::protocol::{
    CommandSpec, CommandType, CreateJobRequest, JobMode, JobResult, TargetType,
};
use fleet_dispatch::scheduler::queue::LOST_RESULT_MESSAGE;
use fleet_dispatch::scheduler::{JobDefinition, JobQueue, JobStatus};

fn job(name: &str, max_attempts: u32) -> JobDefinition {
    let mut command = CommandSpec::new(CommandType::Command, json!({"command": "hostname"}));
    command.max_attempts = max_attempts;
    command.timeout_seconds = 60;
    JobDefinition::from_request(CreateJobRequest {
        name: name.to_string(),
        description: None,
        command,
        target_type: TargetType::All,
        target_id: None,
        mode: JobMode::Required,
        scheduled_start: None,
        scheduled_end: None,
    })
    .unwrap()
}

fn result(success: bool, exit_code: i32) -> JobResult {
    let now = Utc::now();
    JobResult {
        instance_id: Uuid::nil(),
        success,
        exit_code,
        stdout: "out".to_string(),
        stderr: String::new(),
        started_at: now,
        completed_at: now,
    }
}

fn nodes(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_create_job_one_instance_per_node() {
    let mut queue = JobQueue::new();
    let def = job("inventory", 3);
    let job_id = def.id;

    let ids = queue.create_job(def, nodes(&["a", "b", "c"])).unwrap();
    assert_eq!(ids.len(), 3);
    assert_eq!(queue.len(), 3);

    let instances = queue.instances_for_job(&job_id);
    let bound: Vec<&str> = instances.iter().map(|i| i.node_id.as_str()).collect();
    assert_eq!(bound, vec!["a", "b", "c"]);
    for instance in instances {
        assert_eq!(instance.status, JobStatus::Pending);
        assert_eq!(instance.attempt, 0);
        assert_eq!(instance.max_attempts, 3);
    }
    assert_eq!(queue.status_counts(&job_id).get("pending"), Some(&3));
}

#[test]
fn test_pending_only_returns_own_instances() {
    let mut queue = JobQueue::new();
    queue.create_job(job("one", 1), nodes(&["a", "b"])).unwrap();
    queue.create_job(job("two", 1), nodes(&["b"])).unwrap();

    let for_a = queue.pending_for_node("a", Utc::now()).unwrap();
    assert_eq!(for_a.len(), 1);
    assert_eq!(for_a[0].job_name, "one");

    let for_b = queue.pending_for_node("b", Utc::now()).unwrap();
    assert_eq!(for_b.len(), 2);

    assert!(queue.pending_for_node("c", Utc::now()).unwrap().is_empty());
}

#[test]
fn test_pending_is_oldest_first() {
    let mut queue = JobQueue::new();
    let mut first = job("first", 1);
    let mut second = job("second", 1);
    let third = job("third", 1);
    first.created_at = Utc::now() - Duration::minutes(10);
    second.created_at = first.created_at;

    // Created out of order; equal timestamps fall back to creation order
    queue.create_job(third, nodes(&["n"])).unwrap();
    queue.create_job(first, nodes(&["n"])).unwrap();
    queue.create_job(second, nodes(&["n"])).unwrap();

    let names: Vec<String> = queue
        .pending_for_node("n", Utc::now())
        .unwrap()
        .into_iter()
        .map(|p| p.job_name)
        .collect();
    assert_eq!(names, vec!["first", "second", "third"]);
}

#[test]
fn test_scheduling_window_filters_pending() {
    let now = Utc::now();
    let mut queue = JobQueue::new();

    let mut later = job("later", 1);
    later.scheduled_start = Some(now + Duration::hours(1));
    let mut closed = job("closed", 1);
    closed.scheduled_end = Some(now - Duration::minutes(1));
    let mut open = job("open", 1);
    open.scheduled_start = Some(now - Duration::hours(1));
    open.scheduled_end = Some(now + Duration::hours(1));

    queue.create_job(later, nodes(&["n"])).unwrap();
    queue.create_job(closed, nodes(&["n"])).unwrap();
    queue.create_job(open, nodes(&["n"])).unwrap();

    let pending = queue.pending_for_node("n", now).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].job_name, "open");

    let pending = queue
        .pending_for_node("n", now + Duration::hours(2))
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].job_name, "later");
}

#[test]
fn test_claim_is_exclusive() {
    let mut queue = JobQueue::new();
    let ids = queue.create_job(job("once", 3), nodes(&["n"])).unwrap();
    let id = ids[0];

    let claimed = queue.claim(&id, "n", Utc::now()).unwrap();
    assert_eq!(claimed.status, JobStatus::Running);
    assert_eq!(claimed.attempt, 1);
    assert!(claimed.started_at.is_some());

    let second = queue.claim(&id, "n", Utc::now()).unwrap_err();
    assert!(matches!(second, FleetError::InvalidTransition { .. }));
    assert_eq!(queue.get_instance(&id).unwrap().attempt, 1);

    assert!(queue.pending_for_node("n", Utc::now()).unwrap().is_empty());
}

#[test]
fn test_claim_rejects_other_node() {
    let mut queue = JobQueue::new();
    let ids = queue.create_job(job("mine", 1), nodes(&["a"])).unwrap();

    let err = queue.claim(&ids[0], "b", Utc::now()).unwrap_err();
    assert!(matches!(err, FleetError::NodeMismatch { .. }));
    assert_eq!(queue.get_instance(&ids[0]).unwrap().status, JobStatus::Pending);

    let err = queue.claim(&Uuid::new_v4(), "a", Utc::now()).unwrap_err();
    assert!(matches!(err, FleetError::InstanceNotFound(_)));
}

#[test]
fn test_failed_result_retries_until_exhausted() {
    let mut queue = JobQueue::new();
    let id = queue.create_job(job("flaky", 2), nodes(&["n"])).unwrap()[0];

    queue.claim(&id, "n", Utc::now()).unwrap();
    let after_first = queue.record_result(&id, "n", &result(false, 1)).unwrap();
    assert_eq!(after_first.status, JobStatus::Queued);
    assert_eq!(after_first.exit_code, Some(1));

    // Queued instances are offered again with the attempt count so far
    let pending = queue.pending_for_node("n", Utc::now()).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempt, 1);

    queue.claim(&id, "n", Utc::now()).unwrap();
    let after_second = queue.record_result(&id, "n", &result(false, 2)).unwrap();
    assert_eq!(after_second.status, JobStatus::Failed);
    assert_eq!(after_second.attempt, 2);

    assert!(queue.pending_for_node("n", Utc::now()).unwrap().is_empty());
    assert!(queue.claim(&id, "n", Utc::now()).is_err());
}

#[test]
fn test_success_result_is_terminal() {
    let mut queue = JobQueue::new();
    let id = queue.create_job(job("ok", 3), nodes(&["n"])).unwrap()[0];

    queue.claim(&id, "n", Utc::now()).unwrap();
    let done = queue.record_result(&id, "n", &result(true, 3010)).unwrap();
    assert_eq!(done.status, JobStatus::Success);
    assert_eq!(done.exit_code, Some(3010));
    assert_eq!(done.stdout.as_deref(), Some("out"));

    let err = queue.record_result(&id, "n", &result(true, 0)).unwrap_err();
    assert!(matches!(err, FleetError::InvalidTransition { .. }));
}

#[test]
fn test_result_requires_running_and_owner() {
    let mut queue = JobQueue::new();
    let id = queue.create_job(job("x", 1), nodes(&["n"])).unwrap()[0];

    let err = queue.record_result(&id, "n", &result(true, 0)).unwrap_err();
    assert!(matches!(err, FleetError::InvalidTransition { .. }));

    queue.claim(&id, "n", Utc::now()).unwrap();
    let err = queue.record_result(&id, "other", &result(true, 0)).unwrap_err();
    assert!(matches!(err, FleetError::NodeMismatch { .. }));
    assert_eq!(queue.get_instance(&id).unwrap().status, JobStatus::Running);
}

#[test]
fn test_cancel_only_unclaimed() {
    let mut queue = JobQueue::new();
    let def = job("cancel me", 1);
    let job_id = def.id;
    let ids = queue.create_job(def, nodes(&["a", "b", "c"])).unwrap();

    queue.claim(&ids[0], "a", Utc::now()).unwrap();
    let err = queue.cancel_instance(&ids[0], Utc::now()).unwrap_err();
    assert!(matches!(err, FleetError::InvalidTransition { .. }));

    let cancelled = queue.cancel_instance(&ids[1], Utc::now()).unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    assert_eq!(queue.cancel_job(&job_id, Utc::now()).unwrap(), 1);
    assert_eq!(queue.get_instance(&ids[0]).unwrap().status, JobStatus::Running);
    assert_eq!(queue.get_instance(&ids[2]).unwrap().status, JobStatus::Cancelled);

    assert!(matches!(
        queue.cancel_job(&Uuid::new_v4(), Utc::now()),
        Err(FleetError::JobNotFound(_))
    ));
}

#[test]
fn test_sweep_requeues_then_fails_lost_attempts() {
    let mut queue = JobQueue::new();
    let id = queue.create_job(job("lost", 2), nodes(&["n"])).unwrap()[0];
    let grace = Duration::minutes(5);

    let started = Utc::now() - Duration::hours(1);
    queue.claim(&id, "n", started).unwrap();

    // Inside timeout + grace nothing happens
    let report = queue.sweep(started + Duration::seconds(30), grace);
    assert!(report.is_empty());

    let report = queue.sweep(Utc::now(), grace);
    assert_eq!(report.requeued, vec![id]);
    assert_eq!(queue.get_instance(&id).unwrap().status, JobStatus::Queued);

    queue.claim(&id, "n", started).unwrap();
    let report = queue.sweep(Utc::now(), grace);
    assert_eq!(report.failed, vec![id]);
    let instance = queue.get_instance(&id).unwrap();
    assert_eq!(instance.status, JobStatus::Failed);
    assert_eq!(instance.exit_code, Some(-1));
    assert_eq!(instance.stderr.as_deref(), Some(LOST_RESULT_MESSAGE));
}

#[test]
fn test_sweep_expires_closed_windows() {
    let now = Utc::now();
    let mut queue = JobQueue::new();
    let mut def = job("window", 1);
    def.scheduled_end = Some(now + Duration::minutes(1));
    let ids = queue.create_job(def, nodes(&["a", "b"])).unwrap();
    queue.claim(&ids[0], "a", now).unwrap();

    assert!(queue.sweep(now, Duration::minutes(5)).is_empty());

    let report = queue.sweep(now + Duration::minutes(2), Duration::minutes(5));
    assert_eq!(report.expired, vec![ids[1]]);
    assert_eq!(queue.get_instance(&ids[0]).unwrap().status, JobStatus::Running);
    assert_eq!(queue.get_instance(&ids[1]).unwrap().status, JobStatus::Cancelled);
}

#[test]
fn test_capacity_limit() {
    let mut queue = JobQueue::with_capacity(3);
    queue.create_job(job("fits", 1), nodes(&["a", "b"])).unwrap();
    assert!(!queue.is_full());

    let err = queue.create_job(job("too big", 1), nodes(&["a", "b"])).unwrap_err();
    assert!(matches!(err, FleetError::QueueFull(3)));
    assert_eq!(queue.len(), 2);
    assert_eq!(queue.all_jobs().len(), 1);

    queue.create_job(job("last", 1), nodes(&["c"])).unwrap();
    assert!(queue.is_full());
}

#[test]
fn test_sweep_waits_for_pre_and_post_scripts() {
    let mut queue = JobQueue::new();
    let mut def = job("install with hooks", 3);
    def.command.timeout_seconds = 3600;
    def.command.pre_script = Some("echo pre".to_string());
    def.command.post_script = Some("echo post".to_string());
    let id = queue.create_job(def, nodes(&["n"])).unwrap()[0];
    let grace = Duration::minutes(5);

    let started = Utc::now() - Duration::hours(3);
    queue.claim(&id, "n", started).unwrap();

    // Past timeout + grace, but the agent may still be in its post-script
    assert!(queue.sweep(started + Duration::seconds(4000), grace).is_empty());
    assert!(queue.sweep(started + Duration::seconds(5700), grace).is_empty());
    assert_eq!(queue.get_instance(&id).unwrap().status, JobStatus::Running);

    let done = queue.record_result(&id, "n", &result(true, 0)).unwrap();
    assert_eq!(done.status, JobStatus::Success);
    assert!(queue.pending_for_node("n", Utc::now()).unwrap().is_empty());
}

#[test]
fn test_sweep_requeues_after_full_attempt_budget() {
    let mut queue = JobQueue::new();
    let mut def = job("install with hooks", 3);
    def.command.timeout_seconds = 3600;
    def.command.pre_script = Some("echo pre".to_string());
    def.command.post_script = Some("echo post".to_string());
    let id = queue.create_job(def, nodes(&["n"])).unwrap()[0];

    let started = Utc::now() - Duration::hours(3);
    queue.claim(&id, "n", started).unwrap();

    // 3600 + 2 * 900 + 3 * 10 seconds of stages, then 300 seconds of grace
    let report = queue.sweep(started + Duration::seconds(5731), Duration::minutes(5));
    assert_eq!(report.requeued, vec![id]);
}
