//! The plan executor: a small in-memory DAG engine.
//!
//! Plans live only in memory (restart loses them; the audit trail keeps the
//! per-task dispatches). Validation happens at creation: unique task ids,
//! resolvable `depends_on`, acyclic graph, known failure policies. Execution
//! is level-by-level (every task at level N reaches a terminal status
//! before any level-N+1 task starts) with tasks inside a level running
//! concurrently. A task's output becomes readable to downstream `{{task:..}}`
//! references only once its status is `completed`.

use crate::dispatch::{DispatchOptions, Dispatcher};
use crate::error::ToolError;
use crate::templates;
use hostbridge_events::Bus;
use hostbridge_protocol::{Invocation, Protocol};
use hostbridge_topics as topics;
use once_cell::sync::OnceCell;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    Stop,
    SkipDependents,
    Continue,
}

impl FailurePolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "stop" => Some(FailurePolicy::Stop),
            "skip_dependents" => Some(FailurePolicy::SkipDependents),
            "continue" => Some(FailurePolicy::Continue),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailurePolicy::Stop => "stop",
            FailurePolicy::SkipDependents => "skip_dependents",
            FailurePolicy::Continue => "continue",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl PlanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PlanStatus::Pending => "pending",
            PlanStatus::Running => "running",
            PlanStatus::Completed => "completed",
            PlanStatus::Failed => "failed",
            PlanStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub tool_category: String,
    pub tool_name: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub require_hitl: bool,
    #[serde(default)]
    pub on_failure: Option<String>,
}

#[derive(Debug, Clone)]
struct TaskState {
    spec: TaskSpec,
    level: usize,
    status: TaskStatus,
    output: Option<Value>,
    error: Option<String>,
    started_at: Option<String>,
    ended_at: Option<String>,
}

struct Plan {
    id: String,
    name: String,
    on_failure: FailurePolicy,
    status: PlanStatus,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    /// Ordered by level, then declaration order.
    tasks: Vec<TaskState>,
    levels: Vec<Vec<String>>,
    cancel: CancellationToken,
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Kahn's algorithm over the task set. Returns level-indexed execution
/// order, each task at the smallest level exceeding every dependency's.
fn compute_levels(tasks: &[TaskSpec]) -> Result<Vec<Vec<String>>, ToolError> {
    let ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    for task in tasks {
        for dep in &task.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(ToolError::invalid(format!(
                    "Task '{}' depends on unknown task '{dep}'",
                    task.id
                )));
            }
            if dep == &task.id {
                return Err(ToolError::invalid(format!(
                    "Task '{}' depends on itself",
                    task.id
                )));
            }
        }
    }
    let mut in_degree: HashMap<&str, usize> = tasks.iter().map(|t| (t.id.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> =
        tasks.iter().map(|t| (t.id.as_str(), Vec::new())).collect();
    for task in tasks {
        for dep in &task.depends_on {
            *in_degree.get_mut(task.id.as_str()).expect("known id") += 1;
            dependents
                .get_mut(dep.as_str())
                .expect("known id")
                .push(task.id.as_str());
        }
    }
    let mut queue: Vec<&str> = tasks
        .iter()
        .filter(|t| in_degree[t.id.as_str()] == 0)
        .map(|t| t.id.as_str())
        .collect();
    let mut levels: Vec<Vec<String>> = Vec::new();
    let mut visited = 0usize;
    while !queue.is_empty() {
        levels.push(queue.iter().map(|s| s.to_string()).collect());
        let mut next: Vec<&str> = Vec::new();
        for tid in queue.drain(..) {
            visited += 1;
            for dep in &dependents[tid] {
                let deg = in_degree.get_mut(dep).expect("known id");
                *deg -= 1;
                if *deg == 0 {
                    next.push(*dep);
                }
            }
        }
        queue = next;
    }
    if visited != tasks.len() {
        return Err(ToolError::invalid(
            "Cycle detected in task dependency graph; plan cannot be executed",
        ));
    }
    Ok(levels)
}

/// Task ids transitively dependent on `failed_id`.
fn transitive_dependents(failed_id: &str, tasks: &[TaskSpec]) -> HashSet<String> {
    let mut dependents: HashSet<String> = HashSet::new();
    let mut queue = vec![failed_id.to_string()];
    while let Some(current) = queue.pop() {
        for task in tasks {
            if task.depends_on.iter().any(|d| d == &current)
                && dependents.insert(task.id.clone())
            {
                queue.push(task.id.clone());
            }
        }
    }
    dependents
}

pub struct PlanService {
    bus: Bus,
    plans: Mutex<HashMap<String, Plan>>,
    dispatcher: OnceCell<Dispatcher>,
}

impl PlanService {
    pub fn new(bus: Bus) -> Self {
        Self {
            bus,
            plans: Mutex::new(HashMap::new()),
            dispatcher: OnceCell::new(),
        }
    }

    /// Late binding breaks the registry → plan tools → dispatcher cycle; the
    /// composition root calls this once right after building the dispatcher.
    pub fn bind_dispatcher(&self, dispatcher: Dispatcher) {
        let _ = self.dispatcher.set(dispatcher);
    }

    fn dispatcher(&self) -> Result<Dispatcher, ToolError> {
        self.dispatcher
            .get()
            .cloned()
            .ok_or_else(|| ToolError::internal("Plan executor is not wired to a dispatcher"))
    }

    // ------------------------------------------------------------------
    // plan.create
    // ------------------------------------------------------------------

    pub fn create(
        &self,
        name: &str,
        on_failure: &str,
        tasks: Vec<TaskSpec>,
    ) -> Result<Value, ToolError> {
        if tasks.is_empty() {
            return Err(ToolError::invalid("Plan must contain at least one task"));
        }
        let mut seen: HashSet<&str> = HashSet::new();
        for task in &tasks {
            if !seen.insert(task.id.as_str()) {
                return Err(ToolError::invalid(format!(
                    "Duplicate task id '{}'",
                    task.id
                )));
            }
        }
        let default_policy = FailurePolicy::parse(on_failure).ok_or_else(|| {
            ToolError::invalid(format!(
                "Invalid on_failure '{on_failure}'. Must be one of: stop, skip_dependents, continue"
            ))
        })?;
        for task in &tasks {
            if let Some(policy) = &task.on_failure {
                if FailurePolicy::parse(policy).is_none() {
                    return Err(ToolError::invalid(format!(
                        "Task '{}' has invalid on_failure '{policy}'",
                        task.id
                    )));
                }
            }
        }
        let levels = compute_levels(&tasks)?;
        let level_of: HashMap<&str, usize> = levels
            .iter()
            .enumerate()
            .flat_map(|(i, ids)| ids.iter().map(move |id| (id.as_str(), i)))
            .collect();
        let mut states: Vec<TaskState> = tasks
            .into_iter()
            .map(|spec| {
                let level = level_of[spec.id.as_str()];
                TaskState {
                    spec,
                    level,
                    status: TaskStatus::Pending,
                    output: None,
                    error: None,
                    started_at: None,
                    ended_at: None,
                }
            })
            .collect();
        states.sort_by_key(|t| t.level);

        let plan_id = Uuid::new_v4().to_string();
        let created_at = now_iso();
        let task_count = states.len();
        let plan = Plan {
            id: plan_id.clone(),
            name: name.to_string(),
            on_failure: default_policy,
            status: PlanStatus::Pending,
            created_at: created_at.clone(),
            started_at: None,
            completed_at: None,
            tasks: states,
            levels: levels.clone(),
            cancel: CancellationToken::new(),
        };
        self.plans
            .lock()
            .expect("plan table poisoned")
            .insert(plan_id.clone(), plan);
        info!(plan_id = %plan_id, tasks = task_count, "plan created");
        self.bus.publish(
            topics::TOPIC_PLAN_CREATED,
            &json!({"plan_id": plan_id.clone(), "name": name, "tasks": task_count}),
        );
        Ok(json!({
            "plan_id": plan_id,
            "name": name,
            "task_count": task_count,
            "execution_levels": levels.len(),
            "execution_order": levels,
            "created_at": created_at,
        }))
    }

    /// Resolve a plan reference: exact id first, then unique name. An
    /// ambiguous name is `invalid_parameter`, an unknown one `not_found`.
    fn resolve_ref(&self, plan_ref: &str) -> Result<String, ToolError> {
        let plans = self.plans.lock().expect("plan table poisoned");
        if plans.contains_key(plan_ref) {
            return Ok(plan_ref.to_string());
        }
        let matches: Vec<&Plan> = plans.values().filter(|p| p.name == plan_ref).collect();
        match matches.len() {
            0 => Err(ToolError::not_found(format!(
                "Plan '{plan_ref}' not found. Pass the plan_id returned by plan_create."
            ))
            .with_suggestion_tool("plan_list".to_string())),
            1 => Ok(matches[0].id.clone()),
            n => {
                let sample: Vec<&str> = matches.iter().take(5).map(|p| p.id.as_str()).collect();
                Err(ToolError::invalid(format!(
                    "Multiple plans named '{plan_ref}' found ({n} total, plan_ids: {}). \
                     Use the exact plan_id returned by plan_create.",
                    sample.join(", ")
                )))
            }
        }
    }

    // ------------------------------------------------------------------
    // plan.execute
    // ------------------------------------------------------------------

    pub async fn execute(&self, plan_ref: &str) -> Result<Value, ToolError> {
        let dispatcher = self.dispatcher()?;
        let plan_id = self.resolve_ref(plan_ref)?;
        let started_ms = std::time::Instant::now();

        // Claim the plan for execution; re-execution of running or finished
        // plans is refused here so exactly one runner can win.
        let (levels, specs, default_policy, cancel) = {
            let mut plans = self.plans.lock().expect("plan table poisoned");
            let plan = plans
                .get_mut(&plan_id)
                .ok_or_else(|| ToolError::not_found(format!("Plan '{plan_id}' not found")))?;
            match plan.status {
                PlanStatus::Pending => {}
                PlanStatus::Running => {
                    return Err(ToolError::invalid(format!(
                        "Plan '{plan_id}' is already running"
                    )))
                }
                PlanStatus::Cancelled => {
                    return Err(ToolError::invalid(format!(
                        "Plan '{plan_id}' is cancelled and cannot be executed"
                    )))
                }
                status => {
                    return Err(ToolError::invalid(format!(
                        "Plan '{plan_id}' already finished with status '{}'. Create a new plan to re-run.",
                        status.as_str()
                    )))
                }
            }
            plan.status = PlanStatus::Running;
            plan.started_at = Some(now_iso());
            (
                plan.levels.clone(),
                plan.tasks.iter().map(|t| t.spec.clone()).collect::<Vec<_>>(),
                plan.on_failure,
                plan.cancel.clone(),
            )
        };

        let spec_by_id: HashMap<String, TaskSpec> =
            specs.iter().map(|s| (s.id.clone(), s.clone())).collect();
        let mut outputs: HashMap<String, Value> = HashMap::new();
        let mut skip_ids: HashSet<String> = HashSet::new();
        let mut stop_all = false;

        for level in &levels {
            if cancel.is_cancelled() || self.plan_status(&plan_id) == Some(PlanStatus::Cancelled) {
                break;
            }
            let mut to_run: Vec<TaskSpec> = Vec::new();
            for tid in level {
                let spec = &spec_by_id[tid];
                let blocked = stop_all
                    || skip_ids.contains(tid)
                    || spec.depends_on.iter().any(|d| skip_ids.contains(d));
                if blocked {
                    self.set_task_status(&plan_id, tid, TaskStatus::Skipped, None, None);
                } else {
                    to_run.push(spec.clone());
                }
            }
            if to_run.is_empty() {
                continue;
            }

            // All tasks in a level run concurrently; the join is the level
            // barrier.
            let futures: Vec<_> = to_run
                .iter()
                .map(|spec| {
                    self.run_task(&dispatcher, &plan_id, spec.clone(), outputs.clone(), &cancel)
                })
                .collect();
            let results = futures::future::join_all(futures).await;

            for (spec, result) in to_run.iter().zip(results) {
                match result {
                    Ok(output) => {
                        outputs.insert(spec.id.clone(), output);
                    }
                    Err(_) => {
                        let effective = spec
                            .on_failure
                            .as_deref()
                            .and_then(FailurePolicy::parse)
                            .unwrap_or(default_policy);
                        match effective {
                            FailurePolicy::Stop => {
                                stop_all = true;
                            }
                            FailurePolicy::SkipDependents => {
                                skip_ids.extend(transitive_dependents(&spec.id, &specs));
                            }
                            FailurePolicy::Continue => {}
                        }
                    }
                }
            }
            if stop_all {
                break;
            }
        }

        // Anything never reached (stop policy or cancellation) is skipped.
        let summary = {
            let mut plans = self.plans.lock().expect("plan table poisoned");
            let plan = plans
                .get_mut(&plan_id)
                .ok_or_else(|| ToolError::internal("plan vanished during execution"))?;
            let now = now_iso();
            for task in plan.tasks.iter_mut() {
                if matches!(task.status, TaskStatus::Pending | TaskStatus::Running) {
                    task.status = TaskStatus::Skipped;
                    task.ended_at = Some(now.clone());
                }
            }
            let completed = plan
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Completed)
                .count();
            let failed = plan
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Failed)
                .count();
            let skipped = plan
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Skipped)
                .count();
            if plan.status != PlanStatus::Cancelled {
                plan.status = if failed == 0 {
                    PlanStatus::Completed
                } else {
                    PlanStatus::Failed
                };
            }
            plan.completed_at = Some(now);
            json!({
                "plan_id": plan_id,
                "status": plan.status.as_str(),
                "tasks_completed": completed,
                "tasks_failed": failed,
                "tasks_skipped": skipped,
                "duration_ms": started_ms.elapsed().as_millis() as i64,
            })
        };
        info!(plan_id = %summary["plan_id"], status = %summary["status"], "plan finished");
        self.bus.publish(topics::TOPIC_PLAN_COMPLETED, &summary);
        Ok(summary)
    }

    async fn run_task(
        &self,
        dispatcher: &Dispatcher,
        plan_id: &str,
        spec: TaskSpec,
        outputs: HashMap<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, ToolError> {
        let params = if spec.params.is_null() {
            json!({})
        } else {
            spec.params.clone()
        };
        let resolved = match templates::resolve_task_refs(&params, &outputs) {
            Ok(v) => v,
            Err(err) => {
                let msg = format!("Failed to resolve task references: {}", err.message);
                self.set_task_status(plan_id, &spec.id, TaskStatus::Failed, None, Some(msg.clone()));
                return Err(ToolError::invalid(msg));
            }
        };

        self.set_task_status(plan_id, &spec.id, TaskStatus::Running, None, None);

        let mut inv = Invocation::new(
            spec.tool_category.clone(),
            spec.tool_name.clone(),
            resolved,
            Protocol::Rest,
        );
        inv.caller.client_id = Some(format!("plan:{plan_id}"));
        let opts = DispatchOptions {
            force_hitl: spec.require_hitl,
            hitl_reason: spec.require_hitl.then(|| "plan_task_require_hitl".to_string()),
            cancel: cancel.child_token(),
        };
        match dispatcher.dispatch(inv, opts).await {
            Ok(output) => {
                self.set_task_status(
                    plan_id,
                    &spec.id,
                    TaskStatus::Completed,
                    Some(output.clone()),
                    None,
                );
                Ok(output)
            }
            Err(err) => {
                self.set_task_status(
                    plan_id,
                    &spec.id,
                    TaskStatus::Failed,
                    None,
                    Some(err.message.clone()),
                );
                Err(err)
            }
        }
    }

    /// Task-status transitions are atomic with output publication: both land
    /// under the same lock acquisition, and the bus event follows.
    fn set_task_status(
        &self,
        plan_id: &str,
        task_id: &str,
        status: TaskStatus,
        output: Option<Value>,
        error: Option<String>,
    ) {
        let event = {
            let mut plans = self.plans.lock().expect("plan table poisoned");
            let Some(plan) = plans.get_mut(plan_id) else {
                return;
            };
            let Some(task) = plan.tasks.iter_mut().find(|t| t.spec.id == task_id) else {
                return;
            };
            // Cancellation already parked this task; a late completion or
            // failure from the in-flight dispatch must not resurrect it.
            if task.status == TaskStatus::Skipped {
                return;
            }
            let now = now_iso();
            match status {
                TaskStatus::Running => task.started_at = Some(now),
                _ => task.ended_at = Some(now),
            }
            task.status = status;
            if output.is_some() {
                task.output = output;
            }
            if error.is_some() {
                task.error = error;
            }
            json!({
                "plan_id": plan_id,
                "task_id": task_id,
                "status": status.as_str(),
            })
        };
        self.bus.publish(topics::TOPIC_PLAN_TASK_UPDATED, &event);
    }

    fn plan_status(&self, plan_id: &str) -> Option<PlanStatus> {
        self.plans
            .lock()
            .expect("plan table poisoned")
            .get(plan_id)
            .map(|p| p.status)
    }

    // ------------------------------------------------------------------
    // plan.status / plan.list / plan.cancel
    // ------------------------------------------------------------------

    pub fn status(&self, plan_ref: &str) -> Result<Value, ToolError> {
        let plan_id = self.resolve_ref(plan_ref)?;
        let plans = self.plans.lock().expect("plan table poisoned");
        let plan = plans
            .get(&plan_id)
            .ok_or_else(|| ToolError::not_found(format!("Plan '{plan_id}' not found")))?;
        let tasks: Vec<Value> = plan
            .tasks
            .iter()
            .map(|t| {
                json!({
                    "id": t.spec.id,
                    "name": t.spec.name,
                    "tool_category": t.spec.tool_category,
                    "tool_name": t.spec.tool_name,
                    "status": t.status.as_str(),
                    "output": t.output,
                    "error": t.error,
                    "started_at": t.started_at,
                    "ended_at": t.ended_at,
                    "depends_on": t.spec.depends_on,
                    "execution_level": t.level,
                })
            })
            .collect();
        let count = |s: TaskStatus| plan.tasks.iter().filter(|t| t.status == s).count();
        Ok(json!({
            "plan_id": plan.id,
            "name": plan.name,
            "status": plan.status.as_str(),
            "on_failure": plan.on_failure.as_str(),
            "created_at": plan.created_at,
            "started_at": plan.started_at,
            "completed_at": plan.completed_at,
            "tasks": tasks,
            "counts": {
                "total": plan.tasks.len(),
                "completed": count(TaskStatus::Completed),
                "failed": count(TaskStatus::Failed),
                "skipped": count(TaskStatus::Skipped),
                "running": count(TaskStatus::Running),
                "pending": count(TaskStatus::Pending),
            },
        }))
    }

    pub fn list(&self) -> Value {
        let plans = self.plans.lock().expect("plan table poisoned");
        let mut items: Vec<Value> = plans
            .values()
            .map(|p| {
                json!({
                    "plan_id": p.id,
                    "name": p.name,
                    "status": p.status.as_str(),
                    "on_failure": p.on_failure.as_str(),
                    "task_count": p.tasks.len(),
                    "created_at": p.created_at,
                    "started_at": p.started_at,
                    "completed_at": p.completed_at,
                })
            })
            .collect();
        items.sort_by(|a, b| {
            b["created_at"]
                .as_str()
                .unwrap_or("")
                .cmp(a["created_at"].as_str().unwrap_or(""))
        });
        let total = items.len();
        json!({"plans": items, "total": total})
    }

    /// Cancel: pending and running tasks become `skipped`, in-flight task
    /// tokens are cancelled, the plan is `cancelled` and cannot re-execute.
    pub fn cancel(&self, plan_ref: &str) -> Result<Value, ToolError> {
        let plan_id = self.resolve_ref(plan_ref)?;
        let summary = {
            let mut plans = self.plans.lock().expect("plan table poisoned");
            let plan = plans
                .get_mut(&plan_id)
                .ok_or_else(|| ToolError::not_found(format!("Plan '{plan_id}' not found")))?;
            if matches!(plan.status, PlanStatus::Completed | PlanStatus::Cancelled) {
                return Err(ToolError::invalid(format!(
                    "Plan '{plan_id}' is already '{}' and cannot be cancelled",
                    plan.status.as_str()
                )));
            }
            plan.cancel.cancel();
            let now = now_iso();
            let mut cancelled_tasks = 0usize;
            for task in plan.tasks.iter_mut() {
                if matches!(task.status, TaskStatus::Pending | TaskStatus::Running) {
                    task.status = TaskStatus::Skipped;
                    task.ended_at = Some(now.clone());
                    cancelled_tasks += 1;
                }
            }
            plan.status = PlanStatus::Cancelled;
            plan.completed_at = Some(now);
            json!({
                "plan_id": plan_id,
                "cancelled_tasks": cancelled_tasks,
                "status": "cancelled",
            })
        };
        info!(plan_id = %summary["plan_id"], "plan cancelled");
        self.bus.publish(topics::TOPIC_PLAN_CANCELLED, &summary);
        Ok(summary)
    }
}
