//! Work sources
//!
//! A work source file describes what to rent (`demand`) and what to run on
//! it (`tasks`). Tasks are handed out one at a time; a task that failed goes
//! back to the queue until it completes or runs out of attempts.

use crate::error::{TaskError, TaskResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use requestor_types::{Command, DemandData, Properties, Script, TaskId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

/// Image repository used when the work source names no image url
pub const DEFAULT_REPOSITORY_URL: &str = "http://girepo.dev.golem.network:8000";

/// One unit of work: a script executed as a single batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    pub commands: Vec<Command>,
}

impl TaskSpec {
    pub fn script(&self) -> Script {
        self.commands
            .iter()
            .cloned()
            .fold(Script::new(), |script, command| script.with(command))
    }
}

/// What to rent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemandSpec {
    /// sha3 hash of the VM image
    pub image_hash: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub subnet_tag: Option<String>,
    #[serde(default = "default_min_mem_gib")]
    pub min_mem_gib: f64,
    #[serde(default = "default_min_storage_gib")]
    pub min_storage_gib: f64,
    #[serde(default = "default_min_cpu_threads")]
    pub min_cpu_threads: u32,
    /// Extra demand properties, copied verbatim
    #[serde(default)]
    pub properties: Properties,
}

fn default_min_mem_gib() -> f64 {
    0.5
}

fn default_min_storage_gib() -> f64 {
    2.0
}

fn default_min_cpu_threads() -> u32 {
    1
}

impl DemandSpec {
    pub fn package_url(&self) -> String {
        let image_url = self.image_url.clone().unwrap_or_else(|| {
            format!("{}/image.{}.gvmi", DEFAULT_REPOSITORY_URL, self.image_hash)
        });
        format!("hash:sha3:{}:{}", self.image_hash, image_url)
    }

    /// Demand properties and constraints. A subnet tag given here wins over
    /// `default_subnet`.
    pub fn to_demand(&self, expiration: DateTime<Utc>, default_subnet: Option<&str>) -> DemandData {
        let mut properties = self.properties.clone();
        properties.insert("golem.srv.comp.expiration".into(), json!(expiration.timestamp_millis()));
        properties.insert("golem.srv.comp.task_package".into(), json!(self.package_url()));
        properties.insert("golem.srv.comp.vm.package_format".into(), json!("gvmkit-squash"));

        let mut constraints = vec![
            "(golem.runtime.name=vm)".to_string(),
            format!("(golem.inf.mem.gib>={})", self.min_mem_gib),
            format!("(golem.inf.storage.gib>={})", self.min_storage_gib),
            format!("(golem.inf.cpu.threads>={})", self.min_cpu_threads),
        ];
        for capability in &self.capabilities {
            constraints.push(format!("(golem.runtime.capabilities={})", capability));
        }
        if let Some(subnet) = self.subnet_tag.as_deref().or(default_subnet) {
            properties.insert("golem.node.debug.subnet".into(), json!(subnet));
            constraints.push(format!("(golem.node.debug.subnet={})", subnet));
        }

        DemandData {
            properties,
            constraints: format!("(&{})", constraints.join("\n\t")),
        }
    }
}

/// Contents of a work source file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkSource {
    pub demand: DemandSpec,
    pub tasks: Vec<TaskSpec>,
}

impl WorkSource {
    /// Parse a YAML or JSON document. JSON is tried for `.json` files only.
    pub fn from_path(path: &Path) -> TaskResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if is_json {
            Self::from_json(&content)
        } else {
            Self::from_yaml(&content)
        }
    }

    pub fn from_yaml(content: &str) -> TaskResult<Self> {
        let source: Self = serde_yaml::from_str(content).map_err(|e| TaskError::InvalidSource(e.to_string()))?;
        source.validate()
    }

    pub fn from_json(content: &str) -> TaskResult<Self> {
        let source: Self = serde_json::from_str(content).map_err(|e| TaskError::InvalidSource(e.to_string()))?;
        source.validate()
    }

    fn validate(self) -> TaskResult<Self> {
        if self.demand.image_hash.trim().is_empty() {
            return Err(TaskError::InvalidSource("demand.image_hash is empty".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for task in &self.tasks {
            if !seen.insert(task.id.clone()) {
                return Err(TaskError::InvalidSource(format!("duplicate task id {}", task.id)));
            }
            task.script()
                .validate()
                .map_err(|e| TaskError::InvalidSource(format!("task {}: {}", task.id, e)))?;
        }
        Ok(self)
    }
}

/// Supplier of tasks to the worker pool
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Next task to run. Waits while the queue is empty but tasks are still
    /// in flight; `None` once everything is done.
    async fn next(&self) -> Option<TaskSpec>;

    /// Hand a failed task back for another attempt. Returns false when the
    /// task ran out of attempts and was dropped.
    async fn requeue(&self, task: TaskSpec) -> bool;

    /// Mark a task handed out by `next` as done
    async fn complete(&self, task: &TaskId);

    /// Tasks queued or in flight
    async fn remaining(&self) -> usize;
}

#[derive(Debug, Default)]
struct Queue {
    pending: VecDeque<TaskSpec>,
    in_flight: HashMap<TaskId, u32>,
    attempts: HashMap<TaskId, u32>,
    dropped: Vec<TaskId>,
}

/// In-memory FIFO task source
#[derive(Debug)]
pub struct QueueTaskSource {
    queue: Mutex<Queue>,
    changed: Notify,
    max_attempts: u32,
}

impl QueueTaskSource {
    pub fn new(tasks: impl IntoIterator<Item = TaskSpec>, max_attempts: u32) -> Self {
        Self {
            queue: Mutex::new(Queue {
                pending: tasks.into_iter().collect(),
                ..Queue::default()
            }),
            changed: Notify::new(),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Tasks given up on after exhausting their attempts
    pub async fn dropped(&self) -> Vec<TaskId> {
        self.queue.lock().await.dropped.clone()
    }
}

#[async_trait]
impl TaskSource for QueueTaskSource {
    async fn next(&self) -> Option<TaskSpec> {
        loop {
            let notified = {
                let mut queue = self.queue.lock().await;
                if let Some(task) = queue.pending.pop_front() {
                    let attempt = {
                        let attempts = queue.attempts.entry(task.id.clone()).or_insert(0);
                        *attempts += 1;
                        *attempts
                    };
                    queue.in_flight.insert(task.id.clone(), attempt);
                    debug!(task_id = %task.id, attempt, "Task handed out");
                    return Some(task);
                }
                if queue.in_flight.is_empty() {
                    return None;
                }
                let notified = self.changed.notified();
                drop(queue);
                notified
            };
            notified.await;
        }
    }

    async fn requeue(&self, task: TaskSpec) -> bool {
        let requeued = {
            let mut queue = self.queue.lock().await;
            let attempt = queue.in_flight.remove(&task.id).unwrap_or(0);
            if attempt >= self.max_attempts {
                warn!(task_id = %task.id, attempts = attempt, "Task dropped after too many attempts");
                queue.dropped.push(task.id);
                false
            } else {
                queue.pending.push_back(task);
                true
            }
        };
        self.changed.notify_waiters();
        requeued
    }

    async fn complete(&self, task: &TaskId) {
        self.queue.lock().await.in_flight.remove(task);
        self.changed.notify_waiters();
    }

    async fn remaining(&self) -> usize {
        let queue = self.queue.lock().await;
        queue.pending.len() + queue.in_flight.len()
    }
}
