//! Task registry and dependency scheduling.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::InferenceTask;

/// Registration-time configuration errors. These fail fast and never affect
/// a running session.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("task '{0}' is already registered")]
    DuplicateTask(String),

    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("task '{task}' depends on disabled task '{dependency}'")]
    DisabledDependency { task: String, dependency: String },

    #[error("dependency cycle involving tasks: {0:?}")]
    DependencyCycle(Vec<String>),

    #[error("unknown task '{0}'")]
    UnknownTask(String),

    #[error("task '{task}' is a dependency of '{dependent}'")]
    DependencyInUse { task: String, dependent: String },
}

/// Immutable description of a registered task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskDescriptor {
    pub name: String,
    pub enabled: bool,
    pub dependencies: BTreeSet<String>,
}

struct Registered {
    task: Arc<dyn InferenceTask>,
    enabled: bool,
    dependencies: BTreeSet<String>,
}

/// The per-frame execution plan derived from the registered task set.
#[derive(Clone)]
pub struct ExecutionPlan {
    /// Tasks with no dependencies, executed concurrently.
    pub parallel: Vec<Arc<dyn InferenceTask>>,
    /// Dependent tasks in topological order, executed sequentially.
    pub ordered: Vec<Arc<dyn InferenceTask>>,
    /// All active tasks in registration order, for visualization merging.
    pub draw_order: Vec<Arc<dyn InferenceTask>>,
}

impl ExecutionPlan {
    fn empty() -> Self {
        Self {
            parallel: Vec::new(),
            ordered: Vec::new(),
            draw_order: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.draw_order.is_empty()
    }
}

struct Inner {
    /// Registration order is load-bearing: it fixes visualization order and
    /// makes the topological sort deterministic.
    tasks: Vec<Registered>,
    plan: Arc<ExecutionPlan>,
}

/// Holds all registered inference tasks and their execution plan.
///
/// The plan is recomputed on every registration, unregistration, and
/// enable/disable. Disabled tasks are excluded from the plan and do not
/// satisfy other tasks' dependencies; tasks whose dependencies become
/// unsatisfied are excluded too (transitively), with a warning.
pub struct TaskRegistry {
    inner: RwLock<Inner>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                tasks: Vec::new(),
                plan: Arc::new(ExecutionPlan::empty()),
            }),
        }
    }

    /// Register a task.
    ///
    /// Every declared dependency must already be registered and enabled;
    /// violations are rejected before the task becomes active.
    pub fn register(&self, task: Arc<dyn InferenceTask>) -> Result<(), RegistryError> {
        let name = task.name().to_string();
        let dependencies: BTreeSet<String> = task.dependencies().into_iter().collect();

        let mut inner = self.inner.write();

        if inner.tasks.iter().any(|t| t.task.name() == name) {
            return Err(RegistryError::DuplicateTask(name));
        }
        for dependency in &dependencies {
            match inner.tasks.iter().find(|t| t.task.name() == *dependency) {
                None => {
                    return Err(RegistryError::UnknownDependency {
                        task: name,
                        dependency: dependency.clone(),
                    });
                }
                Some(dep) if !dep.enabled => {
                    return Err(RegistryError::DisabledDependency {
                        task: name,
                        dependency: dependency.clone(),
                    });
                }
                Some(_) => {}
            }
        }

        inner.tasks.push(Registered {
            task,
            enabled: true,
            dependencies,
        });
        let plan = compute_plan(&inner.tasks)?;
        inner.plan = Arc::new(plan);
        info!(task = %name, "task registered");
        Ok(())
    }

    /// Remove a task. Rejected while any other registered task declares it
    /// as a dependency.
    pub fn unregister(&self, name: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();

        let index = inner
            .tasks
            .iter()
            .position(|t| t.task.name() == name)
            .ok_or_else(|| RegistryError::UnknownTask(name.to_string()))?;

        if let Some(dependent) = inner
            .tasks
            .iter()
            .find(|t| t.dependencies.contains(name))
        {
            return Err(RegistryError::DependencyInUse {
                task: name.to_string(),
                dependent: dependent.task.name().to_string(),
            });
        }

        inner.tasks.remove(index);
        let plan = compute_plan(&inner.tasks)?;
        inner.plan = Arc::new(plan);
        info!(task = %name, "task unregistered");
        Ok(())
    }

    /// Enable or disable a task. Disabling excludes it and, transitively,
    /// every task depending on it from the execution plan.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();

        let entry = inner
            .tasks
            .iter_mut()
            .find(|t| t.task.name() == name)
            .ok_or_else(|| RegistryError::UnknownTask(name.to_string()))?;
        entry.enabled = enabled;

        let plan = compute_plan(&inner.tasks)?;
        inner.plan = Arc::new(plan);
        debug!(task = %name, enabled, "task availability changed");
        Ok(())
    }

    /// Snapshot of the current execution plan.
    pub fn plan(&self) -> Arc<ExecutionPlan> {
        self.inner.read().plan.clone()
    }

    /// Descriptors for all registered tasks, in registration order.
    pub fn descriptors(&self) -> Vec<TaskDescriptor> {
        self.inner
            .read()
            .tasks
            .iter()
            .map(|t| TaskDescriptor {
                name: t.task.name().to_string(),
                enabled: t.enabled,
                dependencies: t.dependencies.clone(),
            })
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().tasks.iter().any(|t| t.task.name() == name)
    }
}

/// Compute the parallel batch and topological ordering for the active task
/// set, validating against cycles.
fn compute_plan(tasks: &[Registered]) -> Result<ExecutionPlan, RegistryError> {
    // Active = enabled with all dependencies transitively satisfiable.
    let mut active: HashSet<&str> = tasks
        .iter()
        .filter(|t| t.enabled)
        .map(|t| t.task.name())
        .collect();
    loop {
        let before = active.len();
        let snapshot = active.clone();
        active.retain(|name| {
            let entry = tasks.iter().find(|t| t.task.name() == *name);
            entry
                .map(|t| t.dependencies.iter().all(|d| snapshot.contains(d.as_str())))
                .unwrap_or(false)
        });
        if active.len() == before {
            break;
        }
    }
    for t in tasks {
        if t.enabled && !active.contains(t.task.name()) {
            warn!(
                task = %t.task.name(),
                "task excluded from plan: dependency disabled or excluded"
            );
        }
    }

    let mut parallel = Vec::new();
    let mut dependent: Vec<&Registered> = Vec::new();
    for t in tasks {
        if !active.contains(t.task.name()) {
            continue;
        }
        if t.dependencies.is_empty() {
            parallel.push(t.task.clone());
        } else {
            dependent.push(t);
        }
    }

    // Kahn's algorithm over the dependent subset. Dependencies met by the
    // parallel batch count as already satisfied.
    let dependent_names: HashSet<&str> = dependent.iter().map(|t| t.task.name()).collect();
    let mut indegree: Vec<usize> = dependent
        .iter()
        .map(|t| {
            t.dependencies
                .iter()
                .filter(|d| dependent_names.contains(d.as_str()))
                .count()
        })
        .collect();

    let mut queue: VecDeque<usize> = indegree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| i)
        .collect();
    let mut ordered = Vec::with_capacity(dependent.len());
    while let Some(index) = queue.pop_front() {
        let ready = dependent[index];
        ordered.push(ready.task.clone());
        let ready_name = ready.task.name();
        for (i, t) in dependent.iter().enumerate() {
            if t.dependencies.contains(ready_name) {
                indegree[i] -= 1;
                if indegree[i] == 0 {
                    queue.push_back(i);
                }
            }
        }
    }

    if ordered.len() != dependent.len() {
        let ordered_names: HashSet<String> =
            ordered.iter().map(|t| t.name().to_string()).collect();
        let cycle: Vec<String> = dependent
            .iter()
            .map(|t| t.task.name().to_string())
            .filter(|n| !ordered_names.contains(n))
            .collect();
        return Err(RegistryError::DependencyCycle(cycle));
    }

    let draw_order = tasks
        .iter()
        .filter(|t| active.contains(t.task.name()))
        .map(|t| t.task.clone())
        .collect();

    Ok(ExecutionPlan {
        parallel,
        ordered,
        draw_order,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Canvas, FrameContext, FrameImage, TaskResult};
    use serde_json::Map;

    struct StubTask {
        name: &'static str,
        deps: Vec<String>,
    }

    impl StubTask {
        fn new(name: &'static str, deps: &[&str]) -> Arc<dyn InferenceTask> {
            Arc::new(Self {
                name,
                deps: deps.iter().map(|s| s.to_string()).collect(),
            })
        }
    }

    impl InferenceTask for StubTask {
        fn name(&self) -> &str {
            self.name
        }

        fn dependencies(&self) -> Vec<String> {
            self.deps.clone()
        }

        fn infer(&self, _image: &FrameImage, _context: &FrameContext) -> TaskResult {
            TaskResult::ok(Map::new())
        }

        fn visualize(&self, _canvas: &mut Canvas, _result: &TaskResult) {}
    }

    #[test]
    fn splits_parallel_batch_and_ordered_remainder() {
        let registry = TaskRegistry::new();
        registry.register(StubTask::new("a", &[])).unwrap();
        registry.register(StubTask::new("b", &[])).unwrap();
        registry.register(StubTask::new("c", &["a"])).unwrap();
        registry.register(StubTask::new("d", &["c", "b"])).unwrap();

        let plan = registry.plan();
        let parallel: Vec<_> = plan.parallel.iter().map(|t| t.name()).collect();
        let ordered: Vec<_> = plan.ordered.iter().map(|t| t.name()).collect();
        assert_eq!(parallel, vec!["a", "b"]);
        assert_eq!(ordered, vec!["c", "d"]);
        let draw: Vec<_> = plan.draw_order.iter().map(|t| t.name()).collect();
        assert_eq!(draw, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn rejects_unknown_dependency() {
        let registry = TaskRegistry::new();
        let err = registry
            .register(StubTask::new("motion", &["detect"]))
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::UnknownDependency {
                task: "motion".into(),
                dependency: "detect".into(),
            }
        );
        // Neither a plan entry nor a registration remains.
        assert!(!registry.contains("motion"));
        assert!(registry.plan().is_empty());
    }

    #[test]
    fn mutual_dependency_cannot_be_registered() {
        let registry = TaskRegistry::new();
        // A depends on B, which is not yet registered: rejected.
        assert!(registry.register(StubTask::new("a", &["b"])).is_err());
        // B depends on A likewise. Neither task becomes active.
        assert!(registry.register(StubTask::new("b", &["a"])).is_err());
        assert!(registry.plan().is_empty());
    }

    #[test]
    fn rejects_duplicate_names() {
        let registry = TaskRegistry::new();
        registry.register(StubTask::new("detect", &[])).unwrap();
        assert_eq!(
            registry.register(StubTask::new("detect", &[])).unwrap_err(),
            RegistryError::DuplicateTask("detect".into())
        );
    }

    #[test]
    fn rejects_dependency_on_disabled_task() {
        let registry = TaskRegistry::new();
        registry.register(StubTask::new("detect", &[])).unwrap();
        registry.set_enabled("detect", false).unwrap();
        let err = registry
            .register(StubTask::new("motion", &["detect"]))
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::DisabledDependency {
                task: "motion".into(),
                dependency: "detect".into(),
            }
        );
    }

    #[test]
    fn disabling_excludes_dependents_transitively() {
        let registry = TaskRegistry::new();
        registry.register(StubTask::new("a", &[])).unwrap();
        registry.register(StubTask::new("b", &["a"])).unwrap();
        registry.register(StubTask::new("c", &["b"])).unwrap();

        registry.set_enabled("a", false).unwrap();
        assert!(registry.plan().is_empty());

        registry.set_enabled("a", true).unwrap();
        let plan = registry.plan();
        assert_eq!(plan.parallel.len(), 1);
        assert_eq!(plan.ordered.len(), 2);
    }

    #[test]
    fn unregister_rejected_while_depended_upon() {
        let registry = TaskRegistry::new();
        registry.register(StubTask::new("detect", &[])).unwrap();
        registry.register(StubTask::new("motion", &["detect"])).unwrap();

        let err = registry.unregister("detect").unwrap_err();
        assert_eq!(
            err,
            RegistryError::DependencyInUse {
                task: "detect".into(),
                dependent: "motion".into(),
            }
        );

        registry.unregister("motion").unwrap();
        registry.unregister("detect").unwrap();
        assert!(registry.plan().is_empty());
    }

    #[test]
    fn descriptors_reflect_registration_order() {
        let registry = TaskRegistry::new();
        registry.register(StubTask::new("b", &[])).unwrap();
        registry.register(StubTask::new("a", &["b"])).unwrap();
        let descriptors = registry.descriptors();
        assert_eq!(descriptors[0].name, "b");
        assert_eq!(descriptors[1].name, "a");
        assert!(descriptors[1].dependencies.contains("b"));
    }
}
