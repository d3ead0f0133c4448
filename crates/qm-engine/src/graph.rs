use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use qm_core::TaskId;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("duplicate task id: `{0}`")]
    DuplicateTask(TaskId),
    #[error("task `{task}` depends on unknown task `{dep}`")]
    UnknownDependency { task: TaskId, dep: TaskId },
    #[error("dependency cycle involving: {0:?}")]
    Cycle(Vec<TaskId>),
}

// ---------------------------------------------------------------------------
// TaskSpec
// ---------------------------------------------------------------------------

/// The scheduler's view of one task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub id: TaskId,
    pub name: String,
    pub agent: String,
    pub depends_on: Vec<TaskId>,
    pub timeout: Duration,
}

// ---------------------------------------------------------------------------
// TaskGraph
// ---------------------------------------------------------------------------

/// A validated task DAG: every dependency references a task in the set and
/// the closure is acyclic.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    tasks: BTreeMap<TaskId, TaskSpec>,
    /// Forward edges: task -> tasks that depend on it.
    dependents: BTreeMap<TaskId, Vec<TaskId>>,
    /// Dependency count in the original graph.
    in_degree: BTreeMap<TaskId, usize>,
}

impl TaskGraph {
    /// Build and validate; rejects duplicates, dangling deps, and cycles.
    pub fn build(specs: Vec<TaskSpec>) -> Result<Self, GraphError> {
        let mut tasks: BTreeMap<TaskId, TaskSpec> = BTreeMap::new();
        for spec in specs {
            if tasks.insert(spec.id.clone(), spec.clone()).is_some() {
                return Err(GraphError::DuplicateTask(spec.id));
            }
        }

        let mut dependents: BTreeMap<TaskId, Vec<TaskId>> =
            tasks.keys().map(|id| (id.clone(), Vec::new())).collect();
        let mut in_degree: BTreeMap<TaskId, usize> =
            tasks.keys().map(|id| (id.clone(), 0)).collect();

        for spec in tasks.values() {
            for dep in &spec.depends_on {
                if !tasks.contains_key(dep) {
                    return Err(GraphError::UnknownDependency {
                        task: spec.id.clone(),
                        dep: dep.clone(),
                    });
                }
                dependents.get_mut(dep).expect("dep present").push(spec.id.clone());
                *in_degree.get_mut(&spec.id).expect("task present") += 1;
            }
        }

        // Kahn's algorithm: if a topological pass cannot consume every node,
        // the leftovers form (or feed) a cycle.
        let mut remaining = in_degree.clone();
        let mut queue: VecDeque<TaskId> = remaining
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| id.clone())
            .collect();
        let mut visited = 0usize;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for dependent in &dependents[&id] {
                let d = remaining.get_mut(dependent).expect("dependent present");
                *d -= 1;
                if *d == 0 {
                    queue.push_back(dependent.clone());
                }
            }
        }
        if visited < tasks.len() {
            let cyclic: Vec<TaskId> = remaining
                .into_iter()
                .filter(|(_, d)| *d > 0)
                .map(|(id, _)| id)
                .collect();
            return Err(GraphError::Cycle(cyclic));
        }

        Ok(Self {
            tasks,
            dependents,
            in_degree,
        })
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: &TaskId) -> Option<&TaskSpec> {
        self.tasks.get(id)
    }

    /// Iterate tasks in id order.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskSpec> {
        self.tasks.values()
    }

    pub fn dependents(&self, id: &TaskId) -> &[TaskId] {
        self.dependents.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Dependency count in the original graph (scheduler tie-break key).
    pub fn in_degree(&self, id: &TaskId) -> usize {
        self.in_degree.get(id).copied().unwrap_or(0)
    }

    /// Strict descendants of `id` (everything transitively depending on it).
    pub fn descendants(&self, id: &TaskId) -> BTreeSet<TaskId> {
        let mut out = BTreeSet::new();
        let mut stack: Vec<TaskId> = self.dependents(id).to_vec();
        while let Some(next) = stack.pop() {
            if out.insert(next.clone()) {
                stack.extend(self.dependents(&next).iter().cloned());
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str, deps: &[&str]) -> TaskSpec {
        TaskSpec {
            id: TaskId::new(id),
            name: id.to_string(),
            agent: "claude".to_string(),
            depends_on: deps.iter().map(|d| TaskId::new(*d)).collect(),
            timeout: Duration::from_secs(600),
        }
    }

    #[test]
    fn builds_a_diamond() {
        let g = TaskGraph::build(vec![
            spec("a", &[]),
            spec("b", &["a"]),
            spec("c", &["a"]),
            spec("d", &["b", "c"]),
        ])
        .unwrap();
        assert_eq!(g.len(), 4);
        assert_eq!(g.in_degree(&TaskId::new("a")), 0);
        assert_eq!(g.in_degree(&TaskId::new("d")), 2);
        let mut deps = g.dependents(&TaskId::new("a")).to_vec();
        deps.sort();
        assert_eq!(deps, vec![TaskId::new("b"), TaskId::new("c")]);
    }

    #[test]
    fn empty_graph_is_fine() {
        let g = TaskGraph::build(vec![]).unwrap();
        assert!(g.is_empty());
    }

    #[test]
    fn rejects_self_cycle() {
        let err = TaskGraph::build(vec![spec("a", &["a"])]).unwrap_err();
        assert!(matches!(err, GraphError::Cycle(_)));
    }

    #[test]
    fn rejects_longer_cycle() {
        let err = TaskGraph::build(vec![
            spec("a", &["c"]),
            spec("b", &["a"]),
            spec("c", &["b"]),
        ])
        .unwrap_err();
        match err {
            GraphError::Cycle(ids) => assert_eq!(ids.len(), 3),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_dependency() {
        let err = TaskGraph::build(vec![spec("a", &["ghost"])]).unwrap_err();
        assert!(matches!(err, GraphError::UnknownDependency { .. }));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let err = TaskGraph::build(vec![spec("a", &[]), spec("a", &[])]).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateTask(_)));
    }

    #[test]
    fn descendants_are_strict_and_transitive() {
        let g = TaskGraph::build(vec![
            spec("a", &[]),
            spec("b", &["a"]),
            spec("c", &["b"]),
            spec("x", &[]),
        ])
        .unwrap();
        let desc = g.descendants(&TaskId::new("a"));
        assert_eq!(
            desc.into_iter().collect::<Vec<_>>(),
            vec![TaskId::new("b"), TaskId::new("c")]
        );
        assert!(g.descendants(&TaskId::new("c")).is_empty());
    }
}
