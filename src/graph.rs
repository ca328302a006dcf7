use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::tasks::{Priority, Task, TaskId, TaskStatus};

// ── Node model ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Waiting on at least one unfinished dependency.
    Pending,
    /// All dependencies finished; eligible for dispatch.
    Ready,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct TaskNode {
    pub id: TaskId,
    pub priority: Priority,
    pub state: NodeState,
    /// Count of unfinished predecessors.
    in_degree: usize,
    /// Tasks waiting on this one.
    dependents: Vec<TaskId>,
    depends_on: Vec<TaskId>,
}

/// Execution-state DAG over the plan's tasks. The plan definition stays in
/// the task store; this graph only tracks what is runnable, running and done.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: HashMap<TaskId, TaskNode>,
}

impl DependencyGraph {
    /// Build the graph, validating that every dependency target exists and
    /// that the graph is acyclic. Tasks already COMPLETED in the plan seed as
    /// COMPLETED and do not hold their dependents back.
    pub fn new<'a, I>(tasks: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a Task>,
    {
        let tasks: Vec<&Task> = tasks.into_iter().collect();
        let ids: HashSet<TaskId> = tasks.iter().map(|t| t.id).collect();

        for task in &tasks {
            for dep in &task.depends_on {
                if !ids.contains(dep) {
                    anyhow::bail!("Task {} depends on unknown task {}", task.id, dep);
                }
            }
        }
        detect_cycle(&tasks)?;

        let mut nodes: HashMap<TaskId, TaskNode> = tasks
            .iter()
            .map(|t| {
                (
                    t.id,
                    TaskNode {
                        id: t.id,
                        priority: t.priority,
                        state: NodeState::Pending,
                        in_degree: 0,
                        dependents: Vec::new(),
                        depends_on: t.depends_on.clone(),
                    },
                )
            })
            .collect();

        let completed: HashSet<TaskId> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id)
            .collect();

        for task in &tasks {
            for dep in &task.depends_on {
                nodes
                    .get_mut(dep)
                    .expect("validated above")
                    .dependents
                    .push(task.id);
                if !completed.contains(dep) {
                    nodes.get_mut(&task.id).expect("own node").in_degree += 1;
                }
            }
        }

        for node in nodes.values_mut() {
            node.state = if completed.contains(&node.id) {
                NodeState::Completed
            } else if node.in_degree == 0 {
                NodeState::Ready
            } else {
                NodeState::Pending
            };
        }

        Ok(Self { nodes })
    }

    pub fn node(&self, id: TaskId) -> Option<&TaskNode> {
        self.nodes.get(&id)
    }

    /// Current READY nodes, ordered by priority then ascending id.
    pub fn ready(&self) -> Vec<TaskId> {
        let mut ready: Vec<&TaskNode> = self
            .nodes
            .values()
            .filter(|n| n.state == NodeState::Ready)
            .collect();
        ready.sort_by_key(|n| (n.priority, n.id));
        ready.iter().map(|n| n.id).collect()
    }

    pub fn mark_running(&mut self, id: TaskId) -> Result<()> {
        let node = self
            .nodes
            .get_mut(&id)
            .with_context(|| format!("Unknown task {id} in graph"))?;
        if node.state != NodeState::Ready {
            anyhow::bail!("Task {id} is not READY (state {:?})", node.state);
        }
        node.state = NodeState::Running;
        Ok(())
    }

    /// Complete a node and release any dependents whose last unfinished
    /// predecessor this was.
    pub fn mark_complete(&mut self, id: TaskId) -> Result<()> {
        let dependents = {
            let node = self
                .nodes
                .get_mut(&id)
                .with_context(|| format!("Unknown task {id} in graph"))?;
            node.state = NodeState::Completed;
            node.dependents.clone()
        };
        for dep_id in dependents {
            let dependent = self.nodes.get_mut(&dep_id).expect("dependent exists");
            dependent.in_degree = dependent.in_degree.saturating_sub(1);
            if dependent.in_degree == 0 && dependent.state == NodeState::Pending {
                dependent.state = NodeState::Ready;
            }
        }
        Ok(())
    }

    /// Fail a node. Its dependents keep a nonzero in-degree and therefore
    /// never become READY; the caller decides continue vs fail-fast.
    pub fn mark_failed(&mut self, id: TaskId) -> Result<()> {
        let node = self
            .nodes
            .get_mut(&id)
            .with_context(|| format!("Unknown task {id} in graph"))?;
        node.state = NodeState::Failed;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.nodes
            .values()
            .all(|n| n.state == NodeState::Completed)
    }

    pub fn has_failures(&self) -> bool {
        self.nodes.values().any(|n| n.state == NodeState::Failed)
    }

    /// Tasks that can never run because a (transitive) dependency failed.
    pub fn stranded(&self) -> Vec<TaskId> {
        let mut stranded: Vec<TaskId> = self
            .nodes
            .values()
            .filter(|n| n.state == NodeState::Pending)
            .filter(|n| self.blocked_by_failure(n))
            .map(|n| n.id)
            .collect();
        stranded.sort();
        stranded
    }

    fn blocked_by_failure(&self, node: &TaskNode) -> bool {
        node.depends_on.iter().any(|dep| {
            self.nodes.get(dep).is_some_and(|d| {
                d.state == NodeState::Failed
                    || (d.state == NodeState::Pending && self.blocked_by_failure(d))
            })
        })
    }

    /// Kahn's algorithm over the full structure. Errors if not every node is
    /// consumed (a residual cycle).
    pub fn topological_sort(&self) -> Result<Vec<TaskId>> {
        let mut in_degree: HashMap<TaskId, usize> = self
            .nodes
            .values()
            .map(|n| (n.id, n.depends_on.len()))
            .collect();

        let mut queue: VecDeque<TaskId> = sorted_by_priority(
            self.nodes.values(),
            |n| in_degree[&n.id] == 0,
        )
        .into();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = queue.pop_front() {
            order.push(id);
            for dep_id in &self.nodes[&id].dependents {
                let remaining = in_degree.get_mut(dep_id).expect("dependent exists");
                *remaining -= 1;
                if *remaining == 0 {
                    queue.push_back(*dep_id);
                }
            }
        }

        if order.len() != self.nodes.len() {
            anyhow::bail!("circular dependency detected");
        }
        Ok(order)
    }

    /// Peel the structure into batches: each batch is a maximal set of
    /// mutually-independent tasks runnable after the previous batch. Within a
    /// batch, ordering is by priority then ascending id.
    pub fn batches(&self) -> Vec<Vec<TaskId>> {
        let mut in_degree: HashMap<TaskId, usize> = self
            .nodes
            .values()
            .map(|n| (n.id, n.depends_on.len()))
            .collect();
        let mut remaining: HashSet<TaskId> = self.nodes.keys().copied().collect();
        let mut batches = Vec::new();

        while !remaining.is_empty() {
            let batch = sorted_by_priority(
                self.nodes.values().filter(|n| remaining.contains(&n.id)),
                |n| in_degree[&n.id] == 0,
            );
            if batch.is_empty() {
                // Construction rejects cycles, so this cannot happen; stop
                // rather than loop forever if it somehow does.
                break;
            }
            for id in &batch {
                remaining.remove(id);
                for dep_id in &self.nodes[id].dependents {
                    if let Some(remaining_degree) = in_degree.get_mut(dep_id) {
                        *remaining_degree = remaining_degree.saturating_sub(1);
                    }
                }
            }
            batches.push(batch);
        }
        batches
    }
}

fn sorted_by_priority<'a, I>(nodes: I, keep: impl Fn(&TaskNode) -> bool) -> Vec<TaskId>
where
    I: Iterator<Item = &'a TaskNode>,
{
    let mut picked: Vec<&TaskNode> = nodes.filter(|n| keep(n)).collect();
    picked.sort_by_key(|n| (n.priority, n.id));
    picked.iter().map(|n| n.id).collect()
}

/// DFS with an explicit recursion stack; a back edge names a task on the
/// cycle in the error message.
fn detect_cycle(tasks: &[&Task]) -> Result<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let adjacency: HashMap<TaskId, &[TaskId]> = tasks
        .iter()
        .map(|t| (t.id, t.depends_on.as_slice()))
        .collect();
    let mut color: HashMap<TaskId, Color> = tasks.iter().map(|t| (t.id, Color::White)).collect();

    fn visit(
        id: TaskId,
        adjacency: &HashMap<TaskId, &[TaskId]>,
        color: &mut HashMap<TaskId, Color>,
    ) -> Result<()> {
        color.insert(id, Color::Gray);
        for &dep in adjacency.get(&id).copied().unwrap_or_default() {
            match color.get(&dep) {
                Some(Color::Gray) => {
                    anyhow::bail!("circular dependency detected involving {dep}")
                }
                Some(Color::White) => visit(dep, adjacency, color)?,
                _ => {}
            }
        }
        color.insert(id, Color::Black);
        Ok(())
    }

    let mut ids: Vec<TaskId> = tasks.iter().map(|t| t.id).collect();
    ids.sort();
    for id in ids {
        if color[&id] == Color::White {
            visit(id, &adjacency, &mut color)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::FeatureId;

    fn task(id: u16, priority: Priority, status: TaskStatus, deps: &[u16]) -> Task {
        Task {
            id: TaskId(id),
            feature: FeatureId(1),
            name: format!("task {id}"),
            status,
            priority,
            estimated_effort: None,
            description: String::new(),
            technical_details: String::new(),
            files_to_touch: vec![],
            depends_on: deps.iter().map(|d| TaskId(*d)).collect(),
            success_criteria: vec![],
            parallelizable: true,
            exclusive_files: vec![],
        }
    }

    fn diamond() -> Vec<Task> {
        vec![
            task(1, Priority::P2, TaskStatus::NotStarted, &[]),
            task(2, Priority::P2, TaskStatus::NotStarted, &[1]),
            task(3, Priority::P2, TaskStatus::NotStarted, &[1]),
            task(4, Priority::P2, TaskStatus::NotStarted, &[2, 3]),
        ]
    }

    #[test]
    fn unknown_dependency_is_rejected_at_load() {
        let tasks = vec![task(1, Priority::P2, TaskStatus::NotStarted, &[9])];
        let err = DependencyGraph::new(&tasks).expect_err("should reject");
        assert!(err.to_string().contains("unknown task T009"), "got: {err}");
    }

    #[test]
    fn two_task_cycle_is_rejected() {
        let tasks = vec![
            task(1, Priority::P2, TaskStatus::NotStarted, &[2]),
            task(2, Priority::P2, TaskStatus::NotStarted, &[1]),
        ];
        let err = DependencyGraph::new(&tasks).expect_err("should reject");
        assert!(
            err.to_string().contains("circular dependency detected"),
            "got: {err}"
        );
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let tasks = vec![task(1, Priority::P2, TaskStatus::NotStarted, &[1])];
        assert!(DependencyGraph::new(&tasks).is_err());
    }

    #[test]
    fn roots_start_ready_and_dependents_pending() {
        let tasks = diamond();
        let graph = DependencyGraph::new(&tasks).expect("build");

        assert_eq!(graph.ready(), vec![TaskId(1)]);
        assert_eq!(graph.node(TaskId(4)).expect("node").state, NodeState::Pending);
    }

    #[test]
    fn completed_plan_tasks_seed_completed_and_release_dependents() {
        let tasks = vec![
            task(1, Priority::P2, TaskStatus::Completed, &[]),
            task(2, Priority::P2, TaskStatus::NotStarted, &[1]),
        ];
        let graph = DependencyGraph::new(&tasks).expect("build");

        assert_eq!(graph.node(TaskId(1)).expect("node").state, NodeState::Completed);
        assert_eq!(graph.ready(), vec![TaskId(2)]);
    }

    #[test]
    fn mark_complete_releases_dependents_when_last_dep_finishes() {
        let tasks = diamond();
        let mut graph = DependencyGraph::new(&tasks).expect("build");

        graph.mark_running(TaskId(1)).expect("run T001");
        graph.mark_complete(TaskId(1)).expect("complete T001");
        assert_eq!(graph.ready(), vec![TaskId(2), TaskId(3)]);

        graph.mark_running(TaskId(2)).expect("run T002");
        graph.mark_complete(TaskId(2)).expect("complete T002");
        assert!(graph.ready().contains(&TaskId(3)));
        assert!(!graph.ready().contains(&TaskId(4)), "T004 still waits on T003");

        graph.mark_running(TaskId(3)).expect("run T003");
        graph.mark_complete(TaskId(3)).expect("complete T003");
        assert_eq!(graph.ready(), vec![TaskId(4)]);
    }

    #[test]
    fn mark_running_requires_ready() {
        let tasks = diamond();
        let mut graph = DependencyGraph::new(&tasks).expect("build");
        assert!(graph.mark_running(TaskId(4)).is_err());
    }

    #[test]
    fn failed_dependency_strands_dependents_forever() {
        let tasks = diamond();
        let mut graph = DependencyGraph::new(&tasks).expect("build");

        graph.mark_running(TaskId(1)).expect("run T001");
        graph.mark_failed(TaskId(1)).expect("fail T001");

        assert!(graph.ready().is_empty());
        assert!(graph.has_failures());
        assert!(!graph.is_complete());
        assert_eq!(
            graph.stranded(),
            vec![TaskId(2), TaskId(3), TaskId(4)],
            "transitive dependents are stranded too"
        );
    }

    #[test]
    fn topological_sort_respects_edges() {
        let tasks = diamond();
        let graph = DependencyGraph::new(&tasks).expect("build");
        let order = graph.topological_sort().expect("sort");

        let position = |id: u16| order.iter().position(|t| *t == TaskId(id)).expect("present");
        assert_eq!(order.len(), 4);
        assert!(position(1) < position(2));
        assert!(position(1) < position(3));
        assert!(position(2) < position(4));
        assert!(position(3) < position(4));
    }

    #[test]
    fn batches_cover_all_tasks_in_dependency_order() {
        let tasks = diamond();
        let graph = DependencyGraph::new(&tasks).expect("build");

        let batches = graph.batches();
        assert_eq!(
            batches,
            vec![
                vec![TaskId(1)],
                vec![TaskId(2), TaskId(3)],
                vec![TaskId(4)]
            ]
        );

        // Every edge crosses a batch boundary forward.
        let batch_of = |id: TaskId| {
            batches
                .iter()
                .position(|b| b.contains(&id))
                .expect("task in some batch")
        };
        for t in &tasks {
            for dep in &t.depends_on {
                assert!(batch_of(*dep) < batch_of(t.id));
            }
        }
    }

    #[test]
    fn batch_order_is_priority_then_id() {
        let tasks = vec![
            task(5, Priority::P3, TaskStatus::NotStarted, &[]),
            task(2, Priority::P1, TaskStatus::NotStarted, &[]),
            task(9, Priority::P1, TaskStatus::NotStarted, &[]),
        ];
        let graph = DependencyGraph::new(&tasks).expect("build");
        assert_eq!(
            graph.batches()[0],
            vec![TaskId(2), TaskId(9), TaskId(5)],
            "P1 before P3, id ascending within a priority"
        );
    }

    #[test]
    fn is_complete_after_all_nodes_finish() {
        let tasks = vec![
            task(1, Priority::P2, TaskStatus::NotStarted, &[]),
            task(2, Priority::P2, TaskStatus::NotStarted, &[1]),
        ];
        let mut graph = DependencyGraph::new(&tasks).expect("build");

        graph.mark_running(TaskId(1)).expect("run");
        graph.mark_complete(TaskId(1)).expect("complete");
        graph.mark_running(TaskId(2)).expect("run");
        graph.mark_complete(TaskId(2)).expect("complete");

        assert!(graph.is_complete());
        assert!(!graph.has_failures());
    }
}
