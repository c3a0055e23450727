//! Dependency-aware session queue for the implementation phase.
//!
//! Sessions form a DAG (validated at construction). The queue releases a
//! session once every dependency has reached a *terminal* state: completed
//! **or** blocked. Releasing on blocked dependencies is deliberate: a single
//! unfixable task must not stall the whole pipeline behind it. Dependants of
//! blocked work usually still produce useful partial results, and the run
//! report makes the gap visible.
//!
//! Batch selection additionally enforces file-disjointness so that no two
//! concurrently-running sessions write the same path.

pub mod plan;

use crate::errors::QueueError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Step complexity, as declared by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    #[default]
    Moderate,
    Complex,
}

/// One unit of agent work inside a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

/// The unit dispatched to the implementation phase. `files` is the union of
/// the step file claims and is what batch selection keys on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub files: BTreeSet<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Session {
    /// True when this session's files are disjoint from `claimed`.
    fn disjoint_from(&self, claimed: &HashSet<&str>) -> bool {
        self.files.iter().all(|f| !claimed.contains(f.as_str()))
    }
}

/// A pair of sessions claiming the same file. One descriptor per unordered
/// pair per file: three owners of one file produce three descriptors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileCollision {
    pub file: String,
    pub first: String,
    pub second: String,
}

/// Snapshot of the four disjoint state sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskQueueState {
    pub pending: Vec<String>,
    pub in_progress: Vec<String>,
    pub completed: Vec<String>,
    pub blocked: Vec<String>,
}

/// Deterministic DFS-based topological sort over session ids.
///
/// Returns every id exactly once, dependencies before dependants. Any cycle
/// is an error naming one involved session.
pub fn topological_sort(sessions: &[Session]) -> Result<Vec<String>, QueueError> {
    let by_id: HashMap<&str, &Session> = sessions.iter().map(|s| (s.id.as_str(), s)).collect();

    for session in sessions {
        for dep in &session.dependencies {
            if !by_id.contains_key(dep.as_str()) {
                return Err(QueueError::UnknownDependency {
                    session: session.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InStack,
        Done,
    }

    fn visit(
        id: &str,
        by_id: &HashMap<&str, &Session>,
        marks: &mut HashMap<String, Mark>,
        order: &mut Vec<String>,
    ) -> Result<(), QueueError> {
        match marks.get(id).copied().unwrap_or(Mark::Unvisited) {
            Mark::Done => return Ok(()),
            Mark::InStack => {
                return Err(QueueError::CycleDetected { id: id.to_string() });
            }
            Mark::Unvisited => {}
        }
        marks.insert(id.to_string(), Mark::InStack);
        if let Some(session) = by_id.get(id) {
            for dep in &session.dependencies {
                visit(dep, by_id, marks, order)?;
            }
        }
        marks.insert(id.to_string(), Mark::Done);
        order.push(id.to_string());
        Ok(())
    }

    let mut marks = HashMap::new();
    let mut order = Vec::with_capacity(sessions.len());
    for session in sessions {
        visit(&session.id, &by_id, &mut marks, &mut order)?;
    }
    Ok(order)
}

/// The implementation-phase scheduler. Confined to a single phase-3 task;
/// no internal synchronization.
#[derive(Debug)]
pub struct TaskQueue {
    sessions: HashMap<String, Session>,
    /// Insertion order; keeps `ready()` and batch selection stable.
    order: Vec<String>,
    in_progress: HashSet<String>,
    completed: HashSet<String>,
    blocked: HashSet<String>,
}

impl TaskQueue {
    /// Validate dependencies, reject cycles, and build the queue.
    pub fn new(sessions: Vec<Session>) -> Result<Self, QueueError> {
        topological_sort(&sessions)?;
        let order: Vec<String> = sessions.iter().map(|s| s.id.clone()).collect();
        let sessions = sessions.into_iter().map(|s| (s.id.clone(), s)).collect();
        Ok(Self {
            sessions,
            order,
            in_progress: HashSet::new(),
            completed: HashSet::new(),
            blocked: HashSet::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    fn known(&self, id: &str) -> Result<(), QueueError> {
        if self.sessions.contains_key(id) {
            Ok(())
        } else {
            Err(QueueError::UnknownSession { id: id.to_string() })
        }
    }

    fn is_terminal(&self, id: &str) -> bool {
        self.completed.contains(id) || self.blocked.contains(id)
    }

    /// Sessions whose every dependency has reached a terminal state and
    /// which are not yet started or terminal themselves. Blocked
    /// dependencies release their dependants (see module docs).
    pub fn ready(&self) -> Vec<&Session> {
        self.order
            .iter()
            .filter(|id| !self.is_terminal(id) && !self.in_progress.contains(*id))
            .filter_map(|id| self.sessions.get(id))
            .filter(|s| s.dependencies.iter().all(|d| self.is_terminal(d)))
            .collect()
    }

    pub fn start(&mut self, id: &str) -> Result<(), QueueError> {
        self.known(id)?;
        self.in_progress.insert(id.to_string());
        self.completed.remove(id);
        self.blocked.remove(id);
        Ok(())
    }

    pub fn complete(&mut self, id: &str) -> Result<(), QueueError> {
        self.known(id)?;
        self.in_progress.remove(id);
        self.blocked.remove(id);
        self.completed.insert(id.to_string());
        Ok(())
    }

    pub fn mark_blocked(&mut self, id: &str) -> Result<(), QueueError> {
        self.known(id)?;
        self.in_progress.remove(id);
        self.completed.remove(id);
        self.blocked.insert(id.to_string());
        Ok(())
    }

    /// Return a failed in-progress session to the pending pool for retry.
    pub fn requeue(&mut self, id: &str) -> Result<(), QueueError> {
        self.known(id)?;
        self.in_progress.remove(id);
        Ok(())
    }

    /// Greedy, order-stable selection of a file-disjoint batch from `ready`.
    /// A session whose files overlap the batch's claimed set is skipped, not
    /// reordered; it stays eligible for a later batch.
    pub fn select_non_overlapping_batch<'a>(
        &self,
        ready: &[&'a Session],
        max_batch_size: usize,
    ) -> Vec<&'a Session> {
        let mut claimed: HashSet<&str> = HashSet::new();
        let mut batch = Vec::new();
        for session in ready {
            if batch.len() >= max_batch_size {
                break;
            }
            if session.disjoint_from(&claimed) {
                claimed.extend(session.files.iter().map(|f| f.as_str()));
                batch.push(*session);
            }
        }
        batch
    }

    /// Every file claimed by two or more of `sessions`, one descriptor per
    /// unordered session pair.
    pub fn detect_batch_collisions(sessions: &[&Session]) -> Vec<FileCollision> {
        let mut owners: HashMap<&str, Vec<&str>> = HashMap::new();
        for session in sessions {
            for file in &session.files {
                owners.entry(file.as_str()).or_default().push(&session.id);
            }
        }

        let mut collisions = Vec::new();
        let mut files: Vec<&&str> = owners.keys().collect();
        files.sort();
        for file in files {
            let ids = &owners[*file];
            for i in 0..ids.len() {
                for j in (i + 1)..ids.len() {
                    collisions.push(FileCollision {
                        file: file.to_string(),
                        first: ids[i].to_string(),
                        second: ids[j].to_string(),
                    });
                }
            }
        }
        collisions
    }

    /// True when every session is completed or blocked.
    pub fn is_complete(&self) -> bool {
        self.order.iter().all(|id| self.is_terminal(id))
    }

    /// Rehydrate terminal sets from a checkpoint. Idempotent; ids that no
    /// longer exist in the plan are silently ignored.
    pub fn restore_state(&mut self, completed: &[String], blocked: &[String]) {
        for id in completed {
            if self.sessions.contains_key(id) {
                self.in_progress.remove(id);
                self.blocked.remove(id);
                self.completed.insert(id.clone());
            }
        }
        for id in blocked {
            if self.sessions.contains_key(id) && !self.completed.contains(id) {
                self.in_progress.remove(id);
                self.blocked.insert(id.clone());
            }
        }
    }

    /// Snapshot of the four disjoint sets, each in insertion order.
    pub fn state(&self) -> TaskQueueState {
        let in_set = |set: &HashSet<String>| {
            self.order
                .iter()
                .filter(|id| set.contains(*id))
                .cloned()
                .collect::<Vec<_>>()
        };
        TaskQueueState {
            pending: self
                .order
                .iter()
                .filter(|id| {
                    !self.in_progress.contains(*id)
                        && !self.completed.contains(*id)
                        && !self.blocked.contains(*id)
                })
                .cloned()
                .collect(),
            in_progress: in_set(&self.in_progress),
            completed: in_set(&self.completed),
            blocked: in_set(&self.blocked),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn session(id: &str, deps: &[&str], files: &[&str]) -> Session {
        Session {
            id: id.to_string(),
            name: format!("Session {id}"),
            description: String::new(),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            files: files.iter().map(|s| s.to_string()).collect(),
            steps: vec![Step {
                id: format!("{id}-step"),
                files: files.iter().map(|s| s.to_string()).collect(),
                complexity: Complexity::Simple,
                acceptance_criteria: vec![],
            }],
        }
    }

    #[test]
    fn topological_sort_orders_dependencies_first() {
        let sessions = vec![
            session("c", &["b"], &[]),
            session("a", &[], &[]),
            session("b", &["a"], &[]),
        ];
        let order = topological_sort(&sessions).unwrap();
        assert_eq!(order.len(), 3);
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }

    #[test]
    fn cycle_is_rejected_at_construction() {
        let sessions = vec![session("A", &["B"], &[]), session("B", &["A"], &[])];
        let err = TaskQueue::new(sessions).unwrap_err();
        let msg = err.to_string();
        assert!(
            msg == "Cycle detected in session dependencies involving: A"
                || msg == "Cycle detected in session dependencies involving: B",
            "unexpected message: {msg}"
        );
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let sessions = vec![session("a", &["ghost"], &[])];
        let err = TaskQueue::new(sessions).unwrap_err();
        assert!(matches!(err, QueueError::UnknownDependency { .. }));
    }

    #[test]
    fn sets_partition_the_sessions() {
        let sessions = vec![
            session("a", &[], &[]),
            session("b", &["a"], &[]),
            session("c", &[], &[]),
            session("d", &[], &[]),
        ];
        let mut queue = TaskQueue::new(sessions).unwrap();
        queue.start("a").unwrap();
        queue.complete("a").unwrap();
        queue.start("b").unwrap();
        queue.mark_blocked("c").unwrap();

        let state = queue.state();
        let total = state.pending.len()
            + state.in_progress.len()
            + state.completed.len()
            + state.blocked.len();
        assert_eq!(total, queue.len());
        assert_eq!(state.pending, vec!["d"]);
        assert_eq!(state.in_progress, vec!["b"]);
        assert_eq!(state.completed, vec!["a"]);
        assert_eq!(state.blocked, vec!["c"]);
    }

    #[test]
    fn blocked_dependency_releases_dependants() {
        let sessions = vec![session("a", &[], &[]), session("b", &["a"], &[])];
        let mut queue = TaskQueue::new(sessions).unwrap();
        assert_eq!(queue.ready().len(), 1);
        queue.start("a").unwrap();
        queue.mark_blocked("a").unwrap();
        let ready: Vec<&str> = queue.ready().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ready, vec!["b"]);
    }

    #[test]
    fn unknown_id_transition_is_an_error() {
        let mut queue = TaskQueue::new(vec![session("a", &[], &[])]).unwrap();
        assert!(matches!(
            queue.complete("nope"),
            Err(QueueError::UnknownSession { .. })
        ));
    }

    #[test]
    fn batch_selection_drops_colliding_sessions() {
        let s1 = session("s1", &[], &["a.ts"]);
        let s2 = session("s2", &[], &["b.ts"]);
        let s3 = session("s3", &[], &["a.ts"]);
        let queue = TaskQueue::new(vec![s1.clone(), s2.clone(), s3.clone()]).unwrap();

        let ready = queue.ready();
        let batch = queue.select_non_overlapping_batch(&ready, 10);
        let ids: Vec<&str> = batch.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2"]);
    }

    #[test]
    fn batch_selection_respects_max_size() {
        let sessions: Vec<Session> = (0..5)
            .map(|i| session(&format!("s{i}"), &[], &[&format!("f{i}.rs")]))
            .collect();
        let queue = TaskQueue::new(sessions).unwrap();
        let ready = queue.ready();
        let batch = queue.select_non_overlapping_batch(&ready, 2);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].id, "s0");
        assert_eq!(batch[1].id, "s1");
    }

    #[test]
    fn collision_detection_emits_one_descriptor_per_pair() {
        let s1 = session("s1", &[], &["a.ts"]);
        let s2 = session("s2", &[], &["b.ts"]);
        let s3 = session("s3", &[], &["a.ts"]);
        let refs: Vec<&Session> = vec![&s1, &s2, &s3];
        let collisions = TaskQueue::detect_batch_collisions(&refs);
        assert_eq!(collisions.len(), 1);
        assert_eq!(collisions[0].file, "a.ts");
        assert_eq!(collisions[0].first, "s1");
        assert_eq!(collisions[0].second, "s3");
    }

    #[test]
    fn three_owners_of_one_file_is_three_descriptors() {
        let s1 = session("s1", &[], &["x.rs"]);
        let s2 = session("s2", &[], &["x.rs"]);
        let s3 = session("s3", &[], &["x.rs"]);
        let refs: Vec<&Session> = vec![&s1, &s2, &s3];
        let collisions = TaskQueue::detect_batch_collisions(&refs);
        assert_eq!(collisions.len(), 3);
    }

    #[test]
    fn is_complete_counts_blocked_as_terminal() {
        let mut queue =
            TaskQueue::new(vec![session("a", &[], &[]), session("b", &[], &[])]).unwrap();
        assert!(!queue.is_complete());
        queue.complete("a").unwrap();
        queue.mark_blocked("b").unwrap();
        assert!(queue.is_complete());
    }

    #[test]
    fn restore_state_is_idempotent_and_ignores_unknown_ids() {
        let mut queue =
            TaskQueue::new(vec![session("a", &[], &[]), session("b", &[], &[])]).unwrap();
        let completed = vec!["a".to_string(), "ghost".to_string()];
        let blocked = vec!["b".to_string()];
        queue.restore_state(&completed, &blocked);
        queue.restore_state(&completed, &blocked);
        let state = queue.state();
        assert_eq!(state.completed, vec!["a"]);
        assert_eq!(state.blocked, vec!["b"]);
        assert!(queue.is_complete());
    }

    #[test]
    fn requeue_returns_session_to_pending() {
        let mut queue = TaskQueue::new(vec![session("a", &[], &[])]).unwrap();
        queue.start("a").unwrap();
        assert!(queue.ready().is_empty());
        queue.requeue("a").unwrap();
        assert_eq!(queue.ready().len(), 1);
    }

    /// Small deterministic generator for the randomized invariant checks.
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self, bound: usize) -> usize {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((self.0 >> 33) as usize) % bound.max(1)
        }
    }

    /// Random DAG (edges only point to earlier sessions, so always acyclic):
    /// the sort must return every id once with dependencies first.
    #[test]
    fn topological_sort_holds_on_random_dags() {
        for seed in 0..50u64 {
            let mut rng = Lcg(seed.wrapping_mul(0x9e3779b97f4a7c15) + 1);
            let n = 2 + rng.next(20);
            let sessions: Vec<Session> = (0..n)
                .map(|i| {
                    let deps: Vec<&str> = Vec::new();
                    let mut s = session(&format!("s{i}"), &deps, &[]);
                    let dep_count = rng.next(i.min(4) + 1);
                    for _ in 0..dep_count {
                        let dep = format!("s{}", rng.next(i.max(1)));
                        if i > 0 && !s.dependencies.contains(&dep) {
                            s.dependencies.push(dep);
                        }
                    }
                    s
                })
                .collect();

            let order = topological_sort(&sessions).unwrap();
            assert_eq!(order.len(), n, "seed {seed}");
            let pos: HashMap<&str, usize> = order
                .iter()
                .enumerate()
                .map(|(i, id)| (id.as_str(), i))
                .collect();
            for s in &sessions {
                for dep in &s.dependencies {
                    assert!(
                        pos[dep.as_str()] < pos[s.id.as_str()],
                        "seed {seed}: {dep} must precede {}",
                        s.id
                    );
                }
            }
        }
    }

    /// Any batch selected from random file claims is pairwise file-disjoint.
    #[test]
    fn batches_are_disjoint_on_random_file_sets() {
        for seed in 0..50u64 {
            let mut rng = Lcg(seed + 7);
            let n = 1 + rng.next(15);
            let sessions: Vec<Session> = (0..n)
                .map(|i| {
                    let file_count = 1 + rng.next(3);
                    let files: Vec<String> =
                        (0..file_count).map(|_| format!("f{}.rs", rng.next(8))).collect();
                    let refs: Vec<&str> = files.iter().map(|f| f.as_str()).collect();
                    session(&format!("s{i}"), &[], &refs)
                })
                .collect();
            let queue = TaskQueue::new(sessions).unwrap();
            let ready = queue.ready();
            let batch = queue.select_non_overlapping_batch(&ready, n);

            let mut seen: HashSet<&str> = HashSet::new();
            for s in &batch {
                for f in &s.files {
                    assert!(seen.insert(f.as_str()), "seed {seed}: duplicate claim on {f}");
                }
            }
        }
    }
}
