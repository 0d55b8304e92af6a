//! Step Dependency Graph
//!
//! Ordered, append-only collection of a protocol's steps and their
//! prerequisite relationships. Prerequisites must already exist when a step
//! is appended, so the graph stays a DAG; edges added between existing steps
//! are checked for cycles.

use std::collections::{HashMap, HashSet};

use log::debug;
use thiserror::Error;

use super::model::{Step, StepStatus};

/// Graph construction errors. Rejected before anything is scheduled.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Adding the edge set would close a cycle
    #[error("Step '{step}' cannot depend on '{prerequisite}': cycle {}", path.join(" -> "))]
    Cycle {
        step: String,
        prerequisite: String,
        path: Vec<String>,
    },

    /// A prerequisite id is not (yet) part of the graph
    #[error("Step '{step}' references unknown prerequisite '{prerequisite}'")]
    UnknownPrerequisite { step: String, prerequisite: String },

    #[error("Step '{0}' already exists")]
    DuplicateStep(String),

    #[error("Step '{0}' not found")]
    UnknownStep(String),

    #[error("Step has empty or whitespace-only ID")]
    EmptyStepId,
}

/// Normalized prerequisite set.
///
/// Accepts a single id or a list of ids; ids are trimmed, empty ones
/// dropped and duplicates removed while keeping first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prerequisites(Vec<String>);

impl Prerequisites {
    pub fn none() -> Self {
        Self(Vec::new())
    }

    fn normalize<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let ids = ids
            .into_iter()
            .map(|id| id.as_ref().trim().to_string())
            .filter(|id| !id.is_empty())
            .filter(|id| seen.insert(id.clone()))
            .collect();
        Self(ids)
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0
    }
}

impl From<&str> for Prerequisites {
    fn from(id: &str) -> Self {
        Self::normalize([id])
    }
}

impl From<String> for Prerequisites {
    fn from(id: String) -> Self {
        Self::normalize([id])
    }
}

impl From<&String> for Prerequisites {
    fn from(id: &String) -> Self {
        Self::normalize([id])
    }
}

impl From<Vec<String>> for Prerequisites {
    fn from(ids: Vec<String>) -> Self {
        Self::normalize(ids)
    }
}

impl From<Vec<&str>> for Prerequisites {
    fn from(ids: Vec<&str>) -> Self {
        Self::normalize(ids)
    }
}

impl From<&[&str]> for Prerequisites {
    fn from(ids: &[&str]) -> Self {
        Self::normalize(ids)
    }
}

impl From<&[String]> for Prerequisites {
    fn from(ids: &[String]) -> Self {
        Self::normalize(ids)
    }
}

impl<const N: usize> From<[&str; N]> for Prerequisites {
    fn from(ids: [&str; N]) -> Self {
        Self::normalize(ids)
    }
}

/// Per-status step counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: usize,
    pub running: usize,
    pub finished: usize,
    pub failed: usize,
    pub aborted: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.running + self.finished + self.failed + self.aborted
    }
}

/// A protocol's steps in insertion order, indexed by id.
#[derive(Debug, Clone, Default)]
pub struct StepGraph {
    steps: Vec<Step>,
    index: HashMap<String, usize>,
}

impl StepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a graph from steps in their stored order.
    ///
    /// Every step is appended through [`StepGraph::push`], so stored data
    /// with forward references or cycles is rejected.
    pub fn from_steps(steps: Vec<Step>) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        for step in steps {
            graph.push(step)?;
        }
        Ok(graph)
    }

    /// Appends a step with the given prerequisites.
    ///
    /// Fails with [`GraphError::UnknownPrerequisite`] when a prerequisite is
    /// not in the graph yet and with [`GraphError::Cycle`] when the step
    /// lists itself. The graph is unchanged on error.
    pub fn add_step(
        &mut self,
        mut step: Step,
        prerequisites: impl Into<Prerequisites>,
    ) -> Result<(), GraphError> {
        let prerequisites = prerequisites.into();

        if step.id.trim().is_empty() {
            return Err(GraphError::EmptyStepId);
        }
        if self.index.contains_key(&step.id) {
            return Err(GraphError::DuplicateStep(step.id));
        }

        for prerequisite in prerequisites.iter() {
            if *prerequisite == step.id {
                return Err(GraphError::Cycle {
                    step: step.id.clone(),
                    prerequisite: prerequisite.clone(),
                    path: vec![step.id.clone(), step.id.clone()],
                });
            }
            if !self.index.contains_key(prerequisite) {
                return Err(GraphError::UnknownPrerequisite {
                    step: step.id.clone(),
                    prerequisite: prerequisite.clone(),
                });
            }
        }

        step.prerequisites = prerequisites.into_vec();
        debug!(
            "Appending step '{}' (prerequisites: {:?})",
            step.id, step.prerequisites
        );
        self.index.insert(step.id.clone(), self.steps.len());
        self.steps.push(step);
        Ok(())
    }

    /// Appends a step using the prerequisites recorded on the step itself.
    pub fn push(&mut self, mut step: Step) -> Result<(), GraphError> {
        let prerequisites = Prerequisites::from(std::mem::take(&mut step.prerequisites));
        self.add_step(step, prerequisites)
    }

    /// Adds an edge between two existing steps.
    ///
    /// Fails with [`GraphError::Cycle`] if `prerequisite` already depends,
    /// directly or transitively, on `step_id`. The graph is unchanged on error.
    pub fn add_prerequisite(&mut self, step_id: &str, prerequisite: &str) -> Result<(), GraphError> {
        let position = *self
            .index
            .get(step_id)
            .ok_or_else(|| GraphError::UnknownStep(step_id.to_string()))?;
        if !self.index.contains_key(prerequisite) {
            return Err(GraphError::UnknownPrerequisite {
                step: step_id.to_string(),
                prerequisite: prerequisite.to_string(),
            });
        }
        if self.steps[position].prerequisites.iter().any(|p| p == prerequisite) {
            return Ok(());
        }

        if let Some(mut path) = self.dependency_path(prerequisite, step_id) {
            path.push(prerequisite.to_string());
            return Err(GraphError::Cycle {
                step: step_id.to_string(),
                prerequisite: prerequisite.to_string(),
                path,
            });
        }

        self.steps[position].prerequisites.push(prerequisite.to_string());
        Ok(())
    }

    /// Finds a chain `from -> ... -> to` following prerequisite edges.
    fn dependency_path(&self, from: &str, to: &str) -> Option<Vec<String>> {
        let mut stack = vec![vec![from.to_string()]];
        let mut visited = HashSet::new();

        while let Some(path) = stack.pop() {
            let current = path.last()?.clone();
            if current == to {
                return Some(path);
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(step) = self.get(&current) {
                for prerequisite in &step.prerequisites {
                    let mut next = path.clone();
                    next.push(prerequisite.clone());
                    stack.push(next);
                }
            }
        }
        None
    }

    /// PENDING steps whose prerequisites are all FINISHED, in insertion order.
    ///
    /// The sequence is lazy; callers usually `take` as many as they have
    /// free slots for.
    pub fn runnable_steps(&self) -> impl Iterator<Item = &Step> + '_ {
        self.steps.iter().filter(move |step| {
            step.status == StepStatus::Pending
                && step
                    .prerequisites
                    .iter()
                    .all(|p| self.status_of(p) == Some(StepStatus::Finished))
        })
    }

    pub fn status_of(&self, id: &str) -> Option<StepStatus> {
        self.get(id).map(|s| s.status)
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for step in &self.steps {
            match step.status {
                StepStatus::Pending => counts.pending += 1,
                StepStatus::Running => counts.running += 1,
                StepStatus::Finished => counts.finished += 1,
                StepStatus::Failed => counts.failed += 1,
                StepStatus::Aborted => counts.aborted += 1,
            }
        }
        counts
    }

    /// Ids of steps that list `id` as a prerequisite.
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.prerequisites.iter().any(|p| p == id))
            .map(|s| s.id.as_str())
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<&Step> {
        self.index.get(id).map(|&i| &self.steps[i])
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Step> {
        self.index.get(id).map(|&i| &mut self.steps[i])
    }

    /// Insertion position of a step.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter()
    }

    /// Mutable access to step state; ids and prerequisites must not be edited.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Step> {
        self.steps.iter_mut()
    }

    pub fn ids_with_status(&self, status: StepStatus) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.status == status)
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
