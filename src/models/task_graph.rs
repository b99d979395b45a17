//! # Derived Task Graph
//!
//! In-memory DAG view built from a decomposed task list. This is the only
//! supported path from task descriptors to persisted steps and edges, and
//! it is where acyclicity is enforced: the append-only edge storage
//! deliberately accepts anything with all three fields present.

use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// A task produced by goal decomposition: an id, a human description, and
/// the ids it depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl TaskDescriptor {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            depends_on: Vec::new(),
        }
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.depends_on = ids.iter().map(|s| (*s).to_string()).collect();
        self
    }
}

/// A graph node bound to a handler name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphStep {
    pub slug: String,
    pub description: String,
    pub handler: String,
    pub depends_on: Vec<String>,
}

/// Validated DAG: slug-keyed steps, root set, and the longest dependency
/// chain length (counted in nodes).
#[derive(Debug, Clone)]
pub struct TaskGraph {
    steps: HashMap<String, GraphStep>,
    order: Vec<String>,
    roots: Vec<String>,
    max_depth: u32,
    created_at: DateTime<Utc>,
}

impl TaskGraph {
    /// Build a graph binding each task's handler to its own id.
    pub fn build(tasks: &[TaskDescriptor]) -> Result<TaskGraph> {
        Self::build_with_bindings(tasks, &HashMap::new())
    }

    /// Build a graph, resolving handlers through `bindings` (task id ->
    /// handler name); ids without a binding use the id itself.
    ///
    /// Rejects duplicate or empty ids (validation error), references to
    /// unknown steps, and cycles including self-referential edges
    /// (dependency errors).
    pub fn build_with_bindings(
        tasks: &[TaskDescriptor],
        bindings: &HashMap<String, String>,
    ) -> Result<TaskGraph> {
        if tasks.is_empty() {
            return Err(EngineError::validation("task list is empty"));
        }

        let mut steps = HashMap::with_capacity(tasks.len());
        let mut order = Vec::with_capacity(tasks.len());
        for task in tasks {
            if task.id.is_empty() {
                return Err(EngineError::validation("task id is required"));
            }
            let handler = bindings
                .get(&task.id)
                .cloned()
                .unwrap_or_else(|| task.id.clone());
            let step = GraphStep {
                slug: task.id.clone(),
                description: task.description.clone(),
                handler,
                depends_on: task.depends_on.clone(),
            };
            if steps.insert(task.id.clone(), step).is_some() {
                return Err(EngineError::validation(format!(
                    "duplicate task id '{}'",
                    task.id
                )));
            }
            order.push(task.id.clone());
        }

        for task in tasks {
            for dep in &task.depends_on {
                if !steps.contains_key(dep) {
                    return Err(EngineError::dependency(format!(
                        "step '{}' depends on unknown step '{}'",
                        task.id, dep
                    )));
                }
            }
        }

        // Kahn's algorithm: processes the whole graph iff it is acyclic,
        // and yields per-node chain depth along the way.
        let mut in_degree: HashMap<&str, usize> = HashMap::with_capacity(tasks.len());
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for task in tasks {
            in_degree.insert(task.id.as_str(), task.depends_on.len());
            for dep in &task.depends_on {
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(task.id.as_str());
            }
        }

        let mut queue: VecDeque<&str> = order
            .iter()
            .map(String::as_str)
            .filter(|slug| in_degree[slug] == 0)
            .collect();
        let roots: Vec<String> = queue.iter().map(|s| (*s).to_string()).collect();

        let mut depth: HashMap<&str, u32> = queue.iter().map(|slug| (*slug, 1)).collect();
        let mut processed = 0usize;
        let mut max_depth = 0u32;

        while let Some(slug) = queue.pop_front() {
            processed += 1;
            let node_depth = depth[slug];
            max_depth = max_depth.max(node_depth);
            for &dependent in dependents.get(slug).into_iter().flatten() {
                let entry = depth.entry(dependent).or_insert(0);
                *entry = (*entry).max(node_depth + 1);
                let remaining = in_degree
                    .get_mut(dependent)
                    .expect("dependent is a known step");
                *remaining -= 1;
                if *remaining == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if processed != tasks.len() {
            let stuck: Vec<&str> = in_degree
                .iter()
                .filter(|(_, deg)| **deg > 0)
                .map(|(slug, _)| *slug)
                .collect();
            return Err(EngineError::dependency(format!(
                "dependency cycle involving: {}",
                stuck.join(", ")
            )));
        }

        Ok(TaskGraph {
            steps,
            order,
            roots,
            max_depth,
            created_at: Utc::now(),
        })
    }

    pub fn get(&self, slug: &str) -> Option<&GraphStep> {
        self.steps.get(slug)
    }

    /// Steps in the order the decomposer declared them.
    pub fn steps(&self) -> impl Iterator<Item = &GraphStep> {
        self.order.iter().filter_map(|slug| self.steps.get(slug))
    }

    pub fn slugs(&self) -> &[String] {
        &self.order
    }

    /// Steps with no incoming dependency edges.
    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    /// Longest dependency chain, counted in nodes.
    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn dependencies_of(&self, slug: &str) -> Vec<&str> {
        self.steps
            .get(slug)
            .map(|s| s.depends_on.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn dependents_of(&self, slug: &str) -> Vec<&str> {
        self.order
            .iter()
            .filter(|candidate| {
                self.steps
                    .get(*candidate)
                    .is_some_and(|s| s.depends_on.iter().any(|d| d == slug))
            })
            .map(String::as_str)
            .collect()
    }
}
