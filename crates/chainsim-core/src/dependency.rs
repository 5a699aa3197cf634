use crate::definition::RecipeStep;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("recipe has no steps")]
    Empty,
    #[error("step {step} depends on step {dependency}, which does not exist")]
    IndexOutOfRange { step: usize, dependency: usize },
    #[error("dependency cycle through steps {0:?}")]
    Cycle(Vec<usize>),
}

/// DAG over a recipe's steps. An edge `d -> s` means step `s` lists `d` in
/// its dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyGraph {
    deps: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    depths: Vec<usize>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl DependencyGraph {
    pub fn from_steps(steps: &[RecipeStep]) -> Result<Self, GraphError> {
        Self::new(steps.iter().map(|s| s.dependencies.clone()).collect())
    }

    /// Build and validate. Rejects out-of-range indices and cycles,
    /// self-loops included.
    pub fn new(deps: Vec<Vec<usize>>) -> Result<Self, GraphError> {
        let n = deps.len();
        if n == 0 {
            return Err(GraphError::Empty);
        }
        let mut dependents = vec![Vec::new(); n];
        for (step, ds) in deps.iter().enumerate() {
            for &d in ds {
                if d >= n {
                    return Err(GraphError::IndexOutOfRange { step, dependency: d });
                }
                if !dependents[d].contains(&step) {
                    dependents[d].push(step);
                }
            }
        }

        let order = Self::dfs_order(&deps)?;

        // `order` lists every step after all of its dependencies.
        let mut depths = vec![0usize; n];
        for &step in &order {
            depths[step] = deps[step].iter().map(|&d| depths[d] + 1).max().unwrap_or(0);
        }

        Ok(Self { deps, dependents, depths })
    }

    /// Iterative DFS post-order over dependency edges. Returns steps with
    /// every dependency ahead of its dependent, or the cycle found.
    fn dfs_order(deps: &[Vec<usize>]) -> Result<Vec<usize>, GraphError> {
        let n = deps.len();
        let mut marks = vec![Mark::Unvisited; n];
        let mut order = Vec::with_capacity(n);
        // (step, next dependency position to visit)
        let mut stack: Vec<(usize, usize)> = Vec::new();

        for root in 0..n {
            if marks[root] != Mark::Unvisited {
                continue;
            }
            marks[root] = Mark::InProgress;
            stack.push((root, 0));

            while let Some(top) = stack.last_mut() {
                let (step, pos) = *top;
                if let Some(&d) = deps[step].get(pos) {
                    top.1 += 1;
                    match marks[d] {
                        Mark::Unvisited => {
                            marks[d] = Mark::InProgress;
                            stack.push((d, 0));
                        }
                        Mark::InProgress => {
                            let from = stack.iter().position(|&(s, _)| s == d).unwrap_or(0);
                            let cycle = stack[from..].iter().map(|&(s, _)| s).collect();
                            return Err(GraphError::Cycle(cycle));
                        }
                        Mark::Done => {}
                    }
                } else {
                    marks[step] = Mark::Done;
                    order.push(step);
                    stack.pop();
                }
            }
        }
        Ok(order)
    }

    pub fn len(&self) -> usize {
        self.deps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    pub fn dependencies(&self, step: usize) -> &[usize] {
        self.deps.get(step).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn dependents(&self, step: usize) -> &[usize] {
        self.dependents.get(step).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 0 for steps without dependencies, else one more than the deepest
    /// dependency.
    pub fn depth(&self, step: usize) -> Option<usize> {
        self.depths.get(step).copied()
    }

    pub fn depths(&self) -> &[usize] {
        &self.depths
    }

    pub fn max_depth(&self) -> usize {
        self.depths.iter().copied().max().unwrap_or(0)
    }

    /// Steps sorted by `(depth, index)`.
    pub fn topological_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.sort_by_key(|&s| (self.depths[s], s));
        order
    }

    /// Steps grouped by shared depth, shallowest first.
    pub fn execution_waves(&self) -> Vec<Vec<usize>> {
        let mut waves = vec![Vec::new(); self.max_depth() + 1];
        for (step, &depth) in self.depths.iter().enumerate() {
            waves[depth].push(step);
        }
        waves
    }

    /// Steps whose dependencies are all in `completed`, skipping anything in
    /// `completed` or `excluded`.
    pub fn ready_steps(&self, completed: &BTreeSet<usize>, excluded: &BTreeSet<usize>) -> Vec<usize> {
        (0..self.len())
            .filter(|s| !completed.contains(s) && !excluded.contains(s))
            .filter(|&s| self.deps[s].iter().all(|d| completed.contains(d)))
            .collect()
    }

    /// Longest dependency chain, root first. Walks back from the deepest step
    /// through its deepest dependency; ties go to the lowest index.
    pub fn critical_path(&self) -> Vec<usize> {
        let Some(mut current) = (0..self.len()).max_by_key(|&s| (self.depths[s], std::cmp::Reverse(s)))
        else {
            return Vec::new();
        };
        let mut path = vec![current];
        while let Some(&next) = self.deps[current]
            .iter()
            .max_by_key(|&&d| (self.depths[d], std::cmp::Reverse(d)))
        {
            path.push(next);
            current = next;
        }
        path.reverse();
        path
    }
}
