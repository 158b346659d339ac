//! The validated stage registry and its topological order.

use super::StageSpec;
use crate::errors::CyclicDependencyError;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// A validated, acyclic set of stages with a fixed execution order.
#[derive(Debug, Clone)]
pub struct StageGraph {
    /// The pipeline name.
    name: String,
    /// Stages in declaration order.
    stages: Vec<StageSpec>,
    /// Stage name to declaration index.
    index: HashMap<String, usize>,
    /// Declaration indices in execution order.
    order: Vec<usize>,
}

impl StageGraph {
    /// Orders `stages` topologically.
    ///
    /// Ties between ready stages are broken by declaration order. Every
    /// dependency name must refer to a stage in `stages`; the builder
    /// checks this before calling.
    ///
    /// # Errors
    ///
    /// Returns [`CyclicDependencyError`] naming one cycle if no order exists.
    pub fn new(name: impl Into<String>, stages: Vec<StageSpec>) -> Result<Self, CyclicDependencyError> {
        let index: HashMap<String, usize> = stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();

        let order = topological_order(&stages, &index)?;

        Ok(Self {
            name: name.into(),
            stages,
            index,
            order,
        })
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Looks up a stage by name.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.index.get(name).map(|&i| &self.stages[i])
    }

    /// Returns true if the graph contains the stage.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Iterates stages in execution order.
    pub fn iter(&self) -> impl Iterator<Item = &StageSpec> + '_ {
        self.order.iter().map(move |&i| &self.stages[i])
    }

    /// Returns stage names in execution order.
    #[must_use]
    pub fn execution_order(&self) -> Vec<&str> {
        self.iter().map(|s| s.name.as_str()).collect()
    }

    /// Returns every stage `name` depends on, directly or transitively.
    #[must_use]
    pub fn transitive_dependencies(&self, name: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([name]);

        while let Some(current) = queue.pop_front() {
            if let Some(spec) = self.stage(current) {
                for dep in &spec.depends_on {
                    if seen.insert(dep.clone()) {
                        queue.push_back(dep);
                    }
                }
            }
        }
        seen
    }

    /// Returns `name` and every stage that depends on it, directly or
    /// transitively. Empty if `name` is unknown.
    #[must_use]
    pub fn downstream_of(&self, name: &str) -> HashSet<String> {
        let mut selected = HashSet::new();
        if !self.contains(name) {
            return selected;
        }
        selected.insert(name.to_string());

        // Execution order guarantees dependencies are visited first.
        for spec in self.iter() {
            if spec.depends_on.iter().any(|d| selected.contains(d)) {
                selected.insert(spec.name.clone());
            }
        }
        selected
    }
}

/// Kahn's algorithm; the ready set is ordered by declaration index.
fn topological_order(
    stages: &[StageSpec],
    index: &HashMap<String, usize>,
) -> Result<Vec<usize>, CyclicDependencyError> {
    let mut in_degree: Vec<usize> = stages.iter().map(|s| s.depends_on.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); stages.len()];
    for (i, spec) in stages.iter().enumerate() {
        for dep in &spec.depends_on {
            if let Some(&d) = index.get(dep) {
                dependents[d].push(i);
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..stages.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(stages.len());

    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &child in &dependents[next] {
            in_degree[child] -= 1;
            if in_degree[child] == 0 {
                ready.insert(child);
            }
        }
    }

    if order.len() == stages.len() {
        Ok(order)
    } else {
        Err(CyclicDependencyError::new(find_cycle(stages, index, &in_degree)))
    }
}

/// Walks unresolved dependencies from the first stuck stage until a stage
/// repeats. Every stuck stage has at least one stuck dependency, so the
/// walk always closes a cycle.
fn find_cycle(stages: &[StageSpec], index: &HashMap<String, usize>, in_degree: &[usize]) -> Vec<String> {
    let stuck = |i: usize| in_degree[i] > 0;

    let Some(start) = (0..stages.len()).find(|&i| stuck(i)) else {
        return Vec::new();
    };

    let mut path: Vec<usize> = Vec::new();
    let mut current = start;
    loop {
        if let Some(pos) = path.iter().position(|&p| p == current) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|&i| stages[i].name.clone()).collect();
            cycle.push(stages[current].name.clone());
            return cycle;
        }
        path.push(current);

        let next = stages[current]
            .sorted_dependencies()
            .into_iter()
            .filter_map(|d| index.get(d).copied())
            .find(|&d| stuck(d));

        match next {
            Some(n) => current = n,
            None => return path.iter().map(|&i| stages[i].name.clone()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::CommandAction;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn stage(name: &str, deps: &[&str]) -> StageSpec {
        StageSpec::new(name, Arc::new(CommandAction::subcommand("engine", name)))
            .with_dependencies(deps.iter().copied())
    }

    #[test]
    fn test_linear_order() {
        let graph = StageGraph::new(
            "p",
            vec![stage("c", &["b"]), stage("b", &["a"]), stage("a", &[])],
        )
        .unwrap();
        assert_eq!(graph.execution_order(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_ties_follow_declaration_order() {
        let graph = StageGraph::new(
            "p",
            vec![
                stage("root", &[]),
                stage("right", &["root"]),
                stage("left", &["root"]),
                stage("join", &["left", "right"]),
            ],
        )
        .unwrap();
        assert_eq!(graph.execution_order(), vec!["root", "right", "left", "join"]);
    }

    #[test]
    fn test_cycle_reports_path() {
        let err = StageGraph::new(
            "p",
            vec![stage("a", &["c"]), stage("b", &["a"]), stage("c", &["b"]), stage("d", &[])],
        )
        .unwrap_err();

        assert_eq!(err.cycle_path.first(), err.cycle_path.last());
        assert_eq!(err.cycle_path.len(), 4);
        for name in ["a", "b", "c"] {
            assert!(err.cycle_path.iter().any(|n| n == name));
        }
        assert!(!err.cycle_path.iter().any(|n| n == "d"));
    }

    #[test]
    fn test_downstream_and_transitive() {
        let graph = StageGraph::new(
            "p",
            vec![
                stage("a", &[]),
                stage("b", &["a"]),
                stage("c", &["b"]),
                stage("x", &[]),
            ],
        )
        .unwrap();

        let downstream = graph.downstream_of("b");
        assert_eq!(downstream.len(), 2);
        assert!(downstream.contains("b") && downstream.contains("c"));
        assert!(graph.downstream_of("missing").is_empty());

        let deps = graph.transitive_dependencies("c");
        assert_eq!(deps.len(), 2);
        assert!(deps.contains("a") && deps.contains("b"));
    }
}
