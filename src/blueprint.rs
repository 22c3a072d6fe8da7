use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use petgraph::Graph;
use petgraph::graph::NodeIndex;
use petgraph::visit::{Dfs, Reversed};

use crate::engine::{Task, TypedTask};
use crate::error::ConfigError;

/// A declared task: name, dependency names and the work itself.
pub(crate) struct Node {
    pub name: Cow<'static, str>,
    pub dependencies: Vec<Cow<'static, str>>,
    pub task: Arc<dyn Task>,
}

/// Collects task declarations. Nothing is validated until [`finish`], so
/// tasks may be declared in any order.
///
/// [`finish`]: Blueprint::finish
///
/// # Example
///
/// ```rust,no_run
/// use assetflow::{Aggregate, Blueprint};
///
/// let mut blueprint = Blueprint::new();
/// blueprint.task("a").run(Aggregate);
/// blueprint.task("b").depends_on(["a"]).run(Aggregate);
/// let graph = blueprint.finish()?;
/// # Ok::<(), assetflow::ConfigError>(())
/// ```
#[derive(Default)]
pub struct Blueprint {
    nodes: Vec<Node>,
}

impl Blueprint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start declaring a task.
    pub fn task(&mut self, name: impl Into<Cow<'static, str>>) -> TaskDef<'_> {
        TaskDef {
            blueprint: self,
            name: name.into(),
            dependencies: Vec::new(),
        }
    }

    /// Validate names, dependencies and acyclicity, and freeze the graph.
    pub fn finish(self) -> Result<TaskGraph, ConfigError> {
        let mut graph = Graph::new();
        let mut index = HashMap::new();

        for node in self.nodes {
            let name = node.name.to_string();
            if index.contains_key(&name) {
                return Err(ConfigError::DuplicateTask(name));
            }
            index.insert(name, graph.add_node(node));
        }

        for target in graph.node_indices().collect::<Vec<_>>() {
            let dependencies = graph[target].dependencies.clone();

            for dependency in dependencies {
                let source = *index.get(dependency.as_ref()).ok_or_else(|| {
                    ConfigError::UnknownDependency {
                        task: graph[target].name.to_string(),
                        dependency: dependency.to_string(),
                    }
                })?;

                graph.add_edge(source, target, ());
            }
        }

        petgraph::algo::toposort(&graph, None)
            .map_err(|cycle| ConfigError::Cycle(graph[cycle.node_id()].name.to_string()))?;

        Ok(TaskGraph { graph, index })
    }
}

pub struct TaskDef<'a> {
    blueprint: &'a mut Blueprint,
    name: Cow<'static, str>,
    dependencies: Vec<Cow<'static, str>>,
}

impl TaskDef<'_> {
    /// Tasks that must succeed before this one starts.
    pub fn depends_on<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Cow<'static, str>>,
    {
        self.dependencies.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn run<T>(self, task: T)
    where
        T: TypedTask + 'static,
    {
        self.blueprint.nodes.push(Node {
            name: self.name,
            dependencies: self.dependencies,
            task: Arc::new(task),
        });
    }
}

/// An immutable, validated task graph. Edges point from a dependency to its
/// dependent.
pub struct TaskGraph {
    pub(crate) graph: Graph<Node, ()>,
    index: HashMap<String, NodeIndex>,
}

impl TaskGraph {
    pub(crate) fn lookup(&self, name: &str) -> Result<NodeIndex, ConfigError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| ConfigError::UnknownTask(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.graph.node_weights().map(|node| node.name.as_ref())
    }

    /// Names of the declared dependencies of `name`.
    pub fn dependencies_of(&self, name: &str) -> Result<Vec<&str>, ConfigError> {
        let index = self.lookup(name)?;
        Ok(self.graph[index]
            .dependencies
            .iter()
            .map(|dep| dep.as_ref())
            .collect())
    }

    /// The given tasks together with everything they transitively depend on.
    pub(crate) fn closure<S: AsRef<str>>(
        &self,
        targets: &[S],
    ) -> Result<HashSet<NodeIndex>, ConfigError> {
        let reversed = Reversed(&self.graph);
        let mut nodes = HashSet::new();

        for target in targets {
            let start = self.lookup(target.as_ref())?;
            let mut dfs = Dfs::new(reversed, start);
            while let Some(index) = dfs.next(reversed) {
                nodes.insert(index);
            }
        }

        Ok(nodes)
    }
}

impl std::fmt::Display for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let node = &self.graph[index];
            let name = node.name.replace('"', "\\\"");
            writeln!(f, "    {:?}[\"{}\"]", index.index(), name)?;
        }

        for edge in self.graph.raw_edges() {
            let type_name = self.graph[edge.source()]
                .task
                .output_type_name()
                .replace('<', "&lt;")
                .replace('>', "&gt;");
            writeln!(
                f,
                "    {:?} -- \"{}\" --> {:?}",
                edge.source().index(),
                type_name,
                edge.target().index()
            )?;
        }

        Ok(())
    }
}
