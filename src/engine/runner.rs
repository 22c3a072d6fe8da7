mod diagnostics;
#[cfg(feature = "server")]
mod http;
#[cfg(feature = "live")]
pub(crate) mod watch;

use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError, channel};
use std::time::{Duration, Instant};

use petgraph::Direction;
use petgraph::graph::NodeIndex;
use rayon::Yield;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::blueprint::TaskGraph;
use crate::core::{Dynamic, Environment};
use crate::engine::TaskContext;
use crate::error::TaskError;

pub use diagnostics::{Outcome, Report};

/// Outputs of every task that has succeeded so far, kept between runs so a
/// single task can be re-run on its own later.
pub(crate) type Cache = HashMap<NodeIndex, Dynamic>;

/// Executes the given subset of the graph on the rayon pool. A task starts as
/// soon as all of its dependencies inside the subset have succeeded;
/// dependencies outside the subset are taken from `cache`.
///
/// A failed task never stops unrelated work. Everything that transitively
/// depends on it is marked skipped, while independent tasks run to
/// completion.
pub(crate) fn run_tasks_parallel(
    graph: &TaskGraph,
    env: &Environment,
    cache: &mut Cache,
    nodes_to_run: &HashSet<NodeIndex>,
) -> anyhow::Result<Report> {
    let g = &graph.graph;

    let mut dependency_counts: HashMap<NodeIndex, usize> = nodes_to_run
        .iter()
        .map(|&i| {
            (
                i,
                g.neighbors_directed(i, Direction::Incoming)
                    .filter(|dep| nodes_to_run.contains(dep))
                    .count(),
            )
        })
        .collect();

    let total_tasks = nodes_to_run.len();
    let mut report = Report::default();

    if total_tasks == 0 {
        return Ok(report);
    }

    let root_span = tracing::span!(Level::INFO, "building_tasks");
    root_span.pb_set_length(total_tasks as u64);
    root_span.pb_set_style(&crate::utils::get_style_build()?);
    root_span.pb_set_message("Running tasks...");
    let _enter = root_span.enter();

    let pb_style = crate::utils::get_style_task()?;
    let mut resolved = HashSet::new();

    // The coordinating loop below stays on the calling thread.
    rayon::in_place_scope(|s| -> anyhow::Result<()> {
        let (result_sender, result_receiver) =
            channel::<(NodeIndex, Result<Dynamic, TaskError>, Duration)>();

        let spawn_task = |cache: &Cache, index: NodeIndex| {
            let node = &g[index];

            let dependencies: Result<Vec<_>, TaskError> = node
                .dependencies
                .iter()
                .map(|name| {
                    graph
                        .lookup(name)
                        .ok()
                        .and_then(|dep| cache.get(&dep))
                        .map(|output| (name.as_ref(), output.clone()))
                        .ok_or_else(|| TaskError::MissingDependency(name.to_string()))
                })
                .collect();

            let sender = result_sender.clone();

            let dependencies = match dependencies {
                Ok(dependencies) => dependencies,
                Err(e) => {
                    let _ = sender.send((index, Err(e), Duration::ZERO));
                    return;
                }
            };

            let pb_style = pb_style.clone();

            s.spawn(move |_| {
                let span = tracing::span!(Level::INFO, "task", name = node.name.as_ref());
                span.pb_set_style(&pb_style);
                span.pb_set_message(&format!("Running {}", node.name));
                let _enter = span.enter();

                let context = TaskContext::new(&node.name, env, dependencies);
                let start_time = Instant::now();

                // Tasks only see cloned outputs and the shared environment, so
                // a panic cannot leave anything half-updated for other tasks.
                let output = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    node.task.execute(&context)
                })) {
                    Ok(result) => result,
                    Err(panic) => {
                        let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                            s.to_string()
                        } else if let Some(s) = panic.downcast_ref::<String>() {
                            s.clone()
                        } else {
                            String::from("unknown payload")
                        };

                        Err(TaskError::Panic(msg))
                    }
                };

                let _ = sender.send((index, output, start_time.elapsed()));
            });
        };

        for &index in nodes_to_run {
            if dependency_counts.get(&index).copied().unwrap_or(0) == 0 {
                spawn_task(cache, index);
            }
        }

        while resolved.len() < total_tasks {
            let (index, output, duration) = next_result(&result_receiver)?;
            let name = g[index].name.to_string();

            resolved.insert(index);
            root_span.pb_inc(1);

            match output {
                Ok(output) => {
                    let took = crate::utils::as_overhead(duration);
                    tracing::info!(task = %name, "finished {took}");
                    cache.insert(index, output);
                    report.push(name, Outcome::Succeeded { duration });

                    for dependent in g.neighbors_directed(index, Direction::Outgoing) {
                        if resolved.contains(&dependent) {
                            continue;
                        }
                        if let Some(count) = dependency_counts.get_mut(&dependent) {
                            *count -= 1;
                            if *count == 0 {
                                spawn_task(cache, dependent);
                            }
                        }
                    }
                }
                Err(error) => {
                    tracing::error!(task = %name, "{error}");
                    cache.remove(&index);

                    for blocked in blocked_by(graph, index, nodes_to_run, &resolved) {
                        resolved.insert(blocked);
                        root_span.pb_inc(1);
                        let blocked_name = g[blocked].name.to_string();
                        tracing::warn!(task = %blocked_name, "skipped, blocked by '{name}'");
                        report.push(blocked_name, Outcome::Skipped { blocked_by: name.clone() });
                    }

                    report.push(name, Outcome::Failed(error));
                }
            }
        }

        Ok(())
    })?;

    Ok(report)
}

/// Wait for the next finished task. On a pool thread, queued tasks are run
/// while waiting, otherwise a pool of one thread would never get to them.
fn next_result<T>(receiver: &Receiver<T>) -> anyhow::Result<T> {
    loop {
        match receiver.try_recv() {
            Ok(message) => return Ok(message),
            Err(TryRecvError::Disconnected) => anyhow::bail!("task result channel closed"),
            Err(TryRecvError::Empty) => {}
        }

        match rayon::yield_now() {
            Some(Yield::Executed) => {}
            Some(Yield::Idle) => match receiver.recv_timeout(Duration::from_millis(1)) {
                Ok(message) => return Ok(message),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => anyhow::bail!("task result channel closed"),
            },
            None => return Ok(receiver.recv()?),
        }
    }
}

/// Unresolved members of the run that transitively depend on `failed`.
fn blocked_by(
    graph: &TaskGraph,
    failed: NodeIndex,
    nodes_to_run: &HashSet<NodeIndex>,
    resolved: &HashSet<NodeIndex>,
) -> Vec<NodeIndex> {
    let g = &graph.graph;
    let mut found = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = vec![failed];

    while let Some(index) = stack.pop() {
        for dependent in g.neighbors_directed(index, Direction::Outgoing) {
            if nodes_to_run.contains(&dependent)
                && !resolved.contains(&dependent)
                && seen.insert(dependent)
            {
                found.push(dependent);
                stack.push(dependent);
            }
        }
    }

    found.sort();
    found
}
