//! Watch mode is implemented as a three-part system:
//!
//! 1. **File watcher**: `notify` monitors the source directories of every
//!    watched asset class, debounced so one save results in one rebuild.
//! 2. **WebSocket server**: a dedicated `tungstenite` thread keeps the
//!    connections of open browser tabs.
//! 3. **Client script**: the dev server appends a small snippet to every
//!    HTML response. It connects to the socket and either reloads the page on
//!    `"reload"` or swaps stylesheets on `"inject"`.
//!
//! ## The Loop
//!
//! When a change is detected, every task bound to the affected asset class
//! is re-run on its own, one after another, using the cached outputs of its
//! dependencies. Reload signals emitted by those runs are coalesced into a
//! single message for the browsers.

use std::collections::HashSet;
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use notify::RecursiveMode;
use notify_debouncer_full::new_debouncer;
use tungstenite::WebSocket;

use crate::blueprint::TaskGraph;
use crate::core::{Environment, Signal};
use crate::engine::{Cache, run_tasks_parallel};
use crate::error::WatchError;
use crate::loader::Sources;
use crate::manifest::ServerOptions;

/// An asset class whose changes re-run a task.
pub(crate) struct Binding {
    pub class: String,
    pub task: String,
    pub sources: Sources,
}

pub(crate) fn watch(
    graph: &TaskGraph,
    env: &Environment,
    cache: &mut Cache,
    bindings: &[Binding],
    signals: Receiver<Signal>,
    options: &ServerOptions,
    dist: &Utf8Path,
) -> Result<(), WatchError> {
    let address = ("127.0.0.1", options.reload_port);
    let tcp = TcpListener::bind(address).map_err(|source| WatchError::Bind {
        port: options.reload_port,
        source,
    })?;

    let clients = Arc::new(Mutex::new(vec![]));
    let _thread_i = new_thread_ws_incoming(tcp, clients.clone());
    let (tx_reload, _thread_o) = new_thread_ws_reload(clients.clone());

    let (tx, rx) = std::sync::mpsc::channel();
    let mut debouncer = new_debouncer(Duration::from_millis(options.debounce_ms), None, tx)?;

    let mut watched = HashSet::new();
    for binding in bindings {
        for path in binding.sources.watch_roots() {
            if path.exists() {
                watched.insert(path);
            } else {
                tracing::warn!(class = %binding.class, "not watching missing {path}");
            }
        }
    }

    for path in collapse_watch_paths(watched) {
        tracing::info!("watching {}", path);
        debouncer.watch(path.as_std_path(), RecursiveMode::Recursive)?;
    }

    #[cfg(feature = "server")]
    let _thread_http = super::http::start(dist.to_path_buf(), options.port, options.reload_port);
    #[cfg(not(feature = "server"))]
    let _ = dist;

    tracing::info!("watching for changes...");

    loop {
        match rx.recv()? {
            Ok(events) => {
                let paths: Vec<_> = events
                    .iter()
                    .flat_map(|de| de.event.paths.iter())
                    .filter_map(|path| Utf8Path::from_path(path))
                    .collect();

                let tasks = affected(bindings, &paths);
                if tasks.is_empty() {
                    continue;
                }

                if let Some(message) = rerun(graph, env, cache, &tasks, &signals) {
                    tracing::info!("notifying browsers: {message}");
                    let _ = tx_reload.send(message);
                }
            }
            Err(errors) => {
                for e in errors {
                    tracing::error!("watch error: {e:?}");
                }
            }
        }
    }
}

/// Re-run `tasks` one after another and decide what browsers are told.
/// Signals emitted by a batch are only passed on when every task in it
/// succeeded; otherwise they are dropped with the failed batch.
pub(crate) fn rerun(
    graph: &TaskGraph,
    env: &Environment,
    cache: &mut Cache,
    tasks: &[&str],
    signals: &Receiver<Signal>,
) -> Option<&'static str> {
    let mut succeeded = true;

    for name in tasks {
        tracing::info!(task = name, "change detected, re-running");

        let index = match graph.lookup(name) {
            Ok(index) => index,
            Err(e) => {
                tracing::error!("{e}");
                succeeded = false;
                continue;
            }
        };

        match run_tasks_parallel(graph, env, cache, &HashSet::from([index])) {
            Ok(report) => {
                report.log();
                succeeded &= report.is_success();
            }
            Err(e) => {
                tracing::error!("error running tasks: {e}");
                succeeded = false;
            }
        }
    }

    let pending: Vec<_> = signals.try_iter().collect();

    if !succeeded {
        if !pending.is_empty() {
            tracing::warn!("rebuild failed, not notifying browsers");
        }
        return None;
    }

    coalesce(pending)
}

/// Tasks to re-run for the changed paths, in binding order, without repeats.
pub(crate) fn affected<'a>(bindings: &'a [Binding], paths: &[&Utf8Path]) -> Vec<&'a str> {
    let mut tasks: Vec<&str> = Vec::new();

    for binding in bindings {
        if tasks.contains(&binding.task.as_str()) {
            continue;
        }
        if paths.iter().any(|path| binding.sources.matches(path)) {
            tasks.push(&binding.task);
        }
    }

    tasks
}

/// Collapse a burst of signals into one browser message. Any full reload
/// wins over stylesheet injection.
pub(crate) fn coalesce(signals: impl IntoIterator<Item = Signal>) -> Option<&'static str> {
    let mut message = None;

    for signal in signals {
        match signal {
            Signal::Reload(_) => return Some("reload"),
            Signal::Inject(_) => message = Some("inject"),
        }
    }

    message
}

fn new_thread_ws_incoming(
    server: TcpListener,
    client: Arc<Mutex<Vec<WebSocket<TcpStream>>>>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for stream in server.incoming() {
            let Ok(stream) = stream else { continue };
            let Ok(socket) = tungstenite::accept(stream) else {
                tracing::debug!("websocket handshake failed");
                continue;
            };
            client.lock().unwrap_or_else(|e| e.into_inner()).push(socket);
        }
    })
}

fn new_thread_ws_reload(
    client: Arc<Mutex<Vec<WebSocket<TcpStream>>>>,
) -> (Sender<&'static str>, JoinHandle<()>) {
    let (tx, rx) = std::sync::mpsc::channel::<&'static str>();

    let thread = std::thread::spawn(move || {
        while let Ok(message) = rx.recv() {
            let mut clients = client.lock().unwrap_or_else(|e| e.into_inner());
            let mut broken = vec![];

            for (i, socket) in clients.iter_mut().enumerate() {
                match socket.send(message.into()) {
                    Ok(_) => {}
                    Err(tungstenite::error::Error::Io(e)) => {
                        if e.kind() == std::io::ErrorKind::BrokenPipe {
                            broken.push(i);
                        }
                    }
                    Err(
                        tungstenite::error::Error::ConnectionClosed
                        | tungstenite::error::Error::AlreadyClosed,
                    ) => {
                        broken.push(i);
                    }
                    Err(e) => {
                        tracing::error!("Error: {e:?}");
                    }
                }
            }

            for i in broken.into_iter().rev() {
                clients.remove(i);
            }

            // Close all but the last 10 connections
            let len = clients.len();
            if len > 10 {
                for mut socket in clients.drain(0..len - 10) {
                    socket.close(None).ok();
                }
            }
        }
    });

    (tx, thread)
}

/// Reduces a set of paths to the minimal set of watch roots.
///
/// If we watch `/a` and `/a/b`, we only need to watch `/a` because
/// the watcher is recursive.
fn collapse_watch_paths(paths: HashSet<Utf8PathBuf>) -> Vec<Utf8PathBuf> {
    let mut paths: Vec<_> = paths.into_iter().collect();
    paths.sort();

    let mut filtered: Vec<Utf8PathBuf> = Vec::new();
    for path in paths {
        if let Some(last) = filtered.last()
            && path.starts_with(last)
        {
            continue;
        }
        filtered.push(path);
    }

    filtered
}
