use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::Parser;

use assetflow::{CONFIG_FILE, Config, Mode, Project, Report};

/// Builds the static assets of a site.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Tasks to run together with their dependencies. `watch` builds
    /// `default` and keeps rebuilding on change.
    #[arg(value_name = "TASK", default_value = "default")]
    tasks: Vec<String>,

    /// Minify everything and skip source maps and reload signals.
    #[arg(long)]
    production: bool,

    /// Configuration file; the defaults are used when it doesn't exist.
    #[arg(long, default_value = CONFIG_FILE)]
    config: Utf8PathBuf,

    /// Print the task graph as a mermaid diagram and exit.
    #[arg(long)]
    graph: bool,

    /// List the invocable tasks and exit.
    #[arg(long)]
    list: bool,
}

fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    assetflow::init_logging()?;

    let mode = Mode::from_flag(args.production);
    let config = Config::load(&args.config)?.canonicalize()?;
    let mut project = Project::new(config, mode)?;

    if args.graph {
        print!("{}", project.graph());
        return Ok(ExitCode::SUCCESS);
    }

    if args.list {
        let graph = project.graph();
        for name in graph.names() {
            let dependencies = graph.dependencies_of(name)?;
            if dependencies.is_empty() {
                println!("{name}");
            } else {
                println!("{name} <- {}", dependencies.join(", "));
            }
        }
        return Ok(ExitCode::SUCCESS);
    }

    let watch = args.tasks.iter().any(|task| task == "watch");
    let targets: Vec<&str> = args
        .tasks
        .iter()
        .map(String::as_str)
        .filter(|task| *task != "watch")
        .collect();

    let mut report = Report::default();
    if !targets.is_empty() {
        report = project.run(&targets)?;
        report.log();
    }

    if watch {
        report.merge(run_watch(&mut project)?);
    }

    if report.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

#[cfg(feature = "live")]
fn run_watch(project: &mut Project) -> anyhow::Result<Report> {
    let report = project.watch()?;
    report.log();
    Ok(report)
}

#[cfg(not(feature = "live"))]
fn run_watch(project: &mut Project) -> anyhow::Result<Report> {
    tracing::warn!("built without live reload support, building once");
    let report = project.run(&["default"])?;
    report.log();
    Ok(report)
}
