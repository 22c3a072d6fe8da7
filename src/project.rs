//! The asset graph of a project.
//!
//! Every task is constructed here from the resolved configuration and the
//! mode, so nothing below this module ever looks at either again.

use camino::Utf8Path;

use crate::blueprint::{Blueprint, TaskGraph};
use crate::core::{Environment, Mode};
use crate::engine::{Aggregate, Cache, Report, run_tasks_parallel};
use crate::error::ConfigError;
use crate::loader::icons::{Publish, RasterFallback, SvgSpriteTask};
use crate::loader::image::Responsive;
use crate::loader::{Audit, GlobTask, Sources, markup, script, styles};
use crate::manifest::Config;
use crate::pipeline::{Dest, NotifyReload, Pipeline};

/// What `default` runs.
pub const DEFAULT_TASKS: [&str; 7] = [
    "pre",
    "html",
    "js",
    "css",
    "images",
    "staticImages",
    "staticFiles",
];

/// Asset class and the task re-run when one of its files changes. Icons are
/// not watched.
const WATCHED: [(&str, &str); 6] = [
    ("scripts", "js"),
    ("markup", "html"),
    ("styles", "css"),
    ("images", "images"),
    ("staticImages", "staticImages"),
    ("staticFiles", "staticFiles"),
];

/// Construct the task graph of `config` for `mode`.
pub fn build_graph(config: &Config, mode: Mode) -> Result<TaskGraph, ConfigError> {
    let manifest = &config.manifest;
    let root = &manifest.root;
    let dest = manifest.dest_root();
    let sources = |class: &str| Sources::new(root, manifest.resolve(class)?);

    let mut blueprint = Blueprint::new();

    blueprint
        .task("pre")
        .run(Audit::new(sources("package")?));

    blueprint
        .task("js")
        .run(GlobTask::new(
            sources("scripts")?,
            script::pipeline(mode, &config.scripts.compiler, config.lint, root, &dest),
        ));

    blueprint
        .task("html")
        .run(GlobTask::new(sources("markup")?, markup::pipeline(mode, &dest)));

    blueprint
        .task("icons-svg")
        .run(SvgSpriteTask::new(sources("icons")?, config.icons.clone()));

    blueprint
        .task("icons-png")
        .depends_on(["icons-svg"])
        .run(RasterFallback::new("icons-svg"));

    blueprint
        .task("icons")
        .depends_on(["icons-png"])
        .run(Publish::new("icons-png", &dest, config.icons.clone()));

    let compile = styles::Compile::new(root, &config.styles.include).with_sprite("icons");
    blueprint
        .task("css")
        .depends_on(["icons"])
        .run(GlobTask::new(sources("styles")?, styles::pipeline(mode, compile, &dest)));

    let responsive = Responsive::new(&config.images)?;
    blueprint
        .task("images")
        .run(GlobTask::new(
            sources("images")?,
            crate::loader::image::pipeline(mode, responsive, &dest),
        ));

    blueprint
        .task("staticImages")
        .run(GlobTask::new(sources("staticImages")?, copy(mode, &dest)));

    blueprint
        .task("staticFiles")
        .run(GlobTask::new(sources("staticFiles")?, copy(mode, &dest)));

    blueprint
        .task("default")
        .depends_on(DEFAULT_TASKS)
        .run(Aggregate);

    blueprint.finish()
}

/// Files that are published as they are.
fn copy(mode: Mode, dest: &Utf8Path) -> Pipeline {
    match mode {
        Mode::Development => Pipeline::development()
            .step(Dest::new(dest))
            .step(NotifyReload::page()),
        Mode::Production => Pipeline::production().step(Dest::new(dest)),
    }
}

/// A configured project: the task graph plus the outputs of everything that
/// ran so far.
pub struct Project {
    config: Config,
    mode: Mode,
    graph: TaskGraph,
    cache: Cache,
}

impl Project {
    pub fn new(config: Config, mode: Mode) -> Result<Self, ConfigError> {
        let graph = build_graph(&config, mode)?;

        Ok(Self {
            config,
            mode,
            graph,
            cache: Cache::new(),
        })
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// Run `targets` and everything they depend on.
    pub fn run<S: AsRef<str>>(&mut self, targets: &[S]) -> anyhow::Result<Report> {
        let env = Environment::new(self.mode);
        self.run_with(&env, targets)
    }

    fn run_with<S: AsRef<str>>(
        &mut self,
        env: &Environment,
        targets: &[S],
    ) -> anyhow::Result<Report> {
        let nodes = self.graph.closure(targets)?;

        tracing::info!(
            mode = %self.mode,
            "running {} ({} task(s))",
            targets.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(", "),
            nodes.len()
        );

        run_tasks_parallel(&self.graph, env, &mut self.cache, &nodes)
    }

    /// Build `default`, then keep rebuilding on change while serving the
    /// destination root. Returns only in production, where there is nothing
    /// to watch.
    #[cfg(feature = "live")]
    pub fn watch(&mut self) -> anyhow::Result<Report> {
        use crate::engine::watch::{Binding, watch};

        if self.mode.is_production() {
            tracing::warn!("watch is not available in production, building once");
            return self.run(&["default"]);
        }

        let manifest = &self.config.manifest;
        let bindings = WATCHED
            .iter()
            .map(|(class, task)| {
                Ok(Binding {
                    class: class.to_string(),
                    task: task.to_string(),
                    sources: Sources::new(&manifest.root, manifest.resolve(class)?)?,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        let dest = manifest.dest_root();

        let (tx, rx) = std::sync::mpsc::channel();
        let env = Environment::new(self.mode).with_signals(tx);

        let report = self.run_with(&env, &["default"])?;
        report.log();
        // Nobody is connected yet.
        rx.try_iter().for_each(drop);

        let server = &self.config.server;
        watch(&self.graph, &env, &mut self.cache, &bindings, rx, server, &dest)?;

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use camino::Utf8PathBuf;

    use super::*;
    use crate::engine::Outcome;
    use crate::loader::image::UnusedImages;
    use crate::loader::script::ScriptCompiler;
    use crate::pipeline::SourceMap;

    const ICON: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="16" height="16">
<rect width="16" height="16" fill="#c00"/></svg>"##;

    fn project() -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();

        for sub in ["src/scripts", "src/styles", "src/icons/svg", "src/images/favicon"] {
            fs::create_dir_all(root.join(sub)).unwrap();
        }
        fs::write(root.join("package.json"), r#"{"dependencies": {"a": "^1.0.0"}}"#).unwrap();
        let html = "<html>\n  <body>\n    <p>hi</p>\n  </body>\n</html>\n";
        fs::write(root.join("src/index.html"), html).unwrap();
        let script = "// app\nvar a = 1;\n\nconsole.log(a);\n";
        fs::write(root.join("src/scripts/app.js"), script).unwrap();
        let scss = "@import \"sprite\";\n.home { @include sprite(\"home\"); }\n";
        fs::write(root.join("src/styles/main.scss"), scss).unwrap();
        fs::write(root.join("src/icons/svg/home.svg"), ICON).unwrap();
        fs::write(root.join("src/images/favicon/icon.png"), b"not decoded").unwrap();
        fs::write(root.join("src/CNAME"), "example.com\n").unwrap();

        let mut config = Config::default();
        config.manifest.root = root;
        config.scripts.compiler = ScriptCompiler::Passthrough;
        config.styles.include = vec![];
        config.images.unused_images = UnusedImages::PassThrough;

        (dir, config)
    }

    #[test]
    fn graph_has_every_invocable_task() {
        let (_dir, config) = project();
        let graph = build_graph(&config, Mode::Development).unwrap();

        let expected = [
            "pre",
            "js",
            "html",
            "icons-svg",
            "icons-png",
            "icons",
            "css",
            "images",
            "staticImages",
            "staticFiles",
            "default",
        ];
        for name in expected {
            assert!(graph.contains(name), "missing {name}");
        }

        assert_eq!(graph.dependencies_of("css").unwrap(), vec!["icons"]);
        assert_eq!(graph.dependencies_of("icons").unwrap(), vec!["icons-png"]);
        assert_eq!(graph.dependencies_of("icons-png").unwrap(), vec!["icons-svg"]);
        assert_eq!(graph.dependencies_of("default").unwrap().len(), DEFAULT_TASKS.len());
    }

    #[test]
    fn undeclared_class_is_rejected() {
        let (_dir, mut config) = project();
        config.manifest.assets.remove("styles");

        let err = Project::new(config, Mode::Development).err().unwrap();
        assert!(matches!(err, ConfigError::UndeclaredAssetClass(class) if class == "styles"));
    }

    #[test]
    fn unknown_target_is_rejected() {
        let (_dir, config) = project();
        let mut project = Project::new(config, Mode::Development).unwrap();
        assert!(project.run(&["fonts"]).is_err());
    }

    #[test]
    fn default_builds_everything_in_development() {
        let (_dir, config) = project();
        let dist = config.manifest.dest_root();
        let mut project = Project::new(config, Mode::Development).unwrap();

        let report = project.run(&["default"]).unwrap();
        assert!(report.is_success(), "{report}");
        assert_eq!(report.len(), 11);

        assert!(dist.join("index.html").is_file());
        assert!(dist.join("scripts/app.js").is_file());
        assert!(dist.join("scripts/app.js.map").is_file());
        assert!(dist.join("styles/main.css.map").is_file());
        assert!(dist.join("images/sprite.svg").is_file());
        assert!(dist.join("images/sprite.png").is_file());
        assert!(dist.join("images/favicon/icon.png").is_file());
        assert!(dist.join("CNAME").is_file());

        let css = fs::read_to_string(dist.join("styles/main.css")).unwrap();
        assert!(css.contains("../images/sprite.svg"));
    }

    #[test]
    fn production_minifies_without_maps() {
        let (_dir, config) = project();
        let dist = config.manifest.dest_root();
        let mut project = Project::new(config, Mode::Production).unwrap();

        let report = project.run(&["html", "js"]).unwrap();
        assert!(report.is_success(), "{report}");
        assert_eq!(report.len(), 2);

        assert_eq!(
            fs::read_to_string(dist.join("index.html")).unwrap(),
            "<html><body><p>hi</p></body></html>"
        );
        assert!(!dist.join("scripts/app.js.map").exists());
        assert!(!dist.join("images/sprite.svg").exists());
    }

    #[test]
    fn failing_task_skips_only_its_dependents() {
        let (_dir, config) = project();
        fs::write(config.manifest.root.join("src/icons/svg/broken.svg"), "<svg").unwrap();
        let dist = config.manifest.dest_root();
        let mut project = Project::new(config, Mode::Development).unwrap();

        let report = project.run(&["default"]).unwrap();
        assert!(!report.is_success());

        assert!(matches!(report.outcome("icons-svg"), Some(Outcome::Failed(_))));
        assert!(matches!(
            report.outcome("css"),
            Some(Outcome::Skipped { blocked_by }) if blocked_by == "icons-svg"
        ));
        assert!(matches!(report.outcome("default"), Some(Outcome::Skipped { .. })));
        assert!(report.outcome("js").is_some_and(Outcome::is_success));
        assert!(dist.join("index.html").is_file());
        assert!(!dist.join("styles/main.css").exists());
    }

    #[test]
    fn rerun_is_stable() {
        let (_dir, config) = project();
        let dist = config.manifest.dest_root();
        let mut project = Project::new(config, Mode::Production).unwrap();

        assert!(project.run(&["css"]).unwrap().is_success());
        let first = fs::read_to_string(dist.join("styles/main.css")).unwrap();

        let report = project.run(&["css"]).unwrap();
        assert_eq!(report.len(), 4);
        assert!(report.is_success(), "{report}");
        assert_eq!(fs::read_to_string(dist.join("styles/main.css")).unwrap(), first);
    }

    #[test]
    fn development_rerun_is_stable() {
        let (_dir, config) = project();
        let dist = config.manifest.dest_root();
        let mut project = Project::new(config, Mode::Development).unwrap();

        let written = [
            "styles/main.css",
            "styles/main.css.map",
            "scripts/app.js",
            "scripts/app.js.map",
        ];
        let read = || written.map(|path| fs::read_to_string(dist.join(path)).unwrap());

        assert!(project.run(&["css", "js"]).unwrap().is_success());
        let first = read();

        let report = project.run(&["css", "js"]).unwrap();
        assert!(report.is_success(), "{report}");
        assert_eq!(read(), first);

        let map: SourceMap = serde_json::from_str(&first[3]).unwrap();
        assert_eq!(map.sources, vec!["../../src/scripts/app.js"]);
        let map: SourceMap = serde_json::from_str(&first[1]).unwrap();
        assert_eq!(map.sources, vec!["../../src/styles/main.scss"]);
    }

    #[cfg(feature = "live")]
    #[test]
    fn watch_in_production_builds_once() {
        let (_dir, config) = project();
        let mut project = Project::new(config, Mode::Production).unwrap();

        let report = project.watch().unwrap();
        assert!(report.is_success(), "{report}");
        assert!(report.outcome("default").is_some());
    }
}
