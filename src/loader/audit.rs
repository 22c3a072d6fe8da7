use std::collections::BTreeMap;

use serde::Deserialize;

use crate::engine::{TaskContext, TypedTask};
use crate::error::{TaskError, TransformError};
use crate::loader::Sources;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PackageManifest {
    #[serde(default)]
    dependencies: BTreeMap<String, String>,
    #[serde(default)]
    dev_dependencies: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub name: String,
    pub range: String,
    pub dev: bool,
    /// Why installing this range twice may give different results.
    pub problem: Option<&'static str>,
}

/// Result of the `pre` task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditReport {
    pub dependencies: Vec<Dependency>,
}

impl AuditReport {
    pub fn problems(&self) -> impl Iterator<Item = &Dependency> {
        self.dependencies.iter().filter(|dep| dep.problem.is_some())
    }
}

/// Checks the declared dependency ranges of the package manifest.
pub struct Audit {
    sources: Sources,
}

impl Audit {
    pub fn new(sources: Sources) -> Self {
        Self { sources }
    }
}

impl TypedTask for Audit {
    type Output = AuditReport;

    fn execute(&self, ctx: &TaskContext<'_>) -> Result<AuditReport, TaskError> {
        let files = self.sources.read()?;
        if files.is_empty() {
            tracing::warn!(task = ctx.name, "no package manifest found");
        }

        let mut report = AuditReport::default();

        for file in files {
            let manifest: PackageManifest = serde_json::from_slice(&file.contents)
                .map_err(|e| TransformError::new(&file.origin, "parse", e))?;

            let all = manifest
                .dependencies
                .into_iter()
                .map(|dep| (dep, false))
                .chain(manifest.dev_dependencies.into_iter().map(|dep| (dep, true)));

            for ((name, range), dev) in all {
                let problem = check_range(&range);
                if let Some(problem) = problem {
                    tracing::warn!(task = ctx.name, "{name}@\"{range}\": {problem}");
                }
                report.dependencies.push(Dependency { name, range, dev, problem });
            }
        }

        let problems = report.problems().count();
        if problems == 0 {
            tracing::info!(task = ctx.name, "{} dependencies checked", report.dependencies.len());
        }

        Ok(report)
    }
}

fn check_range(range: &str) -> Option<&'static str> {
    let range = range.trim();

    match range {
        "" | "*" | "x" | "X" => return Some("any version matches"),
        "latest" | "next" => return Some("follows a moving tag"),
        _ => {}
    }

    const REMOTE: [&str; 7] = ["http:", "https:", "git:", "git+", "github:", "file:", "link:"];
    if REMOTE.iter().any(|prefix| range.starts_with(prefix)) {
        return Some("not resolved from the registry");
    }

    // `user/repo` shorthand for a GitHub dependency.
    if range.contains('/') && !range.starts_with(['<', '>', '=', '~', '^']) {
        return Some("not resolved from the registry");
    }

    if range.starts_with('>') && !range.contains('<') {
        return Some("has no upper bound");
    }

    None
}
