//! Ordered transformation steps.
//!
//! A [`Pipeline`] is a named sequence of [`Step`]s. Tasks pick one of two
//! variants, `development` or `production`, when they are constructed, so the
//! mode is consulted exactly once per task instead of inside each step.

mod sourcemap;

pub use sourcemap::{SourceMap, split_inline};

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use rayon::iter::{IntoParallelIterator, ParallelIterator};

use crate::core::{Hash32, Signal};
use crate::engine::TaskContext;
use crate::error::TransformError;
use crate::loader::SourceFile;

/// One stage of a pipeline, operating on the whole stream of files.
pub trait Step: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(
        &self,
        ctx: &TaskContext<'_>,
        files: Vec<SourceFile>,
    ) -> Result<Vec<SourceFile>, TransformError>;
}

/// Map every file through `f` in parallel, keeping the stream order and
/// attributing failures to the file and step.
pub fn each<F>(
    files: Vec<SourceFile>,
    step: &'static str,
    f: F,
) -> Result<Vec<SourceFile>, TransformError>
where
    F: Fn(SourceFile) -> anyhow::Result<SourceFile> + Send + Sync,
{
    files
        .into_par_iter()
        .map(|file| {
            let origin = file.origin.clone();
            f(file).map_err(|e| TransformError::new(origin, step, e))
        })
        .collect()
}

pub struct Pipeline {
    variant: &'static str,
    steps: Vec<Box<dyn Step>>,
}

impl Pipeline {
    pub fn new(variant: &'static str) -> Self {
        Self {
            variant,
            steps: Vec::new(),
        }
    }

    pub fn development() -> Self {
        Self::new("development")
    }

    pub fn production() -> Self {
        Self::new("production")
    }

    pub fn step(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Append a step only when `enabled`.
    pub fn step_if(self, enabled: bool, step: impl Step + 'static) -> Self {
        if enabled { self.step(step) } else { self }
    }

    pub fn variant(&self) -> &'static str {
        self.variant
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|step| step.name()).collect()
    }

    pub fn run(
        &self,
        ctx: &TaskContext<'_>,
        mut files: Vec<SourceFile>,
    ) -> Result<Vec<SourceFile>, TransformError> {
        for step in &self.steps {
            tracing::trace!(
                task = ctx.name,
                step = step.name(),
                files = files.len(),
                "applying step"
            );
            files = step.apply(ctx, files)?;
        }
        Ok(files)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Pipeline({}: {})", self.variant, self.step_names().join(" → "))
    }
}

/// Captures the untouched source so a map can be written later.
pub struct SourceMapInit;

impl Step for SourceMapInit {
    fn name(&self) -> &'static str {
        "sourcemap-init"
    }

    fn apply(
        &self,
        _: &TaskContext<'_>,
        files: Vec<SourceFile>,
    ) -> Result<Vec<SourceFile>, TransformError> {
        each(files, self.name(), |mut file| {
            let content = file.text()?.to_string();
            let map = SourceMap::new(file.path.as_str(), file.origin.as_str(), content);
            file.source_map = Some(map);
            Ok(file)
        })
    }
}

/// Emits `<file>.map` next to every mapped file and links it from the file.
///
/// Sources are written relative to the map, so the written tree can be served
/// from the destination root and still resolve the originals.
pub struct SourceMapWrite {
    /// The project root as seen from the destination root.
    root: Utf8PathBuf,
}

impl SourceMapWrite {
    pub fn new(dest: &Utf8Path, root: &Utf8Path) -> Self {
        Self {
            root: relative_path(dest, root),
        }
    }

    fn source_for(&self, file: &SourceFile) -> String {
        let depth = file
            .path
            .parent()
            .map(|dir| dir.components().count())
            .unwrap_or(0);

        let mut source = Utf8PathBuf::new();
        for _ in 0..depth {
            source.push("..");
        }
        source.push(&self.root);
        source.push(&file.origin);
        source.into_string()
    }
}

/// Path leading from directory `from` to `to`, both given the same way.
fn relative_path(from: &Utf8Path, to: &Utf8Path) -> Utf8PathBuf {
    let from: Vec<_> = from.components().collect();
    let to: Vec<_> = to.components().collect();
    let common = from.iter().zip(&to).take_while(|(a, b)| a == b).count();

    let mut out = Utf8PathBuf::new();
    for _ in common..from.len() {
        out.push("..");
    }
    for component in &to[common..] {
        out.push(component.as_str());
    }
    out
}

impl Step for SourceMapWrite {
    fn name(&self) -> &'static str {
        "sourcemap-write"
    }

    fn apply(
        &self,
        _: &TaskContext<'_>,
        files: Vec<SourceFile>,
    ) -> Result<Vec<SourceFile>, TransformError> {
        let mut out = Vec::with_capacity(files.len() * 2);

        for mut file in files {
            let Some(mut map) = file.source_map.take() else {
                out.push(file);
                continue;
            };

            let name = file.path.file_name().unwrap_or(file.path.as_str()).to_string();
            let map_path = Utf8PathBuf::from(format!("{}.map", file.path));
            let map_name = format!("{name}.map");

            let text = std::str::from_utf8(&file.contents)
                .map_err(|e| TransformError::new(&file.origin, self.name(), e))?;
            map.relocate(self.source_for(&file));
            map.finish(name, text);

            let json = map
                .to_json()
                .map_err(|e| TransformError::new(&file.origin, self.name(), e))?;

            let mut text = text.trim_end().to_string();
            if file.path.extension() == Some("css") {
                text.push_str(&format!("\n/*# sourceMappingURL={map_name} */\n"));
            } else {
                text.push_str(&format!("\n//# sourceMappingURL={map_name}\n"));
            }

            let origin = file.origin.clone();
            file.contents = text.into_bytes();
            out.push(file);
            out.push(SourceFile::new(map_path, origin, json.into_bytes()));
        }

        Ok(out)
    }
}

/// Writes the stream below the destination root.
pub struct Dest {
    root: Utf8PathBuf,
    prune_source_maps: bool,
}

impl Dest {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            prune_source_maps: false,
        }
    }

    /// Remove `<file>.map` left behind by an earlier development run.
    pub fn prune_source_maps(mut self) -> Self {
        self.prune_source_maps = true;
        self
    }
}

impl Step for Dest {
    fn name(&self) -> &'static str {
        "dest"
    }

    fn apply(
        &self,
        _: &TaskContext<'_>,
        files: Vec<SourceFile>,
    ) -> Result<Vec<SourceFile>, TransformError> {
        each(files, self.name(), |file| {
            let path = self.root.join(&file.path);
            write_if_changed(&path, &file.contents)?;

            if self.prune_source_maps {
                let map = Utf8PathBuf::from(format!("{path}.map"));
                if map.exists() {
                    fs::remove_file(&map)?;
                }
            }

            Ok(file)
        })
    }
}

/// Write `data` to `path` unless the file already holds exactly that.
pub(crate) fn write_if_changed(path: &Utf8Path, data: &[u8]) -> std::io::Result<bool> {
    if path.is_file() && Hash32::hash_file(path)? == Hash32::hash(data) {
        tracing::trace!(%path, "unchanged");
        return Ok(false);
    }

    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }

    fs::write(path, data)?;
    Ok(true)
}

/// How connected browsers should pick up the written files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadStyle {
    Page,
    Inject,
}

/// Emits a reload signal for every written file except source maps.
pub struct NotifyReload(pub ReloadStyle);

impl NotifyReload {
    pub fn page() -> Self {
        Self(ReloadStyle::Page)
    }

    pub fn inject() -> Self {
        Self(ReloadStyle::Inject)
    }
}

impl Step for NotifyReload {
    fn name(&self) -> &'static str {
        "reload"
    }

    fn apply(
        &self,
        ctx: &TaskContext<'_>,
        files: Vec<SourceFile>,
    ) -> Result<Vec<SourceFile>, TransformError> {
        for file in &files {
            if file.path.extension() == Some("map") {
                continue;
            }

            let path = file.path.clone();
            ctx.env.emit(match self.0 {
                ReloadStyle::Page => Signal::Reload(path),
                ReloadStyle::Inject => Signal::Inject(path),
            });
        }

        Ok(files)
    }
}
