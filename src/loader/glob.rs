use camino::Utf8PathBuf;

use crate::engine::{TaskContext, TypedTask};
use crate::error::TaskError;
use crate::loader::Sources;
use crate::pipeline::Pipeline;

/// Paths produced by a glob task, relative to the destination root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Written {
    pub files: Vec<Utf8PathBuf>,
}

/// Reads every file matched by `sources` and streams them through `pipeline`.
pub struct GlobTask {
    sources: Sources,
    pipeline: Pipeline,
}

impl GlobTask {
    pub fn new(sources: Sources, pipeline: Pipeline) -> Self {
        Self { sources, pipeline }
    }
}

impl TypedTask for GlobTask {
    type Output = Written;

    fn execute(&self, ctx: &TaskContext<'_>) -> Result<Written, TaskError> {
        let files = self.sources.read()?;

        tracing::debug!(
            task = ctx.name,
            variant = self.pipeline.variant(),
            "read {} file(s)",
            files.len()
        );

        let files = self.pipeline.run(ctx, files)?;

        ctx.finish(Written {
            files: files.into_iter().map(|file| file.path).collect(),
        })
    }
}
