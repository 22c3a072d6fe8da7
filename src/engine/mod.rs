mod runner;

use std::any::type_name;
use std::sync::{Arc, Mutex};

use crate::core::{Dynamic, Environment};
use crate::error::{TaskError, TransformError};

pub use runner::{Outcome, Report};
pub(crate) use runner::{Cache, run_tasks_parallel};

#[cfg(feature = "live")]
pub(crate) use runner::watch;

/// A unit of build work with a concrete output type.
///
/// The output is handed to dependent tasks, which look it up by the name of
/// the task that produced it through [`TaskContext::dependency`].
pub trait TypedTask: Send + Sync {
    type Output: Send + Sync + 'static;

    fn execute(&self, ctx: &TaskContext<'_>) -> Result<Self::Output, TaskError>;
}

/// Type-erased form of [`TypedTask`] stored in the graph.
pub(crate) trait Task: Send + Sync {
    fn output_type_name(&self) -> &'static str;

    fn execute(&self, ctx: &TaskContext<'_>) -> Result<Dynamic, TaskError>;
}

// A blanket implementation to automatically bridge the two. This is where the
// type erasure actually happens.
impl<T> Task for T
where
    T: TypedTask + 'static,
{
    fn output_type_name(&self) -> &'static str {
        type_name::<T::Output>()
    }

    fn execute(&self, ctx: &TaskContext<'_>) -> Result<Dynamic, TaskError> {
        Ok(Arc::new(T::execute(self, ctx)?))
    }
}

/// Task that does nothing; used for aggregate nodes such as `default`.
pub struct Aggregate;

impl TypedTask for Aggregate {
    type Output = ();

    fn execute(&self, _: &TaskContext<'_>) -> Result<(), TaskError> {
        Ok(())
    }
}

/// The context passed to every task execution.
pub struct TaskContext<'a> {
    /// Name of the running task.
    pub name: &'a str,
    /// Run-wide mode and reload channel.
    pub env: &'a Environment,
    dependencies: Vec<(&'a str, Dynamic)>,
    deferred: Mutex<Vec<TransformError>>,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(
        name: &'a str,
        env: &'a Environment,
        dependencies: Vec<(&'a str, Dynamic)>,
    ) -> Self {
        Self {
            name,
            env,
            dependencies,
            deferred: Mutex::new(Vec::new()),
        }
    }

    /// A context without dependencies, for running pipelines outside a graph.
    pub fn detached(name: &'a str, env: &'a Environment) -> Self {
        Self::new(name, env, Vec::new())
    }

    /// Output of a declared dependency.
    pub fn dependency<T: 'static>(&self, name: &str) -> Result<&T, TaskError> {
        self.dependencies
            .iter()
            .find(|(dep, _)| *dep == name)
            .and_then(|(_, output)| output.downcast_ref::<T>())
            .ok_or_else(|| TaskError::MissingDependency(name.to_string()))
    }

    /// Record a per-file failure without stopping the rest of the stream.
    /// The task fails once it finishes if anything was deferred.
    pub fn defer(&self, error: TransformError) {
        tracing::error!(task = self.name, "{error}");
        self.deferred.lock().unwrap_or_else(|e| e.into_inner()).push(error);
    }

    /// Turn deferred failures into the task result.
    pub fn finish<T>(&self, output: T) -> Result<T, TaskError> {
        let mut guard = self.deferred.lock().unwrap_or_else(|e| e.into_inner());
        let deferred = std::mem::take(&mut *guard);
        drop(guard);
        if deferred.is_empty() {
            Ok(output)
        } else {
            Err(TaskError::Partial(deferred))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Mode;

    #[test]
    fn dependency_lookup_checks_name_and_type() {
        let env = Environment::new(Mode::Development);
        let output: Dynamic = Arc::new(42u32);
        let ctx = TaskContext::new("b", &env, vec![("a", output)]);

        assert_eq!(*ctx.dependency::<u32>("a").unwrap(), 42);
        assert!(matches!(ctx.dependency::<String>("a"), Err(TaskError::MissingDependency(_))));
        assert!(matches!(ctx.dependency::<u32>("c"), Err(TaskError::MissingDependency(_))));
    }

    #[test]
    fn deferred_failures_fail_the_task() {
        let env = Environment::new(Mode::Development);
        let ctx = TaskContext::detached("images", &env);

        assert!(ctx.finish(()).is_ok());

        ctx.defer(TransformError::new("a.jpg", "responsive", anyhow::anyhow!("too small")));
        match ctx.finish(()) {
            Err(TaskError::Partial(errors)) => assert_eq!(errors.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
    }
}
