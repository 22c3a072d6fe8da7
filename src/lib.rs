#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod blueprint;
mod core;
mod engine;
mod error;
pub mod loader;
pub mod manifest;
pub mod pipeline;
mod project;
mod utils;

pub use crate::blueprint::{Blueprint, TaskDef, TaskGraph};
pub use crate::core::{Environment, Mode, Signal};
pub use crate::engine::{Aggregate, Outcome, Report, TaskContext, TypedTask};
pub use crate::error::*;
pub use crate::manifest::{AssetSource, CONFIG_FILE, Config, SourceManifest};
pub use crate::project::{DEFAULT_TASKS, Project, build_graph};
pub use crate::utils::init_logging;
