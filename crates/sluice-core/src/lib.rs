#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]

//! Core of the sluice asset pipeline.
//!
//! Sources are matched against rules, run through transform chains, linked
//! into a module graph, partitioned into chunks and emitted as hashed
//! artifacts. Plugins observe and adjust each stage through typed hooks.

pub mod builder;
pub mod chunks;
pub mod codes;
pub mod config;
pub mod context;
pub mod dev;
pub mod emit;
pub mod error;
pub mod graph;
pub mod pipeline;
pub mod plugin;
pub mod resolve;
pub mod rules;
pub mod scan;
pub mod template;
pub mod transform;
pub mod version;

pub use builder::{BuildMode, CycleWarning, GraphBuilder};
pub use chunks::{Chunk, ChunkKind, ChunkPartition};
pub use config::PipelineConfig;
pub use context::PipelineContext;
pub use dev::DevSession;
pub use emit::{Artifact, ArtifactKind, Manifest};
pub use error::{Error, PipelineError};
pub use graph::{Module, ModuleGraph, ModuleId, ModuleKey};
pub use pipeline::{run_build, BuildOptions, BuildOutput, BuildSummary, OutputTarget};
pub use plugin::{Hooks, Plugin, PluginError};
pub use resolve::{ResolveError, Resolver};
pub use rules::RuleMatcher;
pub use transform::{Transform, TransformError};
pub use version::VERSION;
