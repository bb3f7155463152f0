//! Per-pipeline state.
//!
//! Everything one pipeline instance needs lives here, so several pipelines
//! can coexist in a process.

use crate::config::PipelineConfig;
use crate::error::Error;
use crate::plugin::{BannerPlugin, CleanPlugin, CopyPlugin, Hooks, HtmlPlugin, Plugin};
use crate::resolve::Resolver;
use crate::rules::RuleMatcher;
use crate::transform::{Transform, TransformExecutor, TransformRegistry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Upper bound on the transform pool size.
const MAX_PARALLELISM: usize = 64;

/// Configuration, rules, resolver, transforms, hooks and thread pool of one pipeline.
pub struct PipelineContext {
    root: PathBuf,
    config: PipelineConfig,
    matcher: RuleMatcher,
    resolver: Resolver,
    executor: TransformExecutor,
    hooks: Hooks,
    plugins: Vec<String>,
    pool: rayon::ThreadPool,
}

impl PipelineContext {
    /// Create a context for a project root. Built-in plugins are registered
    /// according to `config`.
    pub fn new(root: &Path, config: PipelineConfig) -> Result<Self, Error> {
        config.validate()?;
        let root = dunce::canonicalize(root)?;
        config.validate_output_dir(&root)?;
        let matcher = RuleMatcher::new(&config.rules, config.inline_limit)?;
        let resolver = Resolver::new(&root, &config.resolve, &config.externals);

        let mut executor = TransformExecutor::new(TransformRegistry::with_builtins());
        if config.cache {
            executor = executor.with_cache();
        }

        let threads = config.parallelism.unwrap_or_else(|| {
            std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        });
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.clamp(1, MAX_PARALLELISM))
            .thread_name(|i| format!("sluice-transform-{i}"))
            .build()
            .map_err(|e| Error::other(format!("failed to start transform pool: {e}")))?;

        let mut ctx = Self {
            root,
            config,
            matcher,
            resolver,
            executor,
            hooks: Hooks::new(),
            plugins: Vec::new(),
            pool,
        };
        ctx.register_builtin_plugins();
        Ok(ctx)
    }

    fn register_builtin_plugins(&mut self) {
        let config = self.config.clone();
        if let Some(banner) = &config.banner {
            self.register(&BannerPlugin::new(banner.clone()));
        }
        if let Some(html) = &config.html {
            self.register(&HtmlPlugin::new(&self.root, html, &config.output.public_path));
        }
        if !config.copy.is_empty() {
            self.register(&CopyPlugin::new(&self.root, &config.copy));
        }
        if config.output.clean {
            self.register(&CleanPlugin::new(&self.root));
        }
    }

    /// Register a plugin's callbacks.
    pub fn register(&mut self, plugin: &dyn Plugin) {
        debug!(plugin = plugin.name(), "registering plugin");
        plugin.apply(&mut self.hooks);
        self.plugins.push(plugin.name().to_string());
    }

    /// Register a custom transform.
    pub fn register_transform(&mut self, transform: Arc<dyn Transform>) {
        self.executor.registry_mut().register(transform);
    }

    /// Bypass transform cache reads.
    pub fn set_force(&mut self, force: bool) {
        self.executor.set_force(force);
    }

    /// Canonical project root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[must_use]
    pub fn output_dir(&self) -> PathBuf {
        self.config.output_dir(&self.root)
    }

    #[must_use]
    pub fn matcher(&self) -> &RuleMatcher {
        &self.matcher
    }

    #[must_use]
    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    #[must_use]
    pub fn executor(&self) -> &TransformExecutor {
        &self.executor
    }

    #[must_use]
    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut Hooks {
        &mut self.hooks
    }

    /// Names of registered plugins, in registration order.
    #[must_use]
    pub fn plugins(&self) -> &[String] {
        &self.plugins
    }

    /// Bounded pool the transforms run on.
    #[must_use]
    pub fn pool(&self) -> &rayon::ThreadPool {
        &self.pool
    }

    /// Root-relative path with forward slashes (absolute if outside the root).
    #[must_use]
    pub fn rel_path(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(rel) => rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"),
            Err(_) => path.to_string_lossy().replace('\\', "/"),
        }
    }
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("root", &self.root)
            .field("rules", &self.matcher.len())
            .field("plugins", &self.plugins)
            .field("threads", &self.pool.current_num_threads())
            .finish_non_exhaustive()
    }
}
