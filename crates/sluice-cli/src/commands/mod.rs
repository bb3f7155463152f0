pub mod build;
pub mod dev;
pub mod version;

use sluice_core::config::CONFIG_FILE_NAME;
use sluice_core::{codes, Error, PipelineConfig, PipelineContext};
use std::path::{Path, PathBuf};

/// Exit code for build failures (resolution, transform, emit).
pub const EXIT_BUILD_FAILED: i32 = 1;
/// Exit code for usage and configuration errors.
pub const EXIT_USAGE: i32 = 2;

/// Where the project is and how to find its config.
#[derive(Debug, Clone)]
pub struct ProjectArgs {
    pub cwd: PathBuf,
    pub config: Option<PathBuf>,
}

impl ProjectArgs {
    /// Load the config, let `adjust` apply flag overrides, and create the context.
    pub fn context(
        &self,
        adjust: impl FnOnce(PipelineConfig) -> PipelineConfig,
    ) -> Result<PipelineContext, Error> {
        let config = PipelineConfig::load(&self.cwd, self.config.as_deref())?;
        PipelineContext::new(&self.cwd, adjust(config))
    }

    /// The config file in use, or where `sluice.config.json` would be.
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        let path = match &self.config {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => self.cwd.join(path),
            None => self.cwd.join(CONFIG_FILE_NAME),
        };
        dunce::canonicalize(&path).unwrap_or(path)
    }
}

/// Print a configuration error and exit with [`EXIT_USAGE`].
pub fn config_failure(err: &Error, json: bool) -> ! {
    if json {
        let value = serde_json::json!({
            "ok": false,
            "error": { "code": codes::CONFIG_INVALID, "message": err.to_string() },
        });
        println!("{value}");
    } else {
        eprintln!("error[{}]: {err}", codes::CONFIG_INVALID);
    }
    std::process::exit(EXIT_USAGE);
}

/// Root-relative display of a path.
pub fn display_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}
