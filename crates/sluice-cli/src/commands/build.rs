//! `sluice build` command implementation.

use super::{config_failure, ProjectArgs, EXIT_BUILD_FAILED, EXIT_USAGE};
use miette::{miette, Result};
use serde::Serialize;
use sluice_core::{run_build, BuildOptions, BuildSummary, PipelineError};

/// Build command action.
#[derive(Debug, Clone)]
pub struct BuildAction {
    pub project: ProjectArgs,
    /// Output directory override, relative to the project root.
    pub out_dir: Option<String>,
    /// Ignore cached transform results.
    pub force: bool,
}

#[derive(Serialize)]
struct BuildResultJson<'a> {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<&'a BuildSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<BuildErrorJson>,
}

#[derive(Serialize)]
struct BuildErrorJson {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<String>,
}

/// Run a one-shot build. Exits with 1 on build failure, 2 on config errors.
pub fn run(action: BuildAction, json: bool) -> Result<()> {
    let out_dir = action.out_dir.clone();
    let mut ctx = match action.project.context(|config| match out_dir {
        Some(dir) => config.with_output_path(dir),
        None => config,
    }) {
        Ok(ctx) => ctx,
        Err(err) => config_failure(&err, json),
    };
    ctx.set_force(action.force);

    let span = tracing::info_span!("build", cmd = "build", cwd = %ctx.root().display());
    let _guard = span.enter();

    match run_build(&ctx, &BuildOptions::default()) {
        Ok(output) => {
            if json {
                let result = BuildResultJson {
                    ok: true,
                    summary: Some(&output.summary),
                    error: None,
                };
                println!("{}", serde_json::to_string(&result).unwrap_or_default());
            } else {
                print_summary(&output.summary, &ctx.output_dir().display().to_string());
            }
            Ok(())
        }
        Err(err) => {
            let code = if err.is_config() { EXIT_USAGE } else { EXIT_BUILD_FAILED };
            report_failure(&ctx, &err, json);
            std::process::exit(code);
        }
    }
}

fn report_failure(ctx: &sluice_core::PipelineContext, err: &PipelineError, json: bool) {
    let file = err.file().map(|path| super::display_path(ctx.root(), &path));
    if json {
        let result = BuildResultJson {
            ok: false,
            summary: None,
            error: Some(BuildErrorJson {
                code: err.code(),
                message: err.to_string(),
                file,
            }),
        };
        println!("{}", serde_json::to_string(&result).unwrap_or_default());
        return;
    }

    let report = match file {
        Some(file) => miette!(code = err.code(), help = format!("in {file}"), "{err}"),
        None => miette!(code = err.code(), "{err}"),
    };
    eprintln!("{report:?}");
}

fn print_summary(summary: &BuildSummary, out_dir: &str) {
    println!();
    for chunk in &summary.chunks {
        println!(
            "  {:<40} {} chunk '{}', {} module(s)",
            chunk.file,
            format!("{:?}", chunk.kind).to_lowercase(),
            chunk.name,
            chunk.modules
        );
        if let Some(css) = &chunk.css {
            println!("  {css:<40} styles");
        }
    }
    for asset in &summary.assets {
        println!("  {asset:<40} asset");
    }
    for warning in &summary.warnings {
        println!("  warning: {warning}");
    }
    println!();
    println!(
        "  {} file(s) in {out_dir} ({} written, {} unchanged) in {}ms",
        summary.files.len(),
        summary.written.len(),
        summary.unchanged.len(),
        summary.duration_ms
    );
}
