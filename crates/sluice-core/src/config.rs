//! Pipeline configuration.
//!
//! Loaded from `sluice.config.json` at the project root. Every field is
//! optional; missing fields take the defaults below.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

/// File name looked up at the project root when no explicit config is given.
pub const CONFIG_FILE_NAME: &str = "sluice.config.json";

/// Default size, in bytes, at or below which assets are inlined.
pub const DEFAULT_INLINE_LIMIT: u64 = 10 * 1024;

/// Top-level pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Entry name to entry path (relative to the root).
    pub entry: BTreeMap<String, String>,
    pub output: OutputConfig,
    /// Transform rules, evaluated in declaration order.
    pub rules: Vec<RuleConfig>,
    pub resolve: ResolveConfig,
    /// Bare module name to the runtime global that provides it.
    pub externals: BTreeMap<String, String>,
    /// Inline limit for asset rules that do not set their own.
    pub inline_limit: u64,
    pub dev_server: DevServerConfig,
    /// HTML document generation. `null` disables it.
    pub html: Option<HtmlConfig>,
    /// Static directories copied into the output.
    pub copy: Vec<CopyConfig>,
    /// Text prepended to every script chunk.
    pub banner: Option<String>,
    /// Move modules reached from several chunk roots into shared chunks.
    pub split_shared: bool,
    /// Transform worker count. Defaults to available parallelism.
    pub parallelism: Option<usize>,
    /// Cache transform outputs keyed by content and chain.
    pub cache: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let mut entry = BTreeMap::new();
        entry.insert("main".to_string(), "src/main.js".to_string());

        let mut externals = BTreeMap::new();
        externals.insert("vue".to_string(), "Vue".to_string());

        Self {
            entry,
            output: OutputConfig::default(),
            rules: default_rules(),
            resolve: ResolveConfig::default(),
            externals,
            inline_limit: DEFAULT_INLINE_LIMIT,
            dev_server: DevServerConfig::default(),
            html: Some(HtmlConfig::default()),
            copy: vec![CopyConfig {
                from: "static".to_string(),
                to: "static".to_string(),
            }],
            banner: None,
            split_shared: true,
            parallelism: None,
            cache: true,
        }
    }
}

/// Output location and file naming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Output directory, relative to the root.
    pub path: String,
    /// Template for entry chunks.
    pub filename: String,
    /// Template for async and shared chunks.
    pub chunk_filename: String,
    /// Template for extracted stylesheets.
    pub css_filename: String,
    /// Prefix for URLs of emitted files.
    pub public_path: String,
    /// Remove stale files from the output directory after a build.
    pub clean: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: "dist".to_string(),
            filename: "js/[name].[hash:8].js".to_string(),
            chunk_filename: "js/[name].[hash:8].js".to_string(),
            css_filename: "css/[name].[contenthash:8].css".to_string(),
            public_path: "/".to_string(),
            clean: true,
        }
    }
}

/// A transform rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Regex matched against the root-relative path (plus any query).
    pub test: String,
    /// Regex that removes a path from this rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<String>,
    /// Ordered transforms applied to matching modules.
    #[serde(default, rename = "use")]
    pub use_: Vec<TransformSpec>,
    /// Inline-or-emit policy for matching assets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<AssetRuleConfig>,
}

impl RuleConfig {
    /// Create a rule with no transforms.
    #[must_use]
    pub fn new(test: impl Into<String>) -> Self {
        Self {
            test: test.into(),
            exclude: None,
            use_: Vec::new(),
            asset: None,
        }
    }

    /// Set the exclude pattern.
    #[must_use]
    pub fn with_exclude(mut self, exclude: impl Into<String>) -> Self {
        self.exclude = Some(exclude.into());
        self
    }

    /// Append a transform with no options.
    #[must_use]
    pub fn with_transform(self, transform: impl Into<String>) -> Self {
        self.with_transform_options(transform, serde_json::Value::Null)
    }

    /// Append a transform with options.
    #[must_use]
    pub fn with_transform_options(
        mut self,
        transform: impl Into<String>,
        options: serde_json::Value,
    ) -> Self {
        self.use_.push(TransformSpec {
            transform: transform.into(),
            options,
        });
        self
    }

    /// Attach an asset policy.
    #[must_use]
    pub fn with_asset(mut self, limit: Option<u64>, name: impl Into<String>) -> Self {
        self.asset = Some(AssetRuleConfig {
            limit,
            name: name.into(),
        });
        self
    }
}

/// One step of a rule's chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformSpec {
    /// Registered transform identifier.
    pub transform: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub options: serde_json::Value,
}

/// Asset policy settings on a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRuleConfig {
    /// Inline at or below this many bytes. Defaults to `inline_limit`.
    #[serde(default)]
    pub limit: Option<u64>,
    /// Output name template for emitted files.
    #[serde(default = "default_asset_name")]
    pub name: String,
}

fn default_asset_name() -> String {
    "[name].[hash:8].[ext]".to_string()
}

/// Resolution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolveConfig {
    /// Alias table, applied in declaration order.
    pub alias: Vec<AliasConfig>,
    /// Extensions tried in order. `""` or `"*"` means the path as written.
    pub extensions: Vec<String>,
}

impl Default for ResolveConfig {
    fn default() -> Self {
        Self {
            alias: vec![
                AliasConfig {
                    find: "vue$".to_string(),
                    replacement: "vue/dist/vue.runtime.esm.js".to_string(),
                },
                AliasConfig {
                    find: "@".to_string(),
                    replacement: "./src".to_string(),
                },
            ],
            extensions: vec![
                "*".to_string(),
                ".js".to_string(),
                ".json".to_string(),
                ".vue".to_string(),
            ],
        }
    }
}

/// One alias entry. A trailing `$` on `find` restricts it to exact matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasConfig {
    pub find: String,
    /// A root-relative path (starting with `.` or `/`) or a bare specifier.
    pub replacement: String,
}

/// Development server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevServerConfig {
    pub port: u16,
    pub host: String,
    /// Push updates to connected clients.
    pub hot: bool,
    /// Quiet period before a burst of file events triggers a rebuild.
    pub debounce_ms: u64,
    /// Inject styles from script instead of extracting stylesheets.
    pub inject_styles: bool,
}

impl Default for DevServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            host: "127.0.0.1".to_string(),
            hot: true,
            debounce_ms: 50,
            inject_styles: true,
        }
    }
}

/// HTML document settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HtmlConfig {
    /// Template path relative to the root. Used only if the file exists.
    pub template: Option<String>,
    /// Output file name.
    pub filename: String,
    /// Document title for the generated page.
    pub title: String,
}

impl Default for HtmlConfig {
    fn default() -> Self {
        Self {
            template: Some("public/index.html".to_string()),
            filename: "index.html".to_string(),
            title: "sluice".to_string(),
        }
    }
}

/// A directory copied verbatim into the output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyConfig {
    /// Source directory relative to the root.
    pub from: String,
    /// Destination relative to the output directory.
    pub to: String,
}

fn default_rules() -> Vec<RuleConfig> {
    let media_limit = Some(DEFAULT_INLINE_LIMIT);
    vec![
        RuleConfig::new(r"\.vue$").with_transform("sfc"),
        RuleConfig::new(r"\.json$").with_transform("json"),
        RuleConfig::new(r"\.css$").with_transform("css"),
        RuleConfig::new(r"\.(jpe?g|png|gif|svg|webp)(\?.*)?$")
            .with_asset(media_limit, "img/[name].[hash:8].[ext]"),
        RuleConfig::new(r"\.(mp4|webm|ogg|mp3|wav|flac|aac)(\?.*)?$")
            .with_asset(media_limit, "media/[name].[hash:8].[ext]"),
        RuleConfig::new(r"\.(woff2?|eot|ttf|otf)(\?.*)?$")
            .with_asset(media_limit, "media/[name].[hash:8].[ext]"),
    ]
}

impl PipelineConfig {
    /// Load configuration for a project root.
    ///
    /// With `explicit`, that file must exist. Otherwise `sluice.config.json`
    /// at the root is used when present, and defaults when not.
    pub fn load(root: &Path, explicit: Option<&Path>) -> Result<Self, Error> {
        let path = match explicit {
            Some(p) if p.is_absolute() => p.to_path_buf(),
            Some(p) => root.join(p),
            None => {
                let candidate = root.join(CONFIG_FILE_NAME);
                if !candidate.is_file() {
                    return Ok(Self::default());
                }
                candidate
            }
        };

        let content = std::fs::read_to_string(&path).map_err(|source| Error::ConfigRead {
            path: path.clone(),
            source,
        })?;
        let config: Self =
            serde_json::from_str(&content).map_err(|source| Error::ConfigParse {
                path: path.clone(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency.
    pub fn validate(&self) -> Result<(), Error> {
        if self.entry.is_empty() {
            return Err(Error::InvalidConfig("at least one entry is required".into()));
        }
        if self.parallelism == Some(0) {
            return Err(Error::InvalidConfig("parallelism must be at least 1".into()));
        }
        for spec in self.rules.iter().flat_map(|r| &r.use_) {
            if spec.transform.is_empty() {
                return Err(Error::InvalidConfig("empty transform identifier".into()));
            }
        }
        let output = Path::new(&self.output.path);
        let climbs_only = sluice_util::fs::normalize(output)
            .components()
            .all(|c| c == Component::ParentDir);
        if output.is_relative() && climbs_only {
            return Err(self.output_overlaps_root());
        }
        Ok(())
    }

    /// Reject an output directory that is the root or one of its ancestors.
    ///
    /// Cleaning such a directory would delete the project sources.
    pub fn validate_output_dir(&self, root: &Path) -> Result<(), Error> {
        let output = self.output_dir(root);
        let overlaps = sluice_util::fs::contains_or_equals(&output, root)
            || dunce::canonicalize(&output)
                .is_ok_and(|output| sluice_util::fs::contains_or_equals(&output, root));
        if overlaps {
            return Err(self.output_overlaps_root());
        }
        Ok(())
    }

    fn output_overlaps_root(&self) -> Error {
        Error::InvalidConfig(format!(
            "output path '{}' must be a directory inside or beside the project root",
            self.output.path
        ))
    }

    /// Absolute output directory for a root.
    #[must_use]
    pub fn output_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.output.path)
    }

    /// Override the output directory.
    #[must_use]
    pub fn with_output_path(mut self, path: impl Into<String>) -> Self {
        self.output.path = path.into();
        self
    }

    /// Override the dev server port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.dev_server.port = port;
        self
    }

    /// Replace all entries with a single one.
    #[must_use]
    pub fn with_entry(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.entry.clear();
        self.entry.insert(name.into(), path.into());
        self
    }

    /// Set the rule list.
    #[must_use]
    pub fn with_rules(mut self, rules: Vec<RuleConfig>) -> Self {
        self.rules = rules;
        self
    }
}
