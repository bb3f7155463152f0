//! Rule matching.
//!
//! Maps a module path to the transform chain and asset policy that apply to
//! it. Rules are evaluated in declaration order; every matching rule
//! contributes its chain, concatenated in that same order.

use crate::config::RuleConfig;
use crate::error::Error;
use regex_lite::Regex;
use serde::Serialize;

/// A compiled rule.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Position in the configured rule list.
    pub index: usize,
    test: Regex,
    exclude: Option<Regex>,
    steps: Vec<TransformStep>,
    asset: Option<AssetPolicy>,
}

impl Rule {
    /// Returns true if `path` matches `test` and not `exclude`.
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        self.test.is_match(path) && !self.exclude.as_ref().is_some_and(|ex| ex.is_match(path))
    }

    /// The rule's own chain.
    #[must_use]
    pub fn steps(&self) -> &[TransformStep] {
        &self.steps
    }

    /// The rule's asset policy, if any.
    #[must_use]
    pub fn asset_policy(&self) -> Option<&AssetPolicy> {
        self.asset.as_ref()
    }
}

/// One step of a transform chain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransformStep {
    pub transform: String,
    pub options: serde_json::Value,
}

/// Ordered sequence of transforms applied to one module.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransformChain {
    steps: Vec<TransformStep>,
}

impl TransformChain {
    #[must_use]
    pub fn new(steps: Vec<TransformStep>) -> Self {
        Self { steps }
    }

    #[must_use]
    pub fn steps(&self) -> &[TransformStep] {
        &self.steps
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Transform identifiers in order, e.g. `sfc -> css`.
    #[must_use]
    pub fn describe(&self) -> String {
        self.steps
            .iter()
            .map(|s| s.transform.as_str())
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    /// Canonical encoding of identifiers and options, used in cache keys.
    #[must_use]
    pub fn identity(&self) -> String {
        // serde_json::Value maps are sorted, so equal chains encode identically
        serde_json::to_string(&self.steps).unwrap_or_default()
    }
}

/// What to do with an asset of a given size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetDisposition {
    /// Embed as a `data:` URI.
    Inline,
    /// Write to its own file and reference by URL.
    Emit,
}

/// Inline-or-reference policy attached to a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetPolicy {
    /// Inline at or below this many bytes.
    pub limit: u64,
    /// Output name template for emitted files.
    pub name: String,
}

impl AssetPolicy {
    /// Policy that always emits, used for assets no rule covers.
    #[must_use]
    pub fn emit_only(name: impl Into<String>) -> Self {
        Self {
            limit: 0,
            name: name.into(),
        }
    }

    #[must_use]
    pub fn disposition(&self, size: u64) -> AssetDisposition {
        if self.limit > 0 && size <= self.limit {
            AssetDisposition::Inline
        } else {
            AssetDisposition::Emit
        }
    }
}

/// Compiled rule list.
#[derive(Debug, Clone, Default)]
pub struct RuleMatcher {
    rules: Vec<Rule>,
}

impl RuleMatcher {
    /// Compile rules. `default_limit` applies to asset rules without a limit.
    pub fn new(configs: &[RuleConfig], default_limit: u64) -> Result<Self, Error> {
        let compile = |index: usize, pattern: &str| {
            Regex::new(pattern).map_err(|e| Error::InvalidPattern {
                index,
                pattern: pattern.to_string(),
                message: e.to_string(),
            })
        };

        let rules = configs
            .iter()
            .enumerate()
            .map(|(index, config)| {
                Ok(Rule {
                    index,
                    test: compile(index, &config.test)?,
                    exclude: config
                        .exclude
                        .as_deref()
                        .map(|ex| compile(index, ex))
                        .transpose()?,
                    steps: config
                        .use_
                        .iter()
                        .map(|spec| TransformStep {
                            transform: spec.transform.clone(),
                            options: spec.options.clone(),
                        })
                        .collect(),
                    asset: config.asset.as_ref().map(|a| AssetPolicy {
                        limit: a.limit.unwrap_or(default_limit),
                        name: a.name.clone(),
                    }),
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(Self { rules })
    }

    /// All rules matching `path`, in declaration order.
    #[must_use]
    pub fn matches(&self, path: &str) -> Vec<&Rule> {
        self.rules.iter().filter(|r| r.matches(path)).collect()
    }

    /// Concatenated chain of every matching rule.
    #[must_use]
    pub fn chain_for(&self, path: &str) -> TransformChain {
        TransformChain::new(
            self.matches(path)
                .into_iter()
                .flat_map(|r| r.steps.iter().cloned())
                .collect(),
        )
    }

    /// Asset policy of the first matching rule that has one.
    #[must_use]
    pub fn asset_policy(&self, path: &str) -> Option<&AssetPolicy> {
        self.rules
            .iter()
            .filter(|r| r.matches(path))
            .find_map(Rule::asset_policy)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
