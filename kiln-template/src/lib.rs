//! Defines the kiln build template format.
//!
//! A template is the declarative description of an image build: which
//! builders produce images, which provisioners customize them, and which
//! post-processor chains transform the results. Templates are parsed from
//! JSON documents with [`Template::parse`] and validated up front; a
//! successfully parsed template is an immutable build plan.
#![warn(missing_docs)]

use anyhow::{Result, bail};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

mod parse;
pub use parse::parse_duration;

/// Arbitrary configuration attached to a builder, provisioner, or
/// post-processor. These fields are not interpreted by the core; they pass
/// through to the component that declared the `type`, in document order.
pub type ConfigMap = serde_json::Map<String, serde_json::Value>;

/// A validated build plan.
///
/// Every builder has a non-empty type and a unique name, and every
/// provisioner and post-processor has a non-empty type. Parsing is
/// all-or-nothing: an invalid document never yields a partial template.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Template {
    /// Builders keyed by their unique name.
    pub builders: HashMap<String, Builder>,

    /// Provisioners in execution order.
    pub provisioners: Vec<Provisioner>,

    /// Alternative post-processor chains. Each inner sequence runs in order
    /// against the artifact produced by a build.
    pub post_processors: Vec<Vec<PostProcessor>>,

    /// User variables keyed by name.
    pub variables: HashMap<String, Variable>,
}

impl Template {
    /// Check that every required variable without a default was supplied.
    ///
    /// This is a plan-time check, not a parse-time one: a template that
    /// declares required variables parses fine and only fails here once the
    /// caller knows which values it can provide.
    pub fn validate_variables(&self, supplied: &[&str]) -> Result<()> {
        let mut missing: Vec<&str> = self
            .variables
            .iter()
            .filter(|(name, variable)| {
                variable.required
                    && variable.default.is_none()
                    && !supplied.contains(&name.as_str())
            })
            .map(|(name, _)| name.as_str())
            .collect();

        if !missing.is_empty() {
            missing.sort_unstable();
            bail!("required variables not supplied: {}", missing.join(", "));
        }
        Ok(())
    }
}

/// A component that produces an image artifact from its configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Builder {
    /// Unique name, defaulting to the type when the document gives none.
    pub name: String,

    /// The component type identifier, e.g. "qemu".
    pub r#type: String,

    /// Remaining configuration, passed through to the component.
    #[serde(flatten)]
    pub config: ConfigMap,
}

/// A component run against a building image to customize it.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Provisioner {
    /// The component type identifier, e.g. "shell".
    pub r#type: String,

    /// How long to wait before running this provisioner.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_before: Option<Duration>,

    /// Which builders this provisioner applies to.
    #[serde(flatten)]
    pub only_except: OnlyExcept,

    /// Per-builder configuration fragments that take precedence over the
    /// base config when running against that builder.
    pub r#override: HashMap<String, ConfigMap>,

    /// Remaining configuration, passed through to the component.
    #[serde(flatten)]
    pub config: ConfigMap,
}

impl Provisioner {
    /// The ordered configuration fragments to prepare this provisioner with
    /// when running against the named builder: the base config first, then
    /// the builder's override fragment if one exists. Later fragments win;
    /// the merge itself is the component's responsibility.
    pub fn config_for(&self, builder: &str) -> Vec<ConfigMap> {
        let mut configs = vec![self.config.clone()];
        if let Some(fragment) = self.r#override.get(builder) {
            configs.push(fragment.clone());
        }
        configs
    }
}

/// Limits which builders a provisioner runs against. Both lists empty means
/// "run against all builders".
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct OnlyExcept {
    /// If non-empty, run only against these builders.
    pub only: Vec<String>,

    /// Never run against these builders.
    pub except: Vec<String>,
}

impl OnlyExcept {
    /// Whether the named builder should be skipped.
    pub fn skip(&self, builder: &str) -> bool {
        if !self.only.is_empty() && !self.only.iter().any(|b| b == builder) {
            return true;
        }
        self.except.iter().any(|b| b == builder)
    }
}

/// A component that transforms an artifact after a build completes.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PostProcessor {
    /// The component type identifier, e.g. "compress".
    pub r#type: String,

    /// Whether the artifact that fed this post-processor is kept after it
    /// runs.
    pub keep_input_artifact: bool,

    /// Remaining configuration, passed through to the component.
    #[serde(flatten)]
    pub config: ConfigMap,
}

/// A user variable declaration.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Variable {
    /// Value used when the variable is not supplied at plan time.
    pub default: Option<serde_json::Value>,

    /// When set and no default exists, a value must be supplied at plan
    /// time.
    pub required: bool,
}
