//! The contracts a build is assembled from.
//!
//! Each capability is a trait so an implementation can live in the host
//! process or behind a plugin connection without the caller knowing the
//! difference; the `rpc` module provides exactly one proxy type per trait
//! for the remote case.

use anyhow::Result;
use kiln_template::ConfigMap;
use serde_json::Value;
use std::sync::Arc;

#[cfg(test)]
pub mod testing;

/// Hook fired by a builder once the machine is booted and reachable, so
/// provisioners can run against it.
pub const HOOK_PROVISION: &str = "provision";

/// The output of a build or post-processor step.
///
/// Artifacts are shared by reference; one returned from a remote call is
/// owned by the caller once received.
pub trait Artifact: Send + Sync {
    /// The id of the builder that produced this artifact.
    fn builder_id(&self) -> String;

    /// An identifier unique among artifacts of the same builder, e.g. an
    /// image id.
    fn id(&self) -> String;

    /// The files that make up the artifact.
    fn files(&self) -> Vec<String>;

    /// Delete the artifact and everything it owns.
    fn destroy(&self) -> Result<()>;
}

/// A component that produces an [`Artifact`] from its configuration, e.g.
/// by booting and imaging a virtual machine.
pub trait Builder: Send {
    /// Validate and absorb the merged configuration for this builder. A
    /// build whose configuration is rejected here never runs.
    fn prepare(&mut self, config: ConfigMap) -> Result<()>;

    /// Run the build. The ui receives progress output and the hook is fired
    /// at lifecycle points such as [`HOOK_PROVISION`]. A builder may
    /// legitimately produce no artifact.
    fn run(&mut self, ui: Arc<dyn Ui>, hook: Arc<dyn Hook>) -> Result<Option<Arc<dyn Artifact>>>;

    /// Ask the builder to abandon an in-flight run.
    fn cancel(&mut self);
}

/// A component run against a building machine to customize it, e.g. by
/// installing software.
pub trait Provisioner: Send {
    /// Absorb the configuration fragments for this provisioner, in
    /// precedence order: the base config first, then any per-builder
    /// override fragment.
    fn prepare(&mut self, configs: Vec<ConfigMap>) -> Result<()>;

    /// Run the provisioning step.
    fn provision(&mut self, ui: Arc<dyn Ui>) -> Result<()>;

    /// Ask the provisioner to abandon an in-flight step.
    fn cancel(&mut self);
}

/// A component that transforms an [`Artifact`] after a build completes,
/// e.g. compressing or uploading it.
pub trait PostProcessor: Send {
    /// Validate and absorb this post-processor's configuration.
    fn configure(&mut self, config: ConfigMap) -> Result<()>;

    /// Transform the artifact. Returns the new artifact (if any) and
    /// whether the input artifact should be kept afterwards.
    fn post_process(
        &mut self,
        ui: Arc<dyn Ui>,
        artifact: Arc<dyn Artifact>,
    ) -> Result<(Option<Arc<dyn Artifact>>, bool)>;
}

/// A named-event callback a builder invokes during its run.
pub trait Hook: Send + Sync {
    /// Dispatch the named event with its payload.
    fn run(&self, name: &str, data: Value) -> Result<()>;
}

/// User-facing output and prompting during a run.
pub trait Ui: Send + Sync {
    /// Emit an informational message.
    fn say(&self, message: &str);

    /// Emit an error message.
    fn error(&self, message: &str);

    /// Prompt the user and block for an answer.
    fn ask(&self, query: &str) -> Result<String>;
}

/// Resolves component type identifiers from a template to ready-to-use
/// implementations, local or already dialed to a running plugin process.
/// Supplied by the embedding application.
pub trait PluginResolver: Send + Sync {
    /// Resolve a builder type, e.g. "qemu".
    fn builder(&self, kind: &str) -> Result<Box<dyn Builder>>;

    /// Resolve a provisioner type, e.g. "shell".
    fn provisioner(&self, kind: &str) -> Result<Box<dyn Provisioner>>;

    /// Resolve a post-processor type, e.g. "compress".
    fn post_processor(&self, kind: &str) -> Result<Box<dyn PostProcessor>>;
}
