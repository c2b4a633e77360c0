//! In-memory capability fakes for exercising the RPC bridge.

use super::*;
use anyhow::bail;
use serde_json::json;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Records everything said to it; answers every prompt with a fixed value.
#[derive(Default)]
pub struct RecordingUi {
    pub messages: Mutex<Vec<String>>,
    pub errors: Mutex<Vec<String>>,
    pub asks: Mutex<Vec<String>>,
    pub answer: String,
    pub ask_error: bool,
}

impl RecordingUi {
    pub fn answering(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
            ..Default::default()
        }
    }
}

impl Ui for RecordingUi {
    fn say(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }

    fn error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }

    fn ask(&self, query: &str) -> Result<String> {
        self.asks.lock().unwrap().push(query.to_string());
        if self.ask_error {
            bail!("no input available");
        }
        Ok(self.answer.clone())
    }
}

/// Records every event dispatched through it.
#[derive(Default)]
pub struct RecordingHook {
    pub calls: Mutex<Vec<(String, Value)>>,
    pub error: Option<String>,
}

impl Hook for RecordingHook {
    fn run(&self, name: &str, data: Value) -> Result<()> {
        self.calls.lock().unwrap().push((name.to_string(), data));
        match &self.error {
            Some(message) => bail!("{message}"),
            None => Ok(()),
        }
    }
}

/// A fixed artifact whose destruction can be observed or forced to fail.
#[derive(Default)]
pub struct StaticArtifact {
    pub destroyed: AtomicBool,
    pub destroy_error: bool,
}

impl Artifact for StaticArtifact {
    fn builder_id(&self) -> String {
        "scripted".to_string()
    }

    fn id(&self) -> String {
        "image-1".to_string()
    }

    fn files(&self) -> Vec<String> {
        vec!["image.gb".to_string()]
    }

    fn destroy(&self) -> Result<()> {
        if self.destroy_error {
            bail!("artifact is in use");
        }
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// State a [`ScriptedBuilder`] leaves behind, shared with the test that
/// spawned it.
#[derive(Default)]
pub struct BuilderState {
    pub prepared: Mutex<Vec<ConfigMap>>,
    pub cancelled: AtomicBool,
}

/// A builder whose behavior is chosen up front: it records its prepare
/// config, talks to the ui and hook it was given, and either produces a
/// [`StaticArtifact`], produces nothing, or fails.
#[derive(Default)]
pub struct ScriptedBuilder {
    pub state: Arc<BuilderState>,
    pub prepare_error: Option<String>,
    pub run_error: Option<String>,
    pub produce_artifact: bool,
}

impl Builder for ScriptedBuilder {
    fn prepare(&mut self, config: ConfigMap) -> Result<()> {
        self.state.prepared.lock().unwrap().push(config);
        match &self.prepare_error {
            Some(message) => bail!("{message}"),
            None => Ok(()),
        }
    }

    fn run(&mut self, ui: Arc<dyn Ui>, hook: Arc<dyn Hook>) -> Result<Option<Arc<dyn Artifact>>> {
        ui.say("starting build");
        hook.run(HOOK_PROVISION, json!({"builder": "scripted"}))?;

        if let Some(message) = &self.run_error {
            bail!("{message}");
        }
        if self.produce_artifact {
            Ok(Some(Arc::new(StaticArtifact::default())))
        } else {
            Ok(None)
        }
    }

    fn cancel(&mut self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
    }
}
