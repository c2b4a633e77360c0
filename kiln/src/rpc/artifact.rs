use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::error;

use super::{BasicError, Client, Server, Service, ServiceKind};
use crate::capability::Artifact;

/// An artifact living in another process. Accessors and destruction are
/// forwarded so the caller treats it exactly like a local artifact.
pub struct ArtifactClient {
    client: Client,
}

/// Exposes a local [`Artifact`] to a remote peer.
pub struct ArtifactServer {
    artifact: Arc<dyn Artifact>,
}

#[derive(Serialize, Deserialize)]
struct ArtifactDestroyResponse {
    error: Option<BasicError>,
}

impl ArtifactClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn accessor<R: serde::de::DeserializeOwned + Default>(&self, method: &str) -> R {
        match self.client.call(method, &()) {
            Ok(value) => value,
            Err(err) => {
                error!(%err, method, "failed to read remote artifact");
                R::default()
            }
        }
    }
}

impl Artifact for ArtifactClient {
    fn builder_id(&self) -> String {
        self.accessor("Artifact.BuilderId")
    }

    fn id(&self) -> String {
        self.accessor("Artifact.Id")
    }

    fn files(&self) -> Vec<String> {
        self.accessor("Artifact.Files")
    }

    fn destroy(&self) -> Result<()> {
        let response: ArtifactDestroyResponse = self.client.call("Artifact.Destroy", &())?;
        match response.error {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }
}

impl Service for ArtifactServer {
    fn call(&mut self, method: &str, _params: Value) -> Result<Value> {
        match method {
            "BuilderId" => Ok(serde_json::to_value(self.artifact.builder_id())?),
            "Id" => Ok(serde_json::to_value(self.artifact.id())?),
            "Files" => Ok(serde_json::to_value(self.artifact.files())?),
            "Destroy" => {
                let error = self.artifact.destroy().err().map(BasicError::from);
                Ok(serde_json::to_value(ArtifactDestroyResponse { error })?)
            }
            _ => bail!("unknown method 'Artifact.{method}'"),
        }
    }
}

impl Server {
    /// Expose an artifact to the peer of this server's connection.
    pub fn register_artifact(&mut self, artifact: Arc<dyn Artifact>) {
        self.register(ServiceKind::Artifact, Box::new(ArtifactServer { artifact }));
    }
}
