use anyhow::{Result, anyhow, bail};
use kiln_template::ConfigMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{
    ArtifactClient, BasicError, Client, HookClient, Server, Service, ServiceKind, UiClient,
    serve_single_connection,
};
use crate::capability::{Artifact, Builder, Hook, Ui};

/// A builder that is actually executed over an RPC connection.
pub struct BuilderClient {
    client: Client,
}

/// Wraps a local [`Builder`] and makes it callable by a remote peer.
pub struct BuilderServer {
    builder: Box<dyn Builder>,
}

#[derive(Serialize, Deserialize)]
struct BuilderPrepareRequest {
    config: ConfigMap,
}

#[derive(Serialize, Deserialize)]
struct BuilderPrepareResponse {
    error: Option<BasicError>,
}

#[derive(Serialize, Deserialize)]
struct BuilderRunRequest {
    ui_address: String,
    hook_address: String,
}

#[derive(Serialize, Deserialize)]
struct BuilderRunResponse {
    artifact_address: Option<String>,
    error: Option<BasicError>,
}

impl BuilderClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl Builder for BuilderClient {
    fn prepare(&mut self, config: ConfigMap) -> Result<()> {
        let response: BuilderPrepareResponse = self
            .client
            .call("Builder.Prepare", &BuilderPrepareRequest { config })?;
        match response.error {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }

    fn run(&mut self, ui: Arc<dyn Ui>, hook: Arc<dyn Hook>) -> Result<Option<Arc<dyn Artifact>>> {
        // Stand up single-use callback channels for the ui and hook. Each
        // proxy owns its connection outright, so the two get separate
        // brokered endpoints.
        let mut ui_server = Server::new();
        ui_server.register_ui(ui);
        let mut hook_server = Server::new();
        hook_server.register_hook(hook);

        let request = BuilderRunRequest {
            ui_address: serve_single_connection(ui_server)?.to_string(),
            hook_address: serve_single_connection(hook_server)?.to_string(),
        };
        debug!(
            ui = %request.ui_address,
            hook = %request.hook_address,
            "brokered callback channels for run",
        );

        // Failing to reach the plugin at all is fatal for this invocation
        let response: BuilderRunResponse = self.client.call("Builder.Run", &request)?;
        if let Some(error) = response.error {
            return Err(error.into());
        }

        match response.artifact_address {
            Some(address) => {
                let client = Client::dial(&address)
                    .map_err(|err| anyhow!("failed to reach remote artifact: {err}"))?;
                Ok(Some(Arc::new(ArtifactClient::new(client))))
            }
            None => Ok(None),
        }
    }

    fn cancel(&mut self) {
        if let Err(err) = self.client.call::<_, ()>("Builder.Cancel", &()) {
            warn!(%err, "failed to cancel remote builder");
        }
    }
}

impl Service for BuilderServer {
    fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        match method {
            "Prepare" => {
                let request: BuilderPrepareRequest = serde_json::from_value(params)?;
                let error = self
                    .builder
                    .prepare(request.config)
                    .err()
                    .map(BasicError::from);
                Ok(serde_json::to_value(BuilderPrepareResponse { error })?)
            }
            "Run" => {
                let request: BuilderRunRequest = serde_json::from_value(params)?;

                // Dial back into the caller for its ui and hook
                let ui: Arc<dyn Ui> = Arc::new(UiClient::new(Client::dial(&request.ui_address)?));
                let hook: Arc<dyn Hook> =
                    Arc::new(HookClient::new(Client::dial(&request.hook_address)?));

                let response = match self.builder.run(ui, hook) {
                    Ok(Some(artifact)) => {
                        // Broker the artifact back out so the caller can
                        // reach it like a local one
                        let mut server = Server::new();
                        server.register_artifact(artifact);
                        BuilderRunResponse {
                            artifact_address: Some(serve_single_connection(server)?.to_string()),
                            error: None,
                        }
                    }
                    Ok(None) => BuilderRunResponse {
                        artifact_address: None,
                        error: None,
                    },
                    Err(error) => BuilderRunResponse {
                        artifact_address: None,
                        error: Some(error.into()),
                    },
                };
                Ok(serde_json::to_value(response)?)
            }
            "Cancel" => {
                self.builder.cancel();
                Ok(Value::Null)
            }
            _ => bail!("unknown method 'Builder.{method}'"),
        }
    }
}

impl Server {
    /// Expose a builder to the peer of this server's connection.
    pub fn register_builder(&mut self, builder: Box<dyn Builder>) {
        self.register(ServiceKind::Builder, Box::new(BuilderServer { builder }));
    }
}
