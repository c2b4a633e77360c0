use anyhow::{Result, anyhow, bail};
use kiln_template::ConfigMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use super::{
    ArtifactClient, BasicError, Client, Server, Service, ServiceKind, UiClient,
    serve_single_connection,
};
use crate::capability::{Artifact, PostProcessor, Ui};

/// A post-processor that is actually executed over an RPC connection.
pub struct PostProcessorClient {
    client: Client,
}

/// Wraps a local [`PostProcessor`] and makes it callable by a remote peer.
pub struct PostProcessorServer {
    post_processor: Box<dyn PostProcessor>,
}

#[derive(Serialize, Deserialize)]
struct ConfigureRequest {
    config: ConfigMap,
}

#[derive(Serialize, Deserialize)]
struct ConfigureResponse {
    error: Option<BasicError>,
}

#[derive(Serialize, Deserialize)]
struct PostProcessRequest {
    ui_address: String,
    artifact_address: String,
}

#[derive(Serialize, Deserialize)]
struct PostProcessResponse {
    artifact_address: Option<String>,
    keep_input_artifact: bool,
    error: Option<BasicError>,
}

impl PostProcessorClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl PostProcessor for PostProcessorClient {
    fn configure(&mut self, config: ConfigMap) -> Result<()> {
        let response: ConfigureResponse = self
            .client
            .call("PostProcessor.Configure", &ConfigureRequest { config })?;
        match response.error {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }

    fn post_process(
        &mut self,
        ui: Arc<dyn Ui>,
        artifact: Arc<dyn Artifact>,
    ) -> Result<(Option<Arc<dyn Artifact>>, bool)> {
        // The input artifact flows toward the peer the same way callbacks
        // do: over its own brokered single-use channel
        let mut ui_server = Server::new();
        ui_server.register_ui(ui);
        let mut artifact_server = Server::new();
        artifact_server.register_artifact(artifact);

        let request = PostProcessRequest {
            ui_address: serve_single_connection(ui_server)?.to_string(),
            artifact_address: serve_single_connection(artifact_server)?.to_string(),
        };

        let response: PostProcessResponse =
            self.client.call("PostProcessor.PostProcess", &request)?;
        if let Some(error) = response.error {
            return Err(error.into());
        }

        let artifact: Option<Arc<dyn Artifact>> = match response.artifact_address {
            Some(address) => {
                let client = Client::dial(&address)
                    .map_err(|err| anyhow!("failed to reach remote artifact: {err}"))?;
                Some(Arc::new(ArtifactClient::new(client)))
            }
            None => None,
        };
        Ok((artifact, response.keep_input_artifact))
    }
}

impl Service for PostProcessorServer {
    fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        match method {
            "Configure" => {
                let request: ConfigureRequest = serde_json::from_value(params)?;
                let error = self
                    .post_processor
                    .configure(request.config)
                    .err()
                    .map(BasicError::from);
                Ok(serde_json::to_value(ConfigureResponse { error })?)
            }
            "PostProcess" => {
                let request: PostProcessRequest = serde_json::from_value(params)?;
                let ui: Arc<dyn Ui> = Arc::new(UiClient::new(Client::dial(&request.ui_address)?));
                let input: Arc<dyn Artifact> = Arc::new(ArtifactClient::new(Client::dial(
                    &request.artifact_address,
                )?));

                let response = match self.post_processor.post_process(ui, input) {
                    Ok((Some(artifact), keep_input_artifact)) => {
                        let mut server = Server::new();
                        server.register_artifact(artifact);
                        PostProcessResponse {
                            artifact_address: Some(serve_single_connection(server)?.to_string()),
                            keep_input_artifact,
                            error: None,
                        }
                    }
                    Ok((None, keep_input_artifact)) => PostProcessResponse {
                        artifact_address: None,
                        keep_input_artifact,
                        error: None,
                    },
                    Err(error) => PostProcessResponse {
                        artifact_address: None,
                        keep_input_artifact: false,
                        error: Some(error.into()),
                    },
                };
                Ok(serde_json::to_value(response)?)
            }
            _ => bail!("unknown method 'PostProcessor.{method}'"),
        }
    }
}

impl Server {
    /// Expose a post-processor to the peer of this server's connection.
    pub fn register_post_processor(&mut self, post_processor: Box<dyn PostProcessor>) {
        self.register(
            ServiceKind::PostProcessor,
            Box::new(PostProcessorServer { post_processor }),
        );
    }
}
