use anyhow::{Result, bail};
use kiln_template::ConfigMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use super::{BasicError, Client, Server, Service, ServiceKind, UiClient, serve_single_connection};
use crate::capability::{Provisioner, Ui};

/// A provisioner that is actually executed over an RPC connection.
pub struct ProvisionerClient {
    client: Client,
}

/// Wraps a local [`Provisioner`] and makes it callable by a remote peer.
pub struct ProvisionerServer {
    provisioner: Box<dyn Provisioner>,
}

#[derive(Serialize, Deserialize)]
struct ProvisionerPrepareRequest {
    configs: Vec<ConfigMap>,
}

#[derive(Serialize, Deserialize)]
struct ProvisionerPrepareResponse {
    error: Option<BasicError>,
}

#[derive(Serialize, Deserialize)]
struct ProvisionRequest {
    ui_address: String,
}

#[derive(Serialize, Deserialize)]
struct ProvisionResponse {
    error: Option<BasicError>,
}

impl ProvisionerClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl Provisioner for ProvisionerClient {
    fn prepare(&mut self, configs: Vec<ConfigMap>) -> Result<()> {
        let response: ProvisionerPrepareResponse = self
            .client
            .call("Provisioner.Prepare", &ProvisionerPrepareRequest { configs })?;
        match response.error {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }

    fn provision(&mut self, ui: Arc<dyn Ui>) -> Result<()> {
        let mut ui_server = Server::new();
        ui_server.register_ui(ui);
        let request = ProvisionRequest {
            ui_address: serve_single_connection(ui_server)?.to_string(),
        };

        let response: ProvisionResponse = self.client.call("Provisioner.Provision", &request)?;
        match response.error {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }

    fn cancel(&mut self) {
        if let Err(err) = self.client.call::<_, ()>("Provisioner.Cancel", &()) {
            warn!(%err, "failed to cancel remote provisioner");
        }
    }
}

impl Service for ProvisionerServer {
    fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        match method {
            "Prepare" => {
                let request: ProvisionerPrepareRequest = serde_json::from_value(params)?;
                let error = self
                    .provisioner
                    .prepare(request.configs)
                    .err()
                    .map(BasicError::from);
                Ok(serde_json::to_value(ProvisionerPrepareResponse { error })?)
            }
            "Provision" => {
                let request: ProvisionRequest = serde_json::from_value(params)?;
                let ui: Arc<dyn Ui> = Arc::new(UiClient::new(Client::dial(&request.ui_address)?));

                let error = self.provisioner.provision(ui).err().map(BasicError::from);
                Ok(serde_json::to_value(ProvisionResponse { error })?)
            }
            "Cancel" => {
                self.provisioner.cancel();
                Ok(Value::Null)
            }
            _ => bail!("unknown method 'Provisioner.{method}'"),
        }
    }
}

impl Server {
    /// Expose a provisioner to the peer of this server's connection.
    pub fn register_provisioner(&mut self, provisioner: Box<dyn Provisioner>) {
        self.register(
            ServiceKind::Provisioner,
            Box::new(ProvisionerServer { provisioner }),
        );
    }
}
