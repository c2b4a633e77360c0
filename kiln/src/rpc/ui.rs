use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::error;

use super::{BasicError, Client, Server, Service, ServiceKind};
use crate::capability::Ui;

/// A ui living in another process, reached over an RPC connection. This is
/// what a remote builder writes to when it calls back into the host.
pub struct UiClient {
    client: Client,
}

/// Exposes a local [`Ui`] to a remote peer.
pub struct UiServer {
    ui: Arc<dyn Ui>,
}

#[derive(Serialize, Deserialize)]
struct UiMessage {
    message: String,
}

#[derive(Serialize, Deserialize)]
struct UiAskRequest {
    query: String,
}

#[derive(Serialize, Deserialize)]
struct UiAskResponse {
    answer: String,
    error: Option<BasicError>,
}

impl UiClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl Ui for UiClient {
    fn say(&self, message: &str) {
        // Output is fire-and-forget: a lost message must not kill the build
        let request = UiMessage {
            message: message.to_string(),
        };
        if let Err(err) = self.client.call::<_, ()>("Ui.Say", &request) {
            error!(%err, "failed to deliver ui message");
        }
    }

    fn error(&self, message: &str) {
        let request = UiMessage {
            message: message.to_string(),
        };
        if let Err(err) = self.client.call::<_, ()>("Ui.Error", &request) {
            error!(%err, "failed to deliver ui message");
        }
    }

    fn ask(&self, query: &str) -> Result<String> {
        let request = UiAskRequest {
            query: query.to_string(),
        };
        let response: UiAskResponse = self.client.call("Ui.Ask", &request)?;
        match response.error {
            Some(error) => Err(error.into()),
            None => Ok(response.answer),
        }
    }
}

impl Service for UiServer {
    fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        match method {
            "Say" => {
                let request: UiMessage = serde_json::from_value(params)?;
                self.ui.say(&request.message);
                Ok(Value::Null)
            }
            "Error" => {
                let request: UiMessage = serde_json::from_value(params)?;
                self.ui.error(&request.message);
                Ok(Value::Null)
            }
            "Ask" => {
                let request: UiAskRequest = serde_json::from_value(params)?;
                let response = match self.ui.ask(&request.query) {
                    Ok(answer) => UiAskResponse {
                        answer,
                        error: None,
                    },
                    Err(err) => UiAskResponse {
                        answer: String::new(),
                        error: Some(err.into()),
                    },
                };
                Ok(serde_json::to_value(response)?)
            }
            _ => bail!("unknown method 'Ui.{method}'"),
        }
    }
}

impl Server {
    /// Expose a ui to the peer of this server's connection.
    pub fn register_ui(&mut self, ui: Arc<dyn Ui>) {
        self.register(ServiceKind::Ui, Box::new(UiServer { ui }));
    }
}
