use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use super::{BasicError, Client, Server, Service, ServiceKind};
use crate::capability::Hook;

/// A hook living in another process, reached over an RPC connection.
pub struct HookClient {
    client: Client,
}

/// Exposes a local [`Hook`] to a remote peer.
pub struct HookServer {
    hook: Arc<dyn Hook>,
}

#[derive(Serialize, Deserialize)]
struct HookRunRequest {
    name: String,
    data: Value,
}

#[derive(Serialize, Deserialize)]
struct HookRunResponse {
    error: Option<BasicError>,
}

impl HookClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl Hook for HookClient {
    fn run(&self, name: &str, data: Value) -> Result<()> {
        let request = HookRunRequest {
            name: name.to_string(),
            data,
        };
        let response: HookRunResponse = self.client.call("Hook.Run", &request)?;
        match response.error {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }
}

impl Service for HookServer {
    fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        match method {
            "Run" => {
                let request: HookRunRequest = serde_json::from_value(params)?;
                let error = self
                    .hook
                    .run(&request.name, request.data)
                    .err()
                    .map(BasicError::from);
                Ok(serde_json::to_value(HookRunResponse { error })?)
            }
            _ => bail!("unknown method 'Hook.{method}'"),
        }
    }
}

impl Server {
    /// Expose a hook to the peer of this server's connection.
    pub fn register_hook(&mut self, hook: Arc<dyn Hook>) {
        self.register(ServiceKind::Hook, Box::new(HookServer { hook }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::HOOK_PROVISION;
    use crate::capability::testing::RecordingHook;
    use crate::rpc::serve_single_connection;
    use serde_json::json;
    use test_log::test;

    fn remote_hook(hook: Arc<RecordingHook>) -> HookClient {
        let mut server = Server::new();
        server.register_hook(hook);
        let address = serve_single_connection(server).unwrap();
        HookClient::new(Client::dial(address).unwrap())
    }

    #[test]
    fn test_run_roundtrip() {
        let hook = Arc::new(RecordingHook::default());
        let remote = remote_hook(hook.clone());

        remote
            .run(HOOK_PROVISION, json!({"builder": "qemu"}))
            .unwrap();
        remote.run("teardown", Value::Null).unwrap();

        let calls = hook.calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![
                (HOOK_PROVISION.to_string(), json!({"builder": "qemu"})),
                ("teardown".to_string(), Value::Null),
            ]
        );
    }

    #[test]
    fn test_run_error_propagates() {
        let hook = Arc::new(RecordingHook {
            error: Some("provision failed".to_string()),
            ..Default::default()
        });
        let remote = remote_hook(hook);

        let err = remote.run(HOOK_PROVISION, Value::Null).unwrap_err();
        assert_eq!(err.to_string(), "provision failed");
    }
}
