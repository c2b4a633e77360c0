//! Makes capabilities callable across a process boundary.
//!
//! Every proxied call travels as a newline-delimited JSON envelope over a
//! TCP connection that belongs to exactly one proxy. The envelope's `error`
//! field carries dispatch failures (unknown service, malformed params);
//! a capability's own failures ride inside the reply payloads as
//! [`BasicError`] values, so transport success and operation success stay
//! orthogonal.

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Mutex;
use std::thread;
use tracing::{debug, error, trace};

mod artifact;
mod builder;
mod error;
mod hook;
mod post_processor;
mod provisioner;
mod ui;

pub use artifact::{ArtifactClient, ArtifactServer};
pub use builder::{BuilderClient, BuilderServer};
pub use error::BasicError;
pub use hook::{HookClient, HookServer};
pub use post_processor::{PostProcessorClient, PostProcessorServer};
pub use provisioner::{ProvisionerClient, ProvisionerServer};
pub use ui::{UiClient, UiServer};

/// Port range a plugin process binds in when exposing its capabilities.
pub const PLUGIN_PORT_MIN: u16 = 10000;
pub const PLUGIN_PORT_MAX: u16 = 25000;

/// The fixed set of capabilities that can be served over a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
pub enum ServiceKind {
    Builder,
    Provisioner,
    PostProcessor,
    Hook,
    Ui,
    Artifact,
}

#[derive(Serialize, Deserialize)]
struct Request {
    id: u64,
    method: String,
    params: Value,
}

#[derive(Serialize, Deserialize)]
struct Response {
    id: u64,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

/// One half of an RPC connection. Each capability proxy owns its client
/// exclusively; calls are issued one at a time, so the peer observes them
/// in exactly the order they were made.
pub struct Client {
    conn: Mutex<Connection>,
}

struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    next_id: u64,
}

impl Client {
    /// Connect to a capability server at the given address.
    pub fn dial(addr: impl ToSocketAddrs) -> Result<Client> {
        let stream = TcpStream::connect(addr).context("failed to dial peer")?;
        Client::new(stream)
    }

    fn new(stream: TcpStream) -> Result<Client> {
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Client {
            conn: Mutex::new(Connection {
                reader,
                writer: stream,
                next_id: 0,
            }),
        })
    }

    /// Issue a synchronous call and block until the reply arrives.
    ///
    /// An `Err` from this method is a transport or dispatch failure; the
    /// remote operation's own outcome is part of the reply payload.
    pub fn call<P: Serialize, R: DeserializeOwned>(&self, method: &str, params: &P) -> Result<R> {
        let mut conn = self.conn.lock().unwrap();

        conn.next_id += 1;
        let id = conn.next_id;
        let mut line = serde_json::to_string(&Request {
            id,
            method: method.to_string(),
            params: serde_json::to_value(params)?,
        })?;
        line.push('\n');

        trace!(method, id, "rpc call");
        conn.writer.write_all(line.as_bytes())?;
        conn.writer.flush()?;

        let mut reply = String::new();
        if conn.reader.read_line(&mut reply)? == 0 {
            bail!("connection closed by peer during '{method}'");
        }

        let response: Response =
            serde_json::from_str(&reply).context("malformed reply from peer")?;
        if response.id != id {
            bail!("reply out of order: expected id {id}, got {}", response.id);
        }
        if let Some(message) = response.error {
            bail!("remote call '{method}' failed: {message}");
        }
        Ok(serde_json::from_value(response.result)?)
    }
}

/// A server-side adapter exposing one capability's operations as RPC
/// methods.
pub trait Service: Send {
    /// Handle one method call. An `Err` here is a dispatch failure and
    /// becomes the reply envelope's error field.
    fn call(&mut self, method: &str, params: Value) -> Result<Value>;
}

/// Serves one or more registered capabilities on a single connection.
#[derive(Default)]
pub struct Server {
    services: HashMap<ServiceKind, Box<dyn Service>>,
}

impl Server {
    pub fn new() -> Server {
        Server::default()
    }

    /// Register a capability service. Registering the same kind twice
    /// replaces the earlier service.
    pub fn register(&mut self, kind: ServiceKind, service: Box<dyn Service>) {
        self.services.insert(kind, service);
    }

    /// Serve requests on the connection, in arrival order, until the peer
    /// disconnects.
    pub fn serve(mut self, stream: TcpStream) {
        let mut reader = match stream.try_clone() {
            Ok(clone) => BufReader::new(clone),
            Err(err) => {
                error!(%err, "failed to split connection");
                return;
            }
        };
        let mut writer = stream;

        loop {
            let mut line = String::new();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    debug!(%err, "connection lost");
                    break;
                }
            }
            if line.trim().is_empty() {
                continue;
            }

            let (id, outcome) = match serde_json::from_str::<Request>(&line) {
                Ok(request) => {
                    let id = request.id;
                    (id, self.dispatch(request))
                }
                Err(err) => (0, Err(anyhow!("malformed request: {err}"))),
            };

            let response = match outcome {
                Ok(result) => Response {
                    id,
                    result,
                    error: None,
                },
                Err(err) => Response {
                    id,
                    result: Value::Null,
                    error: Some(format!("{err:#}")),
                },
            };

            let mut line = match serde_json::to_string(&response) {
                Ok(line) => line,
                Err(err) => {
                    error!(%err, "failed to encode reply");
                    break;
                }
            };
            line.push('\n');
            if writer
                .write_all(line.as_bytes())
                .and_then(|_| writer.flush())
                .is_err()
            {
                break;
            }
        }
        trace!("peer disconnected");
    }

    fn dispatch(&mut self, request: Request) -> Result<Value> {
        let (service, method) = request
            .method
            .split_once('.')
            .ok_or_else(|| anyhow!("invalid method '{}'", request.method))?;
        let kind: ServiceKind = service
            .parse()
            .map_err(|_| anyhow!("unknown service '{service}'"))?;

        trace!(method = %request.method, "dispatch");
        self.services
            .get_mut(&kind)
            .ok_or_else(|| anyhow!("service '{kind}' is not registered"))?
            .call(method, request.params)
    }
}

/// Open a transient listening endpoint for the given server and return its
/// dialable address immediately.
///
/// Exactly one inbound connection is accepted; the listener closes as soon
/// as it arrives, so a later dial to the same address is refused. The
/// connection is then served until the peer hangs up, at which point all
/// resources are released. Any number of these can be in flight at once,
/// one per brokered call.
pub fn serve_single_connection(server: Server) -> Result<SocketAddr> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    serve_listener(server, listener)
}

/// Entry point for a plugin process: expose the given capabilities on a
/// port in the well-known plugin range and serve a single connection from
/// the host. The returned address is what the process advertises to its
/// launcher.
pub fn serve_plugin(server: Server) -> Result<SocketAddr> {
    let listener = crate::bind_open_port(PLUGIN_PORT_MIN, PLUGIN_PORT_MAX);
    serve_listener(server, listener)
}

fn serve_listener(server: Server, listener: TcpListener) -> Result<SocketAddr> {
    let address = listener.local_addr()?;

    thread::spawn(move || match listener.accept() {
        Ok((stream, peer)) => {
            // Close the listener before serving so no second connection can
            // be accepted on this address
            drop(listener);
            trace!(%peer, "accepted connection");
            server.serve(stream);
        }
        Err(err) => error!(%err, "failed to accept connection"),
    });

    Ok(address)
}
