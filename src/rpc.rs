//! QUIC RPC: the pooled client and the server loop.
//!
//! Requests travel as length-prefixed bincode frames over one
//! bidirectional stream each. [`RpcClient`] implements
//! [`NodeRpc`](crate::protocols::NodeRpc) on top of a bounded LRU pool of
//! connections owned by a background actor; the server side accepts
//! streams and dispatches decoded requests to the controller through
//! [`ServerHandler`].
//!
//! Failure classification matters here: anything that looks like the peer
//! being unreachable (dial errors, lost connections, stream resets) becomes
//! [`Error::Unavailable`] so callers can taint the peer and reroute, while
//! taxonomy errors returned by the remote handler decode back into their
//! original variants.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use quinn::{Connection, Endpoint};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::descriptor::Descriptor;
use crate::error::{Error, Result};
use crate::messages::{self, Request, Response};
use crate::protocols::{AppRequest, NodeRpc};
use crate::state::{Hello, State};
use crate::transport::SERVER_NAME;

/// Maximum pooled connections. The least-recently-used connection is
/// closed and evicted when a new peer would exceed this.
const MAX_POOLED_CONNECTIONS: usize = 250;

/// Timeout covering one full request/response exchange on a stream.
const RPC_STREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Server-side timeout for reading a request off an accepted stream.
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Server-side budget for processing one request. Join propagation walks
/// the routing chain before answering, so this stays generous.
const REQUEST_PROCESS_TIMEOUT: Duration = Duration::from_secs(60);

/// Hard cap on a single frame in either direction.
const MAX_FRAME_SIZE: usize = messages::MAX_DESERIALIZE_SIZE as usize;

/// Command channel capacity for the pool actor.
const POOL_COMMAND_CHANNEL_SIZE: usize = 64;

enum PoolCommand {
    Get {
        addr: String,
        reply: oneshot::Sender<Result<Connection>>,
    },
    Remove {
        addr: String,
    },
}

struct PoolActor {
    endpoint: Endpoint,
    conns: LruCache<String, Connection>,
}

impl PoolActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<PoolCommand>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                PoolCommand::Get { addr, reply } => {
                    let result = self.get_or_connect(&addr).await;
                    let _ = reply.send(result);
                }
                PoolCommand::Remove { addr } => {
                    if let Some(conn) = self.conns.pop(&addr) {
                        conn.close(0u32.into(), b"evicted");
                        debug!(%addr, "closed pooled connection");
                    }
                }
            }
        }
    }

    async fn get_or_connect(&mut self, addr: &str) -> Result<Connection> {
        if let Some(conn) = self.conns.get(addr) {
            if conn.close_reason().is_none() {
                return Ok(conn.clone());
            }
            self.conns.pop(addr);
        }

        let socket_addr = addr
            .parse()
            .map_err(|e| Error::InvalidArgument(format!("invalid peer address {addr}: {e}")))?;
        let conn = self
            .endpoint
            .connect(socket_addr, SERVER_NAME)
            .map_err(|e| Error::Unavailable(format!("failed to dial {addr}: {e}")))?
            .await
            .map_err(|e| Error::Unavailable(format!("failed to connect to {addr}: {e}")))?;

        if let Some((_, evicted)) = self.conns.push(addr.to_string(), conn.clone()) {
            // push yields the LRU entry when the cache is over capacity.
            if evicted.stable_id() != conn.stable_id() {
                evicted.close(0u32.into(), b"pool full");
            }
        }
        Ok(conn)
    }
}

/// Pooled QUIC client for the overlay protocol. Cheap to clone.
#[derive(Clone)]
pub struct RpcClient {
    cmd_tx: mpsc::Sender<PoolCommand>,
}

impl RpcClient {
    /// Creates a client dialing out of `endpoint`.
    pub fn new(endpoint: Endpoint) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(POOL_COMMAND_CHANNEL_SIZE);
        let actor = PoolActor {
            endpoint,
            conns: LruCache::new(
                NonZeroUsize::new(MAX_POOLED_CONNECTIONS).expect("pool capacity is non-zero"),
            ),
        };
        tokio::spawn(actor.run(cmd_rx));
        RpcClient { cmd_tx }
    }

    async fn connection(&self, addr: &str) -> Result<Connection> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(PoolCommand::Get {
                addr: addr.to_string(),
                reply: tx,
            })
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    async fn call(&self, addr: &str, request: Request) -> Result<Response> {
        let conn = self.connection(addr).await?;
        match self.exchange(&conn, request).await {
            Ok(response) => Ok(response),
            Err(err) => {
                if err.is_unavailable() {
                    self.evict_addr(addr).await;
                }
                Err(err)
            }
        }
    }

    async fn exchange(&self, conn: &Connection, request: Request) -> Result<Response> {
        let exchange = async {
            let (mut send, mut recv) = conn
                .open_bi()
                .await
                .map_err(|e| Error::Unavailable(format!("failed to open stream: {e}")))?;

            let bytes = messages::serialize_request(&request)?;
            write_frame(&mut send, &bytes).await?;

            let response_bytes = read_frame(&mut recv, MAX_FRAME_SIZE).await?;
            let response: Response = messages::deserialize_bounded(&response_bytes)
                .map_err(|e| Error::Internal(format!("malformed response: {e}")))?;
            Ok(response)
        };

        match tokio::time::timeout(RPC_STREAM_TIMEOUT, exchange).await {
            Ok(result) => result,
            Err(_) => Err(Error::Unavailable("rpc timed out".into())),
        }
    }

    async fn evict_addr(&self, addr: &str) {
        let _ = self
            .cmd_tx
            .send(PoolCommand::Remove {
                addr: addr.to_string(),
            })
            .await;
    }
}

#[async_trait]
impl NodeRpc for RpcClient {
    async fn join(&self, addr: &str, joiner: Descriptor) -> Result<()> {
        let request = Request::Join {
            joiner: messages::descriptor_to_wire(&joiner),
        };
        match self.call(addr, request).await? {
            Response::Ack => Ok(()),
            Response::Error { code, message } => Err(Error::from_code(code, message)),
            other => Err(Error::Internal(format!(
                "unexpected response to join: {other:?}"
            ))),
        }
    }

    async fn hello(&self, addr: &str, hello: Hello) -> Result<()> {
        let request = messages::hello_to_wire(&hello);
        match self.call(addr, request).await? {
            Response::Hello { new_state: None } => Ok(()),
            Response::Hello {
                new_state: Some(state),
            } => Err(Error::StateChanged {
                new_state: Box::new(messages::state_from_wire(state)?),
            }),
            Response::Error { code, message } => Err(Error::from_code(code, message)),
            other => Err(Error::Internal(format!(
                "unexpected response to hello: {other:?}"
            ))),
        }
    }

    async fn goodbye(&self, addr: &str, leaver: Descriptor) -> Result<()> {
        let request = Request::Goodbye {
            node: messages::descriptor_to_wire(&leaver),
        };
        match self.call(addr, request).await? {
            Response::Ack => Ok(()),
            Response::Error { code, message } => Err(Error::from_code(code, message)),
            other => Err(Error::Internal(format!(
                "unexpected response to goodbye: {other:?}"
            ))),
        }
    }

    async fn get_state(&self, addr: &str) -> Result<State> {
        match self.call(addr, Request::GetState).await? {
            Response::State { state } => messages::state_from_wire(state),
            Response::Error { code, message } => Err(Error::from_code(code, message)),
            other => Err(Error::Internal(format!(
                "unexpected response to get-state: {other:?}"
            ))),
        }
    }

    async fn forward(&self, addr: &str, request: AppRequest) -> Result<Vec<u8>> {
        let request = Request::App {
            method: request.method,
            metadata: request.metadata,
            body: request.body,
        };
        match self.call(addr, request).await? {
            Response::App { body } => Ok(body),
            Response::Error { code, message } => Err(Error::from_code(code, message)),
            other => Err(Error::Internal(format!(
                "unexpected response to forwarded request: {other:?}"
            ))),
        }
    }

    async fn evict(&self, addr: &str) {
        self.evict_addr(addr).await;
    }
}

/// Server side of the wire protocol, implemented by the node controller.
#[async_trait]
pub(crate) trait ServerHandler: Send + Sync + 'static {
    async fn handle_join(&self, joiner: Descriptor) -> Result<()>;
    async fn handle_hello(&self, hello: Hello) -> Result<()>;
    async fn handle_goodbye(&self, leaver: Descriptor) -> Result<()>;
    async fn handle_get_state(&self) -> State;
    async fn handle_app(&self, request: AppRequest) -> Result<Vec<u8>>;
}

/// Accepts connections until the endpoint closes, dispatching every
/// request to `handler`.
pub(crate) async fn serve(endpoint: Endpoint, handler: Arc<dyn ServerHandler>) {
    while let Some(incoming) = endpoint.accept().await {
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(incoming, handler).await {
                debug!(error = %err, "connection ended with error");
            }
        });
    }
}

async fn handle_connection(incoming: quinn::Incoming, handler: Arc<dyn ServerHandler>) -> Result<()> {
    let connection = incoming
        .await
        .map_err(|e| Error::Unavailable(format!("failed to accept connection: {e}")))?;
    let remote = connection.remote_address();
    debug!(%remote, "peer connected");

    loop {
        let stream = match connection.accept_bi().await {
            Ok(s) => s,
            Err(quinn::ConnectionError::ApplicationClosed(_))
            | Err(quinn::ConnectionError::TimedOut)
            | Err(quinn::ConnectionError::LocallyClosed) => {
                debug!(%remote, "peer connection closed");
                return Ok(());
            }
            Err(e) => {
                return Err(Error::Unavailable(format!("connection lost: {e}")));
            }
        };

        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_stream(stream, handler).await {
                debug!(%remote, error = %err, "stream error");
            }
        });
    }
}

async fn handle_stream(
    (mut send, mut recv): (quinn::SendStream, quinn::RecvStream),
    handler: Arc<dyn ServerHandler>,
) -> Result<()> {
    let request_bytes =
        match tokio::time::timeout(REQUEST_READ_TIMEOUT, read_frame(&mut recv, MAX_FRAME_SIZE))
            .await
        {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(err)) => {
                let response = Response::from_error(&err);
                write_response(&mut send, &response).await?;
                return Err(err);
            }
            Err(_) => return Err(Error::Unavailable("request read timed out".into())),
        };

    let response = match messages::deserialize_bounded::<Request>(&request_bytes) {
        Ok(request) => {
            match tokio::time::timeout(REQUEST_PROCESS_TIMEOUT, dispatch(request, handler)).await {
                Ok(response) => response,
                Err(_) => {
                    warn!("request processing timed out");
                    Response::from_error(&Error::DeadlineExceeded)
                }
            }
        }
        Err(err) => Response::from_error(&err),
    };

    write_response(&mut send, &response).await
}

async fn dispatch(request: Request, handler: Arc<dyn ServerHandler>) -> Response {
    match request {
        Request::Join { joiner } => {
            let joiner = messages::descriptor_from_wire(joiner);
            match handler.handle_join(joiner).await {
                Ok(()) => Response::Ack,
                Err(err) => Response::from_error(&err),
            }
        }
        Request::Hello {
            initiator,
            next,
            state,
            ack_id,
        } => match messages::hello_from_wire(initiator, next, state, ack_id) {
            Ok(hello) => match handler.handle_hello(hello).await {
                Ok(()) => Response::Hello { new_state: None },
                // A stale acknowledgment is not a wire error: the current
                // state rides back so the initiator can refresh and retry.
                Err(Error::StateChanged { new_state }) => Response::Hello {
                    new_state: Some(messages::state_to_wire(&new_state)),
                },
                Err(err) => Response::from_error(&err),
            },
            Err(err) => Response::from_error(&err),
        },
        Request::Goodbye { node } => {
            let leaver = messages::descriptor_from_wire(node);
            match handler.handle_goodbye(leaver).await {
                Ok(()) => Response::Ack,
                Err(err) => Response::from_error(&err),
            }
        }
        Request::GetState => Response::State {
            state: messages::state_to_wire(&handler.handle_get_state().await),
        },
        Request::App {
            method,
            metadata,
            body,
        } => {
            let request = AppRequest {
                method,
                metadata,
                body,
            };
            match handler.handle_app(request).await {
                Ok(body) => Response::App { body },
                Err(err) => Response::from_error(&err),
            }
        }
    }
}

async fn write_response(send: &mut quinn::SendStream, response: &Response) -> Result<()> {
    let bytes = messages::serialize_response(response)?;
    write_frame(send, &bytes).await
}

async fn write_frame(send: &mut quinn::SendStream, bytes: &[u8]) -> Result<()> {
    let len = bytes.len() as u32;
    send.write_all(&len.to_be_bytes())
        .await
        .map_err(|e| Error::Unavailable(format!("failed to write frame: {e}")))?;
    send.write_all(bytes)
        .await
        .map_err(|e| Error::Unavailable(format!("failed to write frame: {e}")))?;
    send.finish()
        .map_err(|e| Error::Unavailable(format!("failed to finish stream: {e}")))?;
    Ok(())
}

async fn read_frame(recv: &mut quinn::RecvStream, max: usize) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    recv.read_exact(&mut len_buf)
        .await
        .map_err(|e| Error::Unavailable(format!("failed to read frame header: {e}")))?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max {
        return Err(Error::InvalidArgument(format!(
            "frame too large: {len} bytes (max {max})"
        )));
    }

    let mut bytes = vec![0u8; len];
    recv.read_exact(&mut bytes)
        .await
        .map_err(|e| Error::Unavailable(format!("failed to read frame body: {e}")))?;
    Ok(bytes)
}
