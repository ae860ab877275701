//! Key-routed request forwarding.
//!
//! [`Client`] is a transparent client to the cluster: every request
//! carries a 128-bit routing key, and the client delivers it to the live
//! node whose id is numerically closest, retrying through next-hop
//! selection as unreachable peers get tainted. Requests that resolve to
//! the local node run the local [`Application`] handler directly.
//!
//! The routing key travels on two channels: out-of-band in the forwarded
//! envelope's metadata under [`REQUEST_ID_HEADER`], and in-process through
//! a task-local that [`current_key`] exposes to handlers.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::id::Id;
use crate::node::{Controller, Node};
use crate::protocols::{AppRequest, NodeRpc, Peer};
use crate::rpc::RpcClient;

/// Metadata header carrying the routing key as a base-10 string.
pub const REQUEST_ID_HEADER: &str = "levain-request-id";

/// Bound on taint-and-retry rounds for one forwarded request. Each retry
/// taints the failed hop, so the candidate set shrinks monotonically; the
/// bound turns a pathological outage into [`Error::Exhausted`] instead of
/// a spin.
const MAX_FORWARD_ATTEMPTS: usize = 32;

tokio::task_local! {
    static CURRENT_KEY: Id;
}

/// The routing key of the request currently being handled, if the calling
/// task is inside an application handler invoked by the overlay.
pub fn current_key() -> Option<Id> {
    CURRENT_KEY.try_with(|k| *k).ok()
}

/// Hook invoked before each forward, allowing the destination to be
/// rewritten (for example to a co-located proxy).
pub type ForwardHook = Arc<dyn Fn(Peer) -> Result<Peer> + Send + Sync>;

/// A key-routed client to the cluster.
pub struct Client<N: NodeRpc = RpcClient> {
    ctrl: Arc<Controller<N>>,
    allow_self: bool,
    forward_hook: Option<ForwardHook>,
}

impl<N: NodeRpc> Client<N> {
    /// Creates a client routing through `node`.
    pub fn new(node: &Node<N>) -> Self {
        Client {
            ctrl: node.controller(),
            allow_self: true,
            forward_hook: None,
        }
    }

    /// Controls whether a request resolving to the local node runs the
    /// local handler (the default) or fails with
    /// [`Error::SelfRouting`].
    pub fn allow_self_routing(mut self, allow: bool) -> Self {
        self.allow_self = allow;
        self
    }

    /// Installs a hook that may rewrite the destination before each
    /// forward.
    pub fn with_forward_hook(
        mut self,
        hook: impl Fn(Peer) -> Result<Peer> + Send + Sync + 'static,
    ) -> Self {
        self.forward_hook = Some(Arc::new(hook));
        self
    }

    /// Routes a request through the overlay to the node owning `key` and
    /// returns that node's reply.
    pub async fn invoke(&self, method: &str, key: Id, body: Vec<u8>) -> Result<Vec<u8>> {
        self.ctrl
            .route_invoke(method, key, body, self.allow_self, self.forward_hook.as_ref())
            .await
    }
}

impl<N: NodeRpc> Controller<N> {
    /// The forwarding decision: pick the next hop, run locally when this
    /// node owns the key, otherwise send and retry through tainting.
    pub(crate) async fn route_invoke(
        &self,
        method: &str,
        key: Id,
        body: Vec<u8>,
        allow_self: bool,
        forward_hook: Option<&ForwardHook>,
    ) -> Result<Vec<u8>> {
        for _ in 0..MAX_FORWARD_ATTEMPTS {
            let state = self.state.snapshot();
            let next = crate::routing::next_hop(&state, key).ok_or_else(|| {
                Error::Internal(format!("unable to find any node for key {key}"))
            })?;

            let next = match forward_hook {
                Some(hook) => {
                    let peer = hook(Peer::from(next))?;
                    crate::descriptor::Descriptor::new(peer.id, peer.addr)
                }
                None => next,
            };

            if next == *state.node() {
                if !allow_self {
                    return Err(Error::SelfRouting);
                }
                return self.handle_local(method, key, body).await;
            }

            let request = AppRequest {
                method: method.to_string(),
                metadata: vec![(REQUEST_ID_HEADER.to_string(), key.to_string())],
                body: body.clone(),
            };
            match self.rpc.forward(&next.addr, request).await {
                Err(err) if err.is_unavailable() => {
                    info!(peer = %next.addr, %err, "failed to forward request to peer");
                    self.taint(&next).await;
                }
                other => return other,
            }
        }
        Err(Error::Exhausted)
    }

    /// Runs the local application handler with the routing key exposed
    /// through the task-local.
    async fn handle_local(&self, method: &str, key: Id, body: Vec<u8>) -> Result<Vec<u8>> {
        let app = self.app.clone();
        CURRENT_KEY
            .scope(key, async move { app.handle_request(method, key, body).await })
            .await
    }

    /// Server-side entry for a forwarded request: extract the key and
    /// apply the same forwarding decision, running the local handler when
    /// the route lands here.
    pub(crate) async fn app_request(&self, request: AppRequest) -> Result<Vec<u8>> {
        let raw_key = request
            .metadata_value(REQUEST_ID_HEADER)
            .ok_or_else(|| Error::InvalidArgument("missing routing key".into()))?;
        let key = Id::parse(raw_key)
            .map_err(|e| Error::InvalidArgument(format!("invalid routing key: {e}")))?;

        debug!(method = %request.method, %key, "handling forwarded request");
        match self
            .route_invoke(&request.method, key, request.body.clone(), false, None)
            .await
        {
            // The route resolved to this node: the request is ours.
            Err(Error::SelfRouting) => self.handle_local(&request.method, key, request.body).await,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_key_is_unset_outside_handlers() {
        assert_eq!(current_key(), None);
    }

    #[tokio::test]
    async fn current_key_scopes_to_the_task() {
        let observed = CURRENT_KEY
            .scope(Id(77), async { current_key() })
            .await;
        assert_eq!(observed, Some(Id(77)));
        assert_eq!(current_key(), None);
    }
}
