//! Interface traits between the overlay core and its collaborators.
//!
//! [`NodeRpc`] abstracts the transport: the controller, failure detector,
//! and forwarder speak to peers only through it, so tests swap in an
//! in-process implementation and production wires up the QUIC client from
//! [`crate::rpc`].
//!
//! [`Application`] is the other direction: callbacks and the local request
//! handler supplied by whatever service embeds the overlay.

use async_trait::async_trait;

use crate::descriptor::Descriptor;
use crate::error::Result;
use crate::id::Id;
use crate::state::{Hello, State};

/// A peer in the cluster, as exposed to applications.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    /// Ring identity.
    pub id: Id,
    /// Transport locator.
    pub addr: String,
}

impl From<Descriptor> for Peer {
    fn from(d: Descriptor) -> Self {
        Peer {
            id: d.id,
            addr: d.addr,
        }
    }
}

/// An application request forwarded through the overlay. The routing key
/// rides out-of-band in `metadata` under
/// [`crate::router::REQUEST_ID_HEADER`]; `method` and `body` are opaque to
/// the overlay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppRequest {
    /// Application-defined method name.
    pub method: String,
    /// Out-of-band string metadata.
    pub metadata: Vec<(String, String)>,
    /// Opaque request payload.
    pub body: Vec<u8>,
}

impl AppRequest {
    /// The first metadata value recorded under `key`, if any.
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Client side of the overlay's wire protocol. One implementation exists
/// per transport; every peer interaction in the crate funnels through this
/// trait.
#[async_trait]
pub trait NodeRpc: Send + Sync + 'static {
    /// Informs the node at `addr` that `joiner` wishes to join the cluster.
    /// Joins propagate through the cluster along the routing path for the
    /// joiner's id; each hop sends a hello back to the joiner.
    async fn join(&self, addr: &str, joiner: Descriptor) -> Result<()>;

    /// Shares state with the node at `addr`. When `hello.ack` is set and
    /// the receiver's state moved on, fails with
    /// [`crate::Error::StateChanged`].
    async fn hello(&self, addr: &str, hello: Hello) -> Result<()>;

    /// Informs the node at `addr` that `leaver` is leaving the cluster.
    async fn goodbye(&self, addr: &str, leaver: Descriptor) -> Result<()>;

    /// Fetches the current state of the node at `addr`. Doubles as the
    /// liveness probe.
    async fn get_state(&self, addr: &str) -> Result<State>;

    /// Delivers a forwarded application request to the node at `addr` and
    /// returns its reply.
    async fn forward(&self, addr: &str, request: AppRequest) -> Result<Vec<u8>>;

    /// Drops any cached transport channel for `addr`. Called when a peer is
    /// repaired out of the overlay.
    async fn evict(&self, addr: &str);
}

/// The application embedding the overlay. Invoked by the node as the
/// cluster changes and when a forwarded request lands on its owner.
#[async_trait]
pub trait Application: Send + Sync + 'static {
    /// Invoked whenever the set of leaf peers changes.
    async fn peers_changed(&self, peers: Vec<Peer>);

    /// Handles a request the overlay routed to this node. `key` is the
    /// routing key the request carried.
    async fn handle_request(&self, method: &str, key: Id, body: Vec<u8>) -> Result<Vec<u8>>;
}
