//! # Levain - Embeddable Pastry-Style DHT Overlay
//!
//! Levain gives a server process an identity on a 128-bit ring and a
//! routing substrate that delivers any request keyed by a 128-bit ID to
//! the live node whose identity is numerically closest, in O(log N) hops.
//! Applications plug request handlers on top; a key-routed client
//! forwards each call to the owning node transparently.
//!
//! ## Quick Start
//!
//! ```ignore
//! let id = levain::Generator::new(32).get("my-server-name");
//! let cfg = levain::Config::new(id, "0.0.0.0:9095", "10.0.0.5:9095");
//! let node = levain::Node::start(cfg, app).await?;
//! node.join(&["10.0.0.1:9095".to_string()]).await?;
//!
//! // Route a request to whichever node owns the key.
//! let client = levain::Client::new(&node);
//! let reply = client.invoke("kv.Get", key, request_bytes).await?;
//! ```
//!
//! ## Architecture
//!
//! Long-lived components follow the handle + actor pattern: public handles
//! are cheap to clone and talk to privately-owned actor tasks over async
//! channels. The one shared-data exception is the routing [`State`],
//! which sits behind a single mutex with method-scoped critical sections;
//! no lock is ever held across an RPC.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `id` | 128-bit IDs, digit decomposition, hash-based generation |
//! | `descriptor` | Peer descriptors, bounded sorted sets, health states |
//! | `state` | Per-node routing state: leaf sets, routing table, mixins |
//! | `routing` | Next-hop selection over a state snapshot |
//! | `health` | Per-peer liveness probing with hysteresis |
//! | `node` | Join/hello/goodbye protocols, repair, lifecycle |
//! | `router` | Key-routed forwarding client with bounded retry |
//! | `protocols` | Transport and application interface traits |
//! | `messages` | Wire schema and the shims keeping it at the edge |
//! | `rpc` | QUIC RPC client pool and server loop |

mod transport;

pub mod descriptor;
pub mod error;
pub mod health;
pub mod id;
pub mod messages;
pub mod node;
pub mod protocols;
pub mod router;
pub mod routing;
pub mod rpc;
pub mod state;

pub use descriptor::{Descriptor, DescriptorSet, Health};
pub use error::{Error, Result};
pub use id::{Digits, Generator, Id};
pub use node::{Config, Node};
pub use protocols::{AppRequest, Application, NodeRpc, Peer};
pub use router::{current_key, Client, REQUEST_ID_HEADER};
pub use state::{Hello, MixinOutcome, RoutingTable, SharedState, State};
