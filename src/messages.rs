//! Wire protocol messages and the shims that keep them at the edge.
//!
//! Everything crossing the network lives here as a `Wire*` struct,
//! serialized with bincode under a size limit. Domain code never touches
//! these types: the `*_to_wire` / `*_from_wire` shims translate at the RPC
//! boundary in both directions, and malformed input is rejected or skipped
//! during translation rather than trusted.
//!
//! The schema has four protocol request/response pairs (join, hello,
//! goodbye, get-state) plus the forwarded application request, all carried
//! in one [`Request`]/[`Response`] envelope pair over length-prefixed QUIC
//! streams.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::descriptor::{Descriptor, Health};
use crate::error::{Error, Result};
use crate::id::{self, Id};
use crate::state::{Hello, RoutingTable, State};

/// Maximum size of an application payload carried in a forwarded request
/// or response (1 MiB). Larger payloads should be chunked by the
/// application.
pub const MAX_APP_PAYLOAD: usize = 1024 * 1024;

/// Maximum buffer accepted by deserialization. Slightly larger than
/// [`MAX_APP_PAYLOAD`] to allow for framing overhead around a full-size
/// payload.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_APP_PAYLOAD as u64) + 64 * 1024;

/// Bincode options with the size limit enforced. Every decode of
/// network-supplied bytes goes through this.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Decode with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode_options()
        .deserialize(bytes)
        .map_err(|e| Error::InvalidArgument(format!("malformed message: {e}")))
}

/// Encode a request for the wire.
pub fn serialize_request(request: &Request) -> Result<Vec<u8>> {
    bincode::serialize(request).map_err(|e| Error::Internal(format!("encode request: {e}")))
}

/// Encode a response for the wire.
pub fn serialize_response(response: &Response) -> Result<Vec<u8>> {
    bincode::serialize(response).map_err(|e| Error::Internal(format!("encode response: {e}")))
}

/// A 128-bit ID as two 64-bit halves, high half first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireId {
    pub high: u64,
    pub low: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireDescriptor {
    pub id: WireId,
    pub addr: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireHealth {
    Healthy,
    Unhealthy,
    Dead,
}

/// A node's full state as shared in hellos and get-state responses.
///
/// `routing` is sparse: cell (row, col) travels under key
/// `row * id_base + col`. `health_set` is sorted by peer id and free of
/// duplicates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireState {
    pub node: WireDescriptor,
    pub predecessors: Vec<WireDescriptor>,
    pub successors: Vec<WireDescriptor>,
    pub id_bit_length: u32,
    pub id_base: u32,
    pub routing: Vec<(u32, WireDescriptor)>,
    pub neighborhood: Vec<WireDescriptor>,
    /// Version stamp (nanoseconds since the epoch) of the carried state.
    pub state_id: u64,
    pub health_set: Vec<(WireDescriptor, WireHealth)>,
}

/// The request envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Request {
    Join {
        joiner: WireDescriptor,
    },
    Hello {
        initiator: WireDescriptor,
        next: Option<WireDescriptor>,
        state: WireState,
        /// 0 = not an acknowledgment; otherwise the receiver's state_id
        /// the sender last observed.
        ack_id: u64,
    },
    Goodbye {
        node: WireDescriptor,
    },
    GetState,
    /// A forwarded application request. The routing key rides in
    /// `metadata`.
    App {
        method: String,
        metadata: Vec<(String, String)>,
        body: Vec<u8>,
    },
}

/// The response envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Response {
    /// Success with no payload (join, goodbye).
    Ack,
    /// Hello reply. `new_state` is populated exactly when the hello's
    /// acknowledgment was stale.
    Hello { new_state: Option<WireState> },
    /// Get-state reply.
    State { state: WireState },
    /// Application reply payload.
    App { body: Vec<u8> },
    /// A taxonomy error carried across the wire.
    Error { code: u32, message: String },
}

impl Response {
    /// Wraps an error for the wire.
    pub fn from_error(err: &Error) -> Response {
        Response::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

pub fn id_to_wire(id: Id) -> WireId {
    let (high, low) = id.to_parts();
    WireId { high, low }
}

pub fn id_from_wire(id: WireId) -> Id {
    Id::from_parts(id.high, id.low)
}

pub fn descriptor_to_wire(d: &Descriptor) -> WireDescriptor {
    WireDescriptor {
        id: id_to_wire(d.id),
        addr: d.addr.clone(),
    }
}

pub fn descriptor_from_wire(d: WireDescriptor) -> Descriptor {
    Descriptor::new(id_from_wire(d.id), d.addr)
}

pub fn health_to_wire(h: Health) -> WireHealth {
    match h {
        Health::Healthy => WireHealth::Healthy,
        Health::Unhealthy => WireHealth::Unhealthy,
        Health::Dead => WireHealth::Dead,
    }
}

pub fn health_from_wire(h: WireHealth) -> Health {
    match h {
        WireHealth::Healthy => Health::Healthy,
        WireHealth::Unhealthy => Health::Unhealthy,
        WireHealth::Dead => Health::Dead,
    }
}

pub fn state_to_wire(s: &State) -> WireState {
    let base = s.base();

    let mut routing = Vec::new();
    for (row, col, d) in s.routing().entries() {
        let key = row as u32 * base + col as u32;
        routing.push((key, descriptor_to_wire(d)));
    }

    let mut health_set: Vec<(WireDescriptor, WireHealth)> = s
        .statuses()
        .iter()
        .map(|(d, h)| (descriptor_to_wire(d), health_to_wire(*h)))
        .collect();
    health_set.sort_by(|(a, _), (b, _)| {
        (a.id.high, a.id.low, &a.addr).cmp(&(b.id.high, b.id.low, &b.addr))
    });

    WireState {
        node: descriptor_to_wire(s.node()),
        predecessors: s.predecessors().iter().map(descriptor_to_wire).collect(),
        successors: s.successors().iter().map(descriptor_to_wire).collect(),
        id_bit_length: s.size(),
        id_base: base,
        routing,
        neighborhood: s.neighbors().iter().map(descriptor_to_wire).collect(),
        state_id: s.version(),
        health_set,
    }
}

/// Rebuilds a domain state from the wire. Rejects unsupported table
/// geometry; routing cells with out-of-range keys are dropped rather than
/// trusted.
pub fn state_from_wire(s: WireState) -> Result<State> {
    let (size, base) = (s.id_bit_length, s.id_base);
    if !matches!(size, 8 | 16 | 32 | 64 | 128) {
        return Err(Error::InvalidArgument(format!(
            "unsupported id bit length {size}"
        )));
    }
    if !matches!(base, 2 | 4 | 8 | 16) {
        return Err(Error::InvalidArgument(format!(
            "unsupported routing base {base}"
        )));
    }

    let rows = id::digit_count(size, base);
    let mut routing = RoutingTable::new(base as usize, rows);
    for (key, d) in s.routing {
        let row = (key / base) as usize;
        let col = (key % base) as usize;
        if row >= rows {
            tracing::debug!(key, rows, base, "dropping out-of-range routing cell");
            continue;
        }
        routing.set(row, col, Some(descriptor_from_wire(d)));
    }

    let statuses = s
        .health_set
        .into_iter()
        .map(|(d, h)| (descriptor_from_wire(d), health_from_wire(h)))
        .collect();

    Ok(State::from_wire_parts(
        descriptor_from_wire(s.node),
        s.predecessors.into_iter().map(descriptor_from_wire).collect(),
        s.successors.into_iter().map(descriptor_from_wire).collect(),
        size,
        base,
        routing,
        s.neighborhood.into_iter().map(descriptor_from_wire).collect(),
        statuses,
        s.state_id,
    ))
}

pub fn hello_to_wire(h: &Hello) -> Request {
    Request::Hello {
        initiator: descriptor_to_wire(&h.initiator),
        next: h.next.as_ref().map(descriptor_to_wire),
        state: state_to_wire(&h.state),
        ack_id: h.ack.unwrap_or(0),
    }
}

pub fn hello_from_wire(
    initiator: WireDescriptor,
    next: Option<WireDescriptor>,
    state: WireState,
    ack_id: u64,
) -> Result<Hello> {
    Ok(Hello {
        initiator: descriptor_from_wire(initiator),
        next: next.map(descriptor_from_wire),
        state: state_from_wire(state)?,
        ack: (ack_id > 0).then_some(ack_id),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(id: u128) -> Descriptor {
        Descriptor::new(Id(id), format!("10.0.0.{}:9095", id % 250))
    }

    fn populated_state() -> State {
        let mut s = State::new(desc(0x5000), 8, 8, 16, 16);
        let mut peer = State::new(desc(0x5100), 8, 8, 16, 16);
        peer.add_leaf(desc(0x5050));
        peer.add_leaf(desc(0x5150));
        s.mixin_state(&peer);
        s.add_neighbor(desc(0x1234));
        s.set_health(desc(0x5150), Health::Unhealthy);
        s
    }

    #[test]
    fn state_round_trip() {
        let s = populated_state();
        let wire = state_to_wire(&s);
        let back = state_from_wire(wire).expect("decode");

        assert_eq!(back.node(), s.node());
        assert_eq!(back.size(), s.size());
        assert_eq!(back.base(), s.base());
        assert_eq!(back.version(), s.version());
        assert_eq!(
            back.predecessors().descriptors(),
            s.predecessors().descriptors()
        );
        assert_eq!(back.successors().descriptors(), s.successors().descriptors());
        assert_eq!(back.neighbors().descriptors(), s.neighbors().descriptors());
        assert_eq!(back.statuses(), s.statuses());

        let mut original: Vec<_> = s.routing().entries().collect();
        let mut decoded: Vec<_> = back.routing().entries().collect();
        original.sort_by_key(|(r, c, _)| (*r, *c));
        decoded.sort_by_key(|(r, c, _)| (*r, *c));
        assert_eq!(original, decoded);
    }

    #[test]
    fn health_set_is_sorted_and_unique() {
        let wire = state_to_wire(&populated_state());
        let keys: Vec<(u64, u64, &str)> = wire
            .health_set
            .iter()
            .map(|(d, _)| (d.id.high, d.id.low, d.addr.as_str()))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn request_round_trips() {
        let hello = Hello {
            initiator: desc(1),
            next: Some(desc(2)),
            state: populated_state(),
            ack: Some(42),
        };
        let requests = vec![
            Request::Join {
                joiner: descriptor_to_wire(&desc(9)),
            },
            hello_to_wire(&hello),
            Request::Goodbye {
                node: descriptor_to_wire(&desc(9)),
            },
            Request::GetState,
            Request::App {
                method: "kv.Get".into(),
                metadata: vec![("levain-request-id".into(), "1234".into())],
                body: b"payload".to_vec(),
            },
        ];

        for request in requests {
            let bytes = serialize_request(&request).expect("encode");
            let decoded: Request = deserialize_bounded(&bytes).expect("decode");
            match (&request, &decoded) {
                (Request::Join { joiner: a }, Request::Join { joiner: b }) => assert_eq!(a, b),
                (
                    Request::Hello { ack_id: a, .. },
                    Request::Hello {
                        ack_id: b,
                        initiator,
                        next,
                        ..
                    },
                ) => {
                    assert_eq!(a, b);
                    assert_eq!(initiator, &descriptor_to_wire(&hello.initiator));
                    assert_eq!(next.as_ref(), Some(&descriptor_to_wire(&desc(2))));
                }
                (Request::Goodbye { node: a }, Request::Goodbye { node: b }) => assert_eq!(a, b),
                (Request::GetState, Request::GetState) => {}
                (Request::App { body: a, .. }, Request::App { body: b, method, .. }) => {
                    assert_eq!(a, b);
                    assert_eq!(method, "kv.Get");
                }
                other => panic!("variant mismatch: {other:?}"),
            }
        }
    }

    #[test]
    fn error_response_round_trips_taxonomy() {
        let err = Error::Unavailable("connection reset".into());
        let bytes = serialize_response(&Response::from_error(&err)).expect("encode");
        let decoded: Response = deserialize_bounded(&bytes).expect("decode");
        match decoded {
            Response::Error { code, message } => {
                let back = Error::from_code(code, message);
                assert!(back.is_unavailable());
            }
            other => panic!("expected error response, got {other:?}"),
        }
    }

    #[test]
    fn hello_ack_zero_means_no_ack() {
        let hello = Hello {
            initiator: desc(1),
            next: None,
            state: populated_state(),
            ack: None,
        };
        match hello_to_wire(&hello) {
            Request::Hello {
                initiator,
                next,
                state,
                ack_id,
            } => {
                assert_eq!(ack_id, 0);
                let back = hello_from_wire(initiator, next, state, ack_id).expect("decode");
                assert_eq!(back.ack, None);
            }
            other => panic!("unexpected variant {other:?}"),
        }
    }

    #[test]
    fn malformed_bytes_rejected() {
        let garbage = [0xFFu8, 0xFE, 0xFD, 0xFC, 0xFB];
        assert!(deserialize_bounded::<Request>(&garbage).is_err());

        let bytes = serialize_request(&Request::GetState).expect("encode");
        if bytes.len() > 1 {
            assert!(deserialize_bounded::<Request>(&bytes[..bytes.len() / 2]).is_err());
        }
    }

    #[test]
    fn out_of_range_routing_cells_are_dropped() {
        let mut wire = state_to_wire(&populated_state());
        wire.routing.push((
            9999,
            WireDescriptor {
                id: WireId { high: 0, low: 1 },
                addr: "bogus".into(),
            },
        ));
        let decoded = state_from_wire(wire).expect("decode");
        assert!(decoded.routing().entries().all(|(_, _, d)| d.addr != "bogus"));
    }

    #[test]
    fn unsupported_geometry_rejected() {
        let mut wire = state_to_wire(&populated_state());
        wire.id_base = 3;
        assert!(state_from_wire(wire).is_err());

        let mut wire = state_to_wire(&populated_state());
        wire.id_bit_length = 24;
        assert!(state_from_wire(wire).is_err());
    }
}
