//! Tunnel protocol messages.
//!
//! Every message on a tunnel stream is a [`Frame`], serialized as a JSON
//! object with a `"type"` tag (serde's internally-tagged representation,
//! snake_case variant names). Tunnel-transaction messages are nested one
//! level deeper under [`Frame::TunnelControl`] with their own `"control"`
//! tag, so `CancelRequest { id }` serializes as
//! `{"type":"tunnel_control","control":"cancel_request","id":"..."}`.
//!
//! Unknown tags decode to [`Frame::Unknown`] / [`TunnelControl::Unknown`]
//! rather than failing the stream; receivers drop them with a log entry.
//! This keeps old peers compatible with newer message sets.

use serde::{Deserialize, Serialize};

/// One message on the tunnel stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Keepalive probe. `ts` is the sender's clock in unix milliseconds.
    Ping { ts: u64 },
    /// Keepalive reply; echoes the probe's timestamp.
    Pong { ts: u64, echoed_ts: u64 },
    /// The opening message from agent to controller: identity, version,
    /// and the endpoint inventory this agent can serve.
    Hello(Hello),
    /// A transaction-scoped message; see [`TunnelControl`].
    TunnelControl(TunnelControl),
    /// A tag this build does not know. Dropped by receivers, never an error.
    #[serde(other)]
    Unknown,
}

/// Transaction-scoped messages, multiplexed by transaction id.
///
/// Per transaction the stream carries exactly
/// `OpenHttpTunnelRequest → HttpTunnelResponse → HttpTunnelChunkedResponse*`
/// terminated by a chunk with an empty body. `CancelRequest` may arrive at
/// any point in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "control", rename_all = "snake_case")]
pub enum TunnelControl {
    OpenHttpTunnelRequest(OpenHttpTunnelRequest),
    /// Abort the transaction `id`. Best-effort: chunks already in flight
    /// may still arrive after this.
    CancelRequest { id: String },
    HttpTunnelResponse(HttpTunnelResponse),
    /// One piece of response body. An empty `body` is the terminal frame
    /// for the transaction.
    HttpTunnelChunkedResponse {
        id: String,
        #[serde(with = "base64_bytes")]
        body: Vec<u8>,
    },
    #[serde(other)]
    Unknown,
}

/// Agent greeting, sent once as the first frame of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub endpoints: Vec<Endpoint>,
    pub version: String,
    pub hostname: String,
    /// PEM of the agent's client certificate, when it wants the controller
    /// to record it. Optional; identity always comes from the TLS layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_cert: Option<String>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

/// A named, typed capability advertised by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// `false` means the agent advertises the endpoint but holds no usable
    /// credentials for it; such endpoints are skipped by route selection.
    pub configured: bool,
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assume_role: Option<String>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub name: String,
    pub value: String,
}

/// One HTTP header with all of its values. Multi-value semantics are
/// preserved end to end; order within `values` is the order observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHeader {
    pub name: String,
    pub values: Vec<String>,
}

/// Opens a tunneled HTTP transaction on an agent endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenHttpTunnelRequest {
    pub id: String,
    /// Endpoint name, e.g. `prod`.
    pub name: String,
    /// Endpoint type, e.g. `kubernetes`. Named `endpoint_type` on the wire
    /// so it cannot collide with the frame's `type` tag once the variant
    /// is flattened into one object.
    #[serde(rename = "endpoint_type")]
    pub kind: String,
    pub method: String,
    /// Path and query only; the host was stripped by ingress.
    pub uri: String,
    pub headers: Vec<HttpHeader>,
    /// Fully buffered request body.
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
}

/// Status line and headers of a tunneled response. Body bytes follow as
/// chunked-response frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpTunnelResponse {
    pub id: String,
    pub status: u16,
    pub headers: Vec<HttpHeader>,
    /// `-1` when the upstream did not declare a length.
    pub content_length: i64,
}

impl Frame {
    pub fn ping(ts: u64) -> Frame {
        Frame::Ping { ts }
    }

    pub fn pong(ts: u64, echoed_ts: u64) -> Frame {
        Frame::Pong { ts, echoed_ts }
    }

    pub fn cancel_request(id: &str) -> Frame {
        Frame::TunnelControl(TunnelControl::CancelRequest { id: id.to_string() })
    }

    pub fn chunk(id: &str, body: Vec<u8>) -> Frame {
        Frame::TunnelControl(TunnelControl::HttpTunnelChunkedResponse {
            id: id.to_string(),
            body,
        })
    }

    /// The terminal frame for transaction `id`.
    pub fn terminal_chunk(id: &str) -> Frame {
        Frame::chunk(id, Vec::new())
    }
}

/// Synthesized `502 Bad Gateway` response for a transaction that failed on
/// the agent side, followed by its terminal chunk.
pub fn bad_gateway_frames(id: &str) -> [Frame; 2] {
    [
        Frame::TunnelControl(TunnelControl::HttpTunnelResponse(HttpTunnelResponse {
            id: id.to_string(),
            status: 502,
            headers: Vec::new(),
            content_length: 0,
        })),
        Frame::terminal_chunk(id),
    ]
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}
