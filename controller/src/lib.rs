//! # culvert-controller
//!
//! The controller half of the culvert reverse tunnel fabric. Agents inside
//! private networks dial out to the agent tunnel port and hold a single
//! framed mTLS stream open; enterprise clients send ordinary HTTP to the
//! ingress ports; the controller splices the two together, multiplexing
//! many concurrent transactions per stream with chunked response streaming
//! and cancellation in both directions.
//!
//! ## Ports
//!
//! | Port  | Surface                                         |
//! |-------|-------------------------------------------------|
//! | 9001  | Agent tunnel stream (mTLS, `agent` certs)       |
//! | 9002  | CNC REST (mTLS, `control` certs)                |
//! | 9003  | `_services` ingress (HTTPS, URL-prefix routing) |
//! | per-service | Incoming-service ingress (JWT routing)    |
//! | 9102  | Prometheus `/metrics`, `/` + `/health`          |
//!
//! ## Architecture
//!
//! ```text
//! main.rs        — CLI flags, config, startup wiring, graceful shutdown
//! config.rs      — YAML configuration and validation
//! ca.rs          — certificate authority (server + client cert issuance)
//! identity.rs    — peer certificate OU -> CertificateName binding
//! serviceauth.rs — HS256 JWT keysets (service + header mutation tokens)
//! routes.rs      — route table: live sessions, selection, backpressure
//! session.rs     — per-stream state machine (handshake/open/draining)
//! ingress.rs     — HTTP -> tunnel transaction splicing
//! cnc.rs         — command-and-control REST handlers
//! listener.rs    — TLS/TCP accept loops for every port
//! metrics.rs     — Prometheus exposition + health probes
//! webhook.rs     — agent-connected webhook notifier
//! ```

pub mod ca;
pub mod cnc;
pub mod config;
pub mod identity;
pub mod ingress;
pub mod listener;
pub mod metrics;
pub mod routes;
pub mod serviceauth;
pub mod session;
pub mod webhook;
