//! # culvert-agent
//!
//! The agent half of the culvert reverse tunnel fabric. It lives inside a
//! private network, dials out to the controller, and fulfills tunneled
//! HTTP requests against the endpoints it advertises: Kubernetes API
//! servers, AWS accounts (credential hand-back, never proxied), and
//! generic HTTP services.
//!
//! ```text
//! main.rs       — CLI flags, config, startup wiring, shutdown
//! config.rs     — YAML configuration (controller address, endpoints)
//! tunnel.rs     — outbound framed mTLS stream, reconnect, dispatch
//! kubeconfig.rs — minimal kubeconfig model
//! executor/     — per-endpoint-type request executors
//! ```

pub mod config;
pub mod executor;
pub mod kubeconfig;
pub mod tunnel;
