//! DanHeng Proxy - redirecting MITM proxy.
//!
//! This crate runs a local HTTP/HTTPS proxy that sends traffic for selected
//! domains to a configured destination instead of the real servers. The
//! decisions themselves live in [`danheng_core`]; this crate connects them
//! to the hudsucker proxy engine.
//!
//! ## Features
//!
//! - Generates root CA certificate on first run
//! - Decrypts only tunnels to redirect candidates (passthrough for others)
//! - Rewrites matching requests to the destination host and port
//! - Answers blocked paths with `404 Blocked`
//! - Validates the destination certificate when configured to
//!
//! ## Architecture
//!
//! ```text
//! CONNECT host ─→ should_intercept ─→ redirect candidate?
//!                                        │
//!                    ┌───────────────────┴──────────────────┐
//!                    │ No                                   │ Yes
//!                    ▼                                      ▼
//!              Opaque tunnel                         Decrypt, then per request
//!                                                          │
//!                                                          ▼
//!                                                  DecisionEngine::decide
//!                                                          │
//!                                    ┌─────────────────────┼──────────────────┐
//!                                    │ PassThrough         │ Redirect         │ Block
//!                                    ▼                     ▼                  ▼
//!                              Forward as is      Forward to destination   404 Blocked
//! ```

mod ca;
mod error;
mod handler;
mod port;
mod proxy;
mod verifier;

pub use ca::{CaManager, CaManagerError};
pub use error::{ProxyError, Result};
pub use handler::{DecisionEvent, OnDecisionCallback, RedirectHandler, BLOCKED_BODY};
pub use port::{FixedPortSource, PortSource, RandomPortSource, EPHEMERAL_PORT_RANGE};
pub use proxy::{ProxyConfig, ProxyHandle, ProxyServer};
pub use verifier::{client_config, https_connector, root_store, GatedCertVerifier};
