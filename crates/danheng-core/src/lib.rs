//! DanHeng Core - redirect rules and the traffic decision engine.
//!
//! This crate decides, per request, whether traffic is passed through,
//! redirected to the configured destination, or blocked. It performs no IO
//! apart from reading the config file once at startup.
//!
//! ```text
//! Request → ignore list? ── yes ──────────────────────────→ PassThrough
//!              │ no
//!              ▼
//!      redirect domain or force keyword? ── no ───────────→ PassThrough
//!              │ yes
//!              ▼
//!      rewrite to destination → blocked path? ── yes ─────→ Block
//!                                    │ no
//!                                    ▼
//!                                 Redirect
//! ```

pub mod config;
mod engine;
mod error;
mod rules;
mod trust;

pub use engine::{strip_port, Decision, DecisionEngine};
pub use error::{ConfigError, Result, RewriteError};
pub use rules::RuleSet;
pub use trust::{certificate_trust, CertificateTrust, CertificateValidation};
