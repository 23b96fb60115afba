//! Session adapter between hudsucker and the decision engine.
//!
//! hudsucker calls [`HttpHandler::should_intercept`] once per CONNECT tunnel
//! and [`HttpHandler::handle_request`] once per plain or decrypted request.
//! Both consult the [`DecisionEngine`] and apply its verdict to the
//! in-flight request.

use std::sync::Arc;

use danheng_core::{Decision, DecisionEngine, RewriteError};
use http_body_util::Full;
use hudsucker::{
    hyper::{Request, Response},
    Body, HttpContext, HttpHandler, RequestOrResponse,
};
use hyper::body::Bytes;
use hyper::ext::ReasonPhrase;
use hyper::header::{HeaderValue, CONTENT_TYPE, HOST};
use hyper::{Method, StatusCode, Uri};

/// Body of the response answering blocked requests.
pub const BLOCKED_BODY: &str = "Blocked";

/// A redirect or block applied to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionEvent {
    /// The request was sent to the destination.
    Redirected {
        /// Original request host.
        host: String,
        /// Original request path.
        path: String,
        /// Rewritten URL.
        target: String,
    },
    /// The request was answered with a block response.
    Blocked {
        /// Original request host.
        host: String,
        /// Original request path.
        path: String,
    },
}

/// Callback invoked for every redirect or block.
pub type OnDecisionCallback = Arc<dyn Fn(&DecisionEvent) + Send + Sync>;

/// HTTP handler for the redirecting proxy.
#[derive(Clone)]
pub struct RedirectHandler {
    engine: DecisionEngine,
    on_decision: Option<OnDecisionCallback>,
}

impl std::fmt::Debug for RedirectHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedirectHandler")
            .field("engine", &self.engine)
            .field("on_decision", &self.on_decision.is_some())
            .finish()
    }
}

impl RedirectHandler {
    /// Creates a handler evaluating requests with `engine`.
    pub fn new(engine: DecisionEngine) -> Self {
        Self {
            engine,
            on_decision: None,
        }
    }

    /// Sets the callback for redirect and block events.
    pub fn on_decision<F>(mut self, callback: F) -> Self
    where
        F: Fn(&DecisionEvent) + Send + Sync + 'static,
    {
        self.on_decision = Some(Arc::new(callback));
        self
    }

    /// Sets an already shared callback.
    pub fn with_decision_callback(mut self, callback: Option<OnDecisionCallback>) -> Self {
        self.on_decision = callback;
        self
    }

    /// Decides whether the tunnel opened by a CONNECT request is decrypted.
    pub fn should_decrypt(&self, req: &Request<Body>) -> bool {
        let host = match Self::extract_host(req) {
            Some(h) => h,
            None => return false,
        };

        let decrypt = self.engine.should_decrypt_tunnel(&host);
        tracing::debug!(
            "Tunnel to {}: {}",
            host,
            if decrypt { "decrypting" } else { "passthrough" }
        );
        decrypt
    }

    /// Applies the engine's verdict to a request.
    pub fn process_request(&self, mut req: Request<Body>) -> RequestOrResponse {
        // CONNECT is seen before the tunnel gate; its authority must stay intact
        if req.method() == Method::CONNECT {
            return RequestOrResponse::Request(req);
        }

        let host = match Self::extract_host(&req) {
            Some(h) => h,
            None => return RequestOrResponse::Request(req),
        };
        let path = req.uri().path().to_string();

        let url = match Self::absolute_url(&req, &host) {
            Some(url) => url,
            None => return RequestOrResponse::Request(req),
        };

        let decision = match self.engine.decide(&host, &path, &url) {
            Ok(decision) => decision,
            Err(e) => return RequestOrResponse::Response(self.rewrite_failed(&url, &e)),
        };

        match decision {
            Decision::PassThrough => {
                tracing::trace!("Passing through {}{}", host, path);
                RequestOrResponse::Request(req)
            }
            Decision::Block { .. } => {
                tracing::info!("[BLOCKED] {}", path);
                self.emit(&DecisionEvent::Blocked { host, path });
                RequestOrResponse::Response(Self::create_block_response())
            }
            Decision::Redirect { target } => {
                let uri: Uri = match target.parse() {
                    Ok(uri) => uri,
                    Err(e) => {
                        let err = RewriteError::InvalidTarget {
                            target,
                            reason: e.to_string(),
                        };
                        return RequestOrResponse::Response(self.rewrite_failed(&url, &err));
                    }
                };

                // hyper derives the outgoing Host header from the new URI
                *req.uri_mut() = uri;

                tracing::info!(
                    "[REDIRECT] {} -> {}:{}",
                    host,
                    self.engine.rules().destination_host(),
                    self.engine.rules().destination_port()
                );
                self.emit(&DecisionEvent::Redirected { host, path, target });
                RequestOrResponse::Request(req)
            }
        }
    }

    fn emit(&self, event: &DecisionEvent) {
        if let Some(callback) = &self.on_decision {
            callback(event);
        }
    }

    fn rewrite_failed(&self, url: &str, err: &RewriteError) -> Response<Body> {
        tracing::error!("Refusing to forward {}: {}", url, err);
        let mut res = Response::new(bytes_to_body(Bytes::new()));
        *res.status_mut() = StatusCode::BAD_GATEWAY;
        res
    }

    /// Creates the terminal response for blocked requests.
    fn create_block_response() -> Response<Body> {
        let mut res = Response::new(bytes_to_body(Bytes::from_static(BLOCKED_BODY.as_bytes())));
        *res.status_mut() = StatusCode::NOT_FOUND;
        res.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        res.extensions_mut()
            .insert(ReasonPhrase::from_static(BLOCKED_BODY.as_bytes()));
        res
    }

    /// Extracts host from request URI or Host header.
    fn extract_host(req: &Request<Body>) -> Option<String> {
        if let Some(authority) = req.uri().authority() {
            return Some(authority.host().to_string());
        }

        req.headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .filter(|h| !h.is_empty())
            .map(str::to_string)
    }

    /// Absolute URL of the request, rebuilt from the Host header for
    /// origin-form targets.
    fn absolute_url(req: &Request<Body>, host: &str) -> Option<String> {
        let uri = req.uri();
        if uri.scheme().is_some() && uri.authority().is_some() {
            return Some(uri.to_string());
        }

        let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        if !path_and_query.starts_with('/') {
            return None;
        }
        Some(format!("http://{}{}", host, path_and_query))
    }
}

/// Helper to convert bytes to Body
fn bytes_to_body(bytes: Bytes) -> Body {
    Body::from(Full::new(bytes))
}

impl HttpHandler for RedirectHandler {
    async fn handle_request(&mut self, _ctx: &HttpContext, req: Request<Body>) -> RequestOrResponse {
        self.process_request(req)
    }

    async fn should_intercept(&mut self, _ctx: &HttpContext, req: &Request<Body>) -> bool {
        self.should_decrypt(req)
    }
}
