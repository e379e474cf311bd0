//! HTTP handlers mounted on the plain and TLS listeners.
//!
//! Handlers compose: the static-mode plain listener runs
//! `[IpRecordingHandler] -> RedirectHandler -> AppHandler`, the TLS listener
//! `[IpRecordingHandler] -> AppHandler`, and in ACME mode the plain listener
//! runs [`AcmeHttpHandler`] alone.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST, LOCATION};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use tracing::{debug, trace};

use certgate_config::{Setting, SettingsProvider};

use crate::acme::ChallengeManager;

pub type HttpResponse = Response<Full<Bytes>>;

#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, req: Request<Incoming>) -> HttpResponse;
}

/// Receives client IP literals seen in `Host` headers.
#[async_trait]
pub trait IpRecorder: Send + Sync {
    async fn record_ip(&self, ip: IpAddr);
}

pub(crate) fn text_response(status: StatusCode, body: impl Into<Bytes>) -> HttpResponse {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn redirect_response(location: &str) -> HttpResponse {
    match HeaderValue::from_str(location) {
        Ok(value) => {
            let mut response = text_response(StatusCode::FOUND, Bytes::new());
            response.headers_mut().insert(LOCATION, value);
            response
        }
        Err(_) => text_response(StatusCode::BAD_REQUEST, "Invalid host\n"),
    }
}

/// The request's host, from `Host` or the URI authority (HTTP/2)
pub fn request_host<B>(req: &Request<B>) -> Option<&str> {
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
        .filter(|h| !h.is_empty())
}

/// Split `host[:port]`, accepting bracketed IPv6 literals.
pub fn split_host_port(host: &str) -> (&str, Option<&str>) {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => (&host[..=end], host[end + 1..].strip_prefix(':')),
            None => (host, None),
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') => (name, Some(port)),
        _ => (host, None),
    }
}

/// Map an HTTP port to the HTTPS port of the same thousand range:
/// `(port / 1000) * 1000 + 443`. Hosts without a numeric port are kept.
pub fn mangle_port(host: &str) -> String {
    let (name, port) = split_host_port(host);
    match port.and_then(|p| p.parse::<u32>().ok()) {
        Some(port) => format!("{}:{}", name, port / 1000 * 1000 + 443),
        None => host.to_string(),
    }
}

/// The IP literal in the request's host, if it is one
pub fn host_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    let (name, _) = split_host_port(request_host(req)?);
    name.trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .ok()
}

fn path_and_query<B>(req: &Request<B>) -> &str {
    req.uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
}

fn is_get_or_head<B>(req: &Request<B>) -> bool {
    req.method() == Method::GET || req.method() == Method::HEAD
}

/// Probe endpoints, health checks and the CA bundle.
pub struct AppHandler {
    settings: Arc<dyn SettingsProvider>,
}

impl AppHandler {
    pub fn new(settings: Arc<dyn SettingsProvider>) -> Self {
        Self { settings }
    }

    pub fn respond<B>(&self, req: &Request<B>) -> HttpResponse {
        match req.uri().path() {
            "/ping" => text_response(StatusCode::OK, "pong"),
            "/healthz" => text_response(StatusCode::OK, "ok"),
            "/cacerts" => text_response(StatusCode::OK, self.settings.value(Setting::CaCerts)),
            _ => text_response(StatusCode::NOT_FOUND, "404 page not found\n"),
        }
    }
}

#[async_trait]
impl RequestHandler for AppHandler {
    async fn handle(&self, req: Request<Incoming>) -> HttpResponse {
        self.respond(&req)
    }
}

/// Sends plain-HTTP clients to HTTPS.
pub struct RedirectHandler {
    next: Arc<dyn RequestHandler>,
}

impl RedirectHandler {
    pub fn new(next: Arc<dyn RequestHandler>) -> Self {
        Self { next }
    }

    /// `None` when the request goes to the next handler unchanged.
    pub fn redirect<B>(req: &Request<B>) -> Option<HttpResponse> {
        let path = req.uri().path();
        if path.starts_with("/ping") || path.starts_with("/healthz") {
            return None;
        }
        let forwarded_https = req
            .headers()
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|proto| proto.eq_ignore_ascii_case("https"));
        if forwarded_https {
            return None;
        }

        if !is_get_or_head(req) {
            return Some(text_response(StatusCode::BAD_REQUEST, "Use HTTPS\n"));
        }

        let host = mangle_port(request_host(req).unwrap_or_default());
        let location = format!("https://{}{}", host, path_and_query(req));
        trace!(location = %location, "Redirecting to HTTPS");
        Some(redirect_response(&location))
    }
}

#[async_trait]
impl RequestHandler for RedirectHandler {
    async fn handle(&self, req: Request<Incoming>) -> HttpResponse {
        match Self::redirect(&req) {
            Some(response) => response,
            None => self.next.handle(req).await,
        }
    }
}

/// Records IP literals from `Host` before delegating.
pub struct IpRecordingHandler {
    recorder: Arc<dyn IpRecorder>,
    next: Arc<dyn RequestHandler>,
}

impl IpRecordingHandler {
    pub fn new(recorder: Arc<dyn IpRecorder>, next: Arc<dyn RequestHandler>) -> Self {
        Self { recorder, next }
    }
}

#[async_trait]
impl RequestHandler for IpRecordingHandler {
    async fn handle(&self, req: Request<Incoming>) -> HttpResponse {
        if let Some(ip) = host_ip(&req) {
            self.recorder.record_ip(ip).await;
        }
        self.next.handle(req).await
    }
}

/// Plain-port handler in ACME mode: answers HTTP-01 challenges and sends
/// everything else to HTTPS on the default port.
pub struct AcmeHttpHandler {
    challenges: ChallengeManager,
}

impl AcmeHttpHandler {
    pub fn new(challenges: ChallengeManager) -> Self {
        Self { challenges }
    }

    pub fn respond<B>(&self, req: &Request<B>) -> HttpResponse {
        let path = req.uri().path();
        if ChallengeManager::extract_token(path).is_some() {
            return match self.challenges.respond(path) {
                Some(key_authorization) => {
                    debug!(path = %path, "Answered HTTP-01 challenge");
                    text_response(StatusCode::OK, key_authorization)
                }
                None => text_response(StatusCode::NOT_FOUND, "404 page not found\n"),
            };
        }

        if !is_get_or_head(req) {
            return text_response(StatusCode::BAD_REQUEST, "Use HTTPS\n");
        }
        let (host, _) = split_host_port(request_host(req).unwrap_or_default());
        redirect_response(&format!("https://{}{}", host, path_and_query(req)))
    }
}

#[async_trait]
impl RequestHandler for AcmeHttpHandler {
    async fn handle(&self, req: Request<Incoming>) -> HttpResponse {
        self.respond(&req)
    }
}
