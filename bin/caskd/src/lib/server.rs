// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The daemon's websocket endpoint.
//!
//! Migration channels attach through
//! `GET /1.0/operations/{id}/websocket?secret=<hex>`. The handler
//! validates the secret against the addressed operation before agreeing
//! to the protocol upgrade, so a bad secret is refused with a plain HTTP
//! error and the operation keeps waiting. The wider REST API (container
//! CRUD, the operations listing itself) lives a layer above this crate;
//! only the upgrade path is needed here.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hyper::header::{self, HeaderValue};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use slog::{debug, info, o, Logger};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::migrate::MigrateError;
use crate::ops::Operations;

/// Shared state for the daemon's HTTP endpoints.
pub struct DaemonContext {
    pub log: Logger,
    pub ops: Operations,
    exec_path: PathBuf,
    base_url: String,
}

impl DaemonContext {
    /// `exec_path` is the binary re-executed by action scripts;
    /// `base_url` is this daemon's externally reachable address, e.g.
    /// `https://host:8443`.
    pub fn new(log: Logger, exec_path: PathBuf, base_url: String) -> DaemonContext {
        DaemonContext { log, ops: Operations::new(), exec_path, base_url }
    }

    pub fn exec_path(&self) -> &Path {
        &self.exec_path
    }

    /// The URL an operation is addressable under, on any cluster member
    /// that can route to this daemon.
    pub fn operation_url(&self, id: &Uuid) -> String {
        format!("{}/1.0/operations/{}", self.base_url.trim_end_matches('/'), id)
    }
}

/// Serves the websocket endpoint on an already-bound listener,
/// returning the local address and the serve future. Binding first lets
/// the caller learn an ephemeral port before advertising operation URLs.
pub fn make_server(
    ctx: Arc<DaemonContext>,
    listener: std::net::TcpListener,
) -> Result<(SocketAddr, impl Future<Output = Result<(), hyper::Error>>), std::io::Error> {
    listener.set_nonblocking(true)?;
    let local_addr = listener.local_addr()?;

    let make_svc = make_service_fn(move |_conn| {
        let ctx = Arc::clone(&ctx);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let ctx = Arc::clone(&ctx);
                async move { Ok::<_, Infallible>(handle(ctx, req).await) }
            }))
        }
    });

    let server = Server::from_tcp(listener).map_err(std::io::Error::other)?.serve(make_svc);
    Ok((local_addr, server))
}

/// Runs the websocket endpoint until the process exits.
pub async fn serve(ctx: Arc<DaemonContext>, addr: SocketAddr) -> Result<(), std::io::Error> {
    let listener = std::net::TcpListener::bind(addr)?;
    let (local_addr, server) = make_server(Arc::clone(&ctx), listener)?;
    info!(ctx.log, "listening"; "addr" => %local_addr);
    server.await.map_err(std::io::Error::other)
}

async fn handle(ctx: Arc<DaemonContext>, req: Request<Body>) -> Response<Body> {
    match route_websocket(&req) {
        Some(id) => upgrade_websocket(ctx, req, id).await,
        None => plain_error(StatusCode::NOT_FOUND, "not found"),
    }
}

/// Matches `GET /1.0/operations/{id}/websocket`.
fn route_websocket(req: &Request<Body>) -> Option<Uuid> {
    if req.method() != Method::GET {
        return None;
    }
    let mut parts = req.uri().path().trim_matches('/').split('/');
    match (parts.next(), parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some("1.0"), Some("operations"), Some(id), Some("websocket"), None) => {
            Uuid::parse_str(id).ok()
        }
        _ => None,
    }
}

fn query_param<'a>(req: &'a Request<Body>, name: &str) -> Option<&'a str> {
    req.uri().query()?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == name).then_some(v)
    })
}

async fn upgrade_websocket(
    ctx: Arc<DaemonContext>,
    mut req: Request<Body>,
    id: Uuid,
) -> Response<Body> {
    let log = ctx.log.new(o!("operation" => id.to_string()));

    // 404 only when the operation itself is unknown; a bad secret on a
    // real operation is 403.
    let op = match ctx.ops.get(&id) {
        Some(op) => op,
        None => return plain_error(StatusCode::NOT_FOUND, "operation not found"),
    };

    let secret = match query_param(&req, "secret") {
        Some(secret) => secret.to_string(),
        None => {
            return plain_error(
                StatusCode::BAD_REQUEST,
                &MigrateError::MissingSecret.to_string(),
            )
        }
    };

    if let Err(e) = op.check_secret(&secret) {
        debug!(log, "refusing websocket connection"; "err" => %e);
        return plain_error(error_status(&e), &e.to_string());
    }

    // Check this is a valid upgrade request and compute the accept key.
    let connection_upgrade = req
        .headers()
        .get(header::CONNECTION)
        .and_then(|hv| hv.to_str().ok())
        .map(|hv| hv.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    if !connection_upgrade {
        return plain_error(StatusCode::BAD_REQUEST, "expected connection upgrade");
    }
    let websocket_upgrade = req
        .headers()
        .get(header::UPGRADE)
        .and_then(|hv| hv.to_str().ok())
        .map(|hv| hv.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    if !websocket_upgrade {
        return plain_error(StatusCode::BAD_REQUEST, "expected websocket upgrade");
    }
    let accept = match req.headers().get(header::SEC_WEBSOCKET_KEY) {
        Some(key) => derive_accept_key(key.as_bytes()),
        None => return plain_error(StatusCode::BAD_REQUEST, "missing websocket key"),
    };

    // Grab the upgraded socket once the 101 goes out and hand it to the
    // operation.
    tokio::spawn(async move {
        match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => {
                let ws = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
                if let Err(e) = op.connect(&secret, ws) {
                    debug!(log, "websocket connect rejected"; "err" => %e);
                }
            }
            Err(e) => {
                debug!(log, "websocket upgrade failed"; "err" => %e);
            }
        }
    });

    let mut resp = Response::new(Body::empty());
    *resp.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    resp.headers_mut().insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    resp.headers_mut().insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    if let Ok(value) = HeaderValue::from_str(&accept) {
        resp.headers_mut().insert(header::SEC_WEBSOCKET_ACCEPT, value);
    }
    resp
}

fn error_status(e: &MigrateError) -> StatusCode {
    match e {
        MigrateError::Permission => StatusCode::FORBIDDEN,
        MigrateError::MissingSecret => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn plain_error(status: StatusCode, msg: &str) -> Response<Body> {
    let mut resp = Response::new(Body::from(msg.to_string()));
    *resp.status_mut() = status;
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &str) -> Request<Body> {
        Request::builder().method(Method::GET).uri(path).body(Body::empty()).unwrap()
    }

    #[test]
    fn routes_operation_websockets() {
        let id = Uuid::new_v4();
        let path = format!("/1.0/operations/{id}/websocket?secret=abc");
        assert_eq!(route_websocket(&request(&path)), Some(id));

        assert_eq!(route_websocket(&request("/1.0/operations")), None);
        assert_eq!(route_websocket(&request("/1.0/operations/nope/websocket")), None);
        assert_eq!(
            route_websocket(&request(&format!("/1.0/operations/{id}/exec"))),
            None
        );
    }

    #[test]
    fn extracts_query_params() {
        let req = request("/x?secret=abc&other=1");
        assert_eq!(query_param(&req, "secret"), Some("abc"));
        assert_eq!(query_param(&req, "other"), Some("1"));
        assert_eq!(query_param(&req, "missing"), None);
    }
}
