//! HTTPS server hosting the admission handlers.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warp::filters::BoxedFilter;
use warp::http::StatusCode;
use warp::path::FullPath;
use warp::reply::Response;
use warp::{Filter, Reply};

use crate::certs::{TLS_CERT_NAME, TLS_KEY_NAME};
use crate::error::{Error, Result};

use super::AdmissionHandler;

/// The webhook HTTPS server: a bind address, a cert directory and a set of
/// admission handlers keyed by path. Also answers `/healthz` and `/readyz`.
pub struct WebhookServer {
    host: String,
    port: u16,
    cert_dir: PathBuf,
    handlers: BTreeMap<String, Arc<dyn AdmissionHandler>>,
}

impl WebhookServer {
    pub fn new(host: impl Into<String>, port: u16, cert_dir: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            port,
            cert_dir: cert_dir.into(),
            handlers: BTreeMap::new(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn cert_dir(&self) -> &Path {
        &self.cert_dir
    }

    pub fn set_cert_dir(&mut self, dir: impl Into<PathBuf>) {
        self.cert_dir = dir.into();
    }

    /// Register `handler` on `path`. A second registration on the same path
    /// replaces the first.
    pub fn register(&mut self, path: impl Into<String>, handler: Arc<dyn AdmissionHandler>) {
        let path = path.into();
        if self.handlers.insert(path.clone(), handler).is_some() {
            warn!(%path, "replacing existing webhook handler");
        } else {
            debug!(%path, "registered webhook handler");
        }
    }

    pub fn registered_paths(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    /// Resolve the bind address. The host must be an IP literal.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: std::net::IpAddr = self.host.parse().map_err(|e| {
            Error::config(format!("webhook host {:?} is not an IP address: {e}", self.host))
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// All routes: health probes plus one POST route per registered handler.
    pub fn routes(&self) -> BoxedFilter<(Response,)> {
        let mut routes = health_routes();
        for (path, handler) in &self.handlers {
            routes = routes
                .or(admission_route(path.clone(), handler.clone()))
                .unify()
                .boxed();
        }
        routes
    }

    /// Start serving on a background task until `cancel` fires.
    ///
    /// The returned [`ServingTask`] reports when the listener is bound (or
    /// why it could not be) and when the server has shut down.
    pub fn spawn(&self, cancel: CancellationToken) -> ServingTask {
        let routes = self.routes().with(warp::trace::request());
        let addr = self.socket_addr();
        let cert = self.cert_dir.join(TLS_CERT_NAME);
        let key = self.cert_dir.join(TLS_KEY_NAME);
        let (ready_tx, ready_rx) = oneshot::channel::<std::result::Result<SocketAddr, String>>();

        let handle = tokio::spawn(async move {
            let addr = match addr.and_then(|addr| preflight(addr, &cert, &key).map(|()| addr)) {
                Ok(addr) => addr,
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return Err(e);
                }
            };

            let shutdown = cancel.clone();
            let (bound, server) = warp::serve(routes)
                .tls()
                .cert_path(&cert)
                .key_path(&key)
                .bind_with_graceful_shutdown(addr, async move { shutdown.cancelled().await });

            info!(addr = %bound, "starting validating webhook server");
            let _ = ready_tx.send(Ok(bound));
            server.await;
            info!(addr = %bound, "webhook server stopped");
            Ok(())
        });

        ServingTask {
            ready: Some(ready_rx),
            addr: None,
            handle: Some(handle),
        }
    }
}

/// Check the things warp would otherwise panic on: missing key material and
/// an address that is already taken.
fn preflight(addr: SocketAddr, cert: &Path, key: &Path) -> Result<()> {
    for file in [cert, key] {
        if !file.is_file() {
            return Err(Error::server(format!(
                "missing serving certificate file {}",
                file.display()
            )));
        }
    }
    std::net::TcpListener::bind(addr)
        .map(drop)
        .map_err(|e| Error::server(format!("cannot bind webhook server to {addr}: {e}")))
}

/// Handle on the background serving task.
///
/// `ready()` resolves once the listener is bound; `stopped()` once the task
/// has exited. Both may be awaited more than once.
pub struct ServingTask {
    ready: Option<oneshot::Receiver<std::result::Result<SocketAddr, String>>>,
    addr: Option<SocketAddr>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl ServingTask {
    pub async fn ready(&mut self) -> Result<SocketAddr> {
        if let Some(addr) = self.addr {
            return Ok(addr);
        }
        let rx = self
            .ready
            .take()
            .ok_or_else(|| Error::server("webhook server failed to start"))?;
        match rx.await {
            Ok(Ok(addr)) => {
                self.addr = Some(addr);
                Ok(addr)
            }
            Ok(Err(msg)) => Err(Error::Server(msg)),
            Err(_) => Err(Error::server("webhook server exited before becoming ready")),
        }
    }

    pub async fn stopped(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        match handle.await {
            Ok(result) => result,
            Err(e) => Err(Error::server(format!("webhook server task failed: {e}"))),
        }
    }

    /// Bound address, once `ready()` has succeeded.
    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }
}

fn health_routes() -> BoxedFilter<(Response,)> {
    let healthz = warp::path("healthz")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| warp::reply::with_status("ok", StatusCode::OK).into_response());
    let readyz = warp::path("readyz")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| warp::reply::with_status("ok", StatusCode::OK).into_response());
    healthz.or(readyz).unify().boxed()
}

fn admission_route(path: String, handler: Arc<dyn AdmissionHandler>) -> BoxedFilter<(Response,)> {
    let path = Arc::new(path);
    warp::path::full()
        .and_then(move |full: FullPath| {
            let path = path.clone();
            async move {
                if full.as_str() == path.as_str() {
                    Ok(())
                } else {
                    Err(warp::reject::not_found())
                }
            }
        })
        .untuple_one()
        .and(warp::post())
        .and(warp::body::json())
        .and_then(move |review: AdmissionReview<DynamicObject>| {
            let handler = handler.clone();
            async move { Ok::<_, Infallible>(review_reply(handler.as_ref(), review).await) }
        })
        .boxed()
}

async fn review_reply(
    handler: &dyn AdmissionHandler,
    review: AdmissionReview<DynamicObject>,
) -> Response {
    let req: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            warn!(%e, "invalid admission request");
            let resp = AdmissionResponse::invalid(format!("invalid request: {e}"));
            return warp::reply::json(&resp.into_review()).into_response();
        }
    };
    let resp = handler.handle(&req).await;
    warp::reply::json(&resp.into_review()).into_response()
}
