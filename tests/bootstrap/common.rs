//! Shared harness for cluster-free bootstrap tests.
//!
//! A tiny in-memory stand-in for the Kubernetes API server (plain HTTP, warp)
//! plus [`ControlPlane`] backends that hand out its address. Objects are
//! stored by request path; only the verbs the bootstrapper and validator use
//! are implemented.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;
use warp::http::{Method, StatusCode};
use warp::hyper::body::Bytes;
use warp::path::FullPath;
use warp::reply::Response;
use warp::{Filter, Reply};

use application_webhook::error::Result;
use application_webhook::testenv::control_plane::ControlPlane;

/// Collection names the fake answers list requests for.
const COLLECTIONS: &[&str] = &["applications", "namespaces", "validatingwebhookconfigurations"];

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("warn,application_webhook=debug"))
        .with_test_writer()
        .try_init();
}

// ═══════════════════════════════════════════════════════════════════════════════
// Fake API server
// ═══════════════════════════════════════════════════════════════════════════════

type Store = Arc<Mutex<BTreeMap<String, Value>>>;

pub struct FakeApiServer {
    pub addr: SocketAddr,
    store: Store,
    requests: Arc<Mutex<Vec<(Method, String)>>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl FakeApiServer {
    pub async fn start() -> Self {
        let store: Store = Arc::default();
        let requests: Arc<Mutex<Vec<(Method, String)>>> = Arc::default();

        let routes = {
            let store = store.clone();
            let requests = requests.clone();
            warp::method()
                .and(warp::path::full())
                .and(warp::body::bytes())
                .map(move |method: Method, path: FullPath, body: Bytes| {
                    let path = path.as_str().trim_end_matches('/').to_string();
                    requests.lock().unwrap().push((method.clone(), path.clone()));
                    handle(&store, method, &path, &body)
                })
        };

        let (tx, rx) = oneshot::channel::<()>();
        let (addr, server) =
            warp::serve(routes).bind_with_graceful_shutdown(([127, 0, 0, 1], 0), async {
                rx.await.ok();
            });
        tokio::spawn(server);

        Self {
            addr,
            store,
            requests,
            shutdown: Some(tx),
        }
    }

    /// Client config pointing at this server.
    pub fn config(&self) -> kube::Config {
        kube::Config::new(format!("http://{}", self.addr).parse().unwrap())
    }

    pub fn client(&self) -> kube::Client {
        kube::Client::try_from(self.config()).unwrap()
    }

    pub fn get(&self, path: &str) -> Option<Value> {
        self.store.lock().unwrap().get(path).cloned()
    }

    pub fn insert(&self, path: &str, object: Value) {
        self.store.lock().unwrap().insert(path.to_string(), object);
    }

    pub fn requests(&self) -> Vec<(Method, String)> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for FakeApiServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

fn handle(store: &Store, method: Method, path: &str, body: &[u8]) -> Response {
    let mut store = store.lock().unwrap();
    match method {
        Method::PATCH | Method::PUT => match serde_json::from_slice::<Value>(body) {
            Ok(object) => {
                store.insert(path.to_string(), object.clone());
                json_reply(&object, StatusCode::OK)
            }
            Err(e) => status_reply(StatusCode::BAD_REQUEST, &e.to_string()),
        },
        Method::POST => match serde_json::from_slice::<Value>(body) {
            Ok(object) => {
                let name = object
                    .pointer("/metadata/name")
                    .and_then(|n| n.as_str())
                    .unwrap_or_default();
                store.insert(format!("{path}/{name}"), object.clone());
                json_reply(&object, StatusCode::CREATED)
            }
            Err(e) => status_reply(StatusCode::BAD_REQUEST, &e.to_string()),
        },
        Method::GET => {
            if let Some(object) = store.get(path) {
                return json_reply(object, StatusCode::OK);
            }
            let is_collection = path
                .rsplit('/')
                .next()
                .is_some_and(|last| COLLECTIONS.contains(&last));
            if !is_collection {
                return status_reply(StatusCode::NOT_FOUND, "not found");
            }
            let prefix = format!("{path}/");
            let items: Vec<Value> = store
                .iter()
                .filter(|(key, _)| key.strip_prefix(&prefix).is_some_and(|rest| !rest.contains('/')))
                .map(|(_, v)| v.clone())
                .collect();
            json_reply(
                &json!({
                    "apiVersion": "v1",
                    "kind": "List",
                    "metadata": { "resourceVersion": "1" },
                    "items": items,
                }),
                StatusCode::OK,
            )
        }
        Method::DELETE => match store.remove(path) {
            Some(object) => json_reply(&object, StatusCode::OK),
            None => status_reply(StatusCode::NOT_FOUND, "not found"),
        },
        _ => status_reply(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
    }
}

fn json_reply(value: &Value, status: StatusCode) -> Response {
    warp::reply::with_status(warp::reply::json(value), status).into_response()
}

fn status_reply(status: StatusCode, message: &str) -> Response {
    let reason = if status == StatusCode::NOT_FOUND {
        "NotFound"
    } else {
        "BadRequest"
    };
    json_reply(
        &json!({
            "apiVersion": "v1",
            "kind": "Status",
            "metadata": {},
            "status": "Failure",
            "message": message,
            "reason": reason,
            "code": status.as_u16(),
        }),
        status,
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// Control planes
// ═══════════════════════════════════════════════════════════════════════════════

/// Start/stop counters shared between a [`FakeControlPlane`] and the test.
#[derive(Clone, Default)]
pub struct ControlPlaneCalls {
    pub starts: Arc<AtomicUsize>,
    pub stops: Arc<AtomicUsize>,
}

impl ControlPlaneCalls {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

/// Hands out the fake API server's config.
pub struct FakeControlPlane {
    config: kube::Config,
    calls: ControlPlaneCalls,
}

impl FakeControlPlane {
    pub fn new(api: &FakeApiServer) -> (Self, ControlPlaneCalls) {
        let calls = ControlPlaneCalls::default();
        let cp = Self {
            config: api.config(),
            calls: calls.clone(),
        };
        (cp, calls)
    }
}

#[async_trait::async_trait]
impl ControlPlane for FakeControlPlane {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn start(&mut self, _crds: &[CustomResourceDefinition], _flags: &[String]) -> Result<kube::Config> {
        self.calls.starts.fetch_add(1, Ordering::SeqCst);
        Ok(self.config.clone())
    }

    async fn stop(&mut self) -> Result<()> {
        self.calls.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Never finishes starting.
pub struct SlowControlPlane {
    calls: ControlPlaneCalls,
}

impl SlowControlPlane {
    pub fn new() -> (Self, ControlPlaneCalls) {
        let calls = ControlPlaneCalls::default();
        (Self { calls: calls.clone() }, calls)
    }
}

#[async_trait::async_trait]
impl ControlPlane for SlowControlPlane {
    fn name(&self) -> &'static str {
        "slow"
    }

    async fn start(&mut self, _crds: &[CustomResourceDefinition], _flags: &[String]) -> Result<kube::Config> {
        self.calls.starts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3600)).await;
        unreachable!("setup timeout should fire first")
    }

    async fn stop(&mut self) -> Result<()> {
        self.calls.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Fixtures
// ═══════════════════════════════════════════════════════════════════════════════

pub fn application_json(name: &str, ns: &str, app_label: &str) -> Value {
    json!({
        "apiVersion": "app.k8s.io/v1beta1",
        "kind": "Application",
        "metadata": { "name": name, "namespace": ns },
        "spec": {
            "selector": { "matchLabels": { "app": app_label } },
            "componentKinds": [{ "group": "apps", "kind": "Deployment" }]
        }
    })
}

pub fn application_path(ns: &str, name: &str) -> String {
    format!("/apis/app.k8s.io/v1beta1/namespaces/{ns}/applications/{name}")
}

/// An AdmissionReview for `operation` on `object`.
pub fn admission_review(uid: &str, operation: &str, object: Value) -> Value {
    let name = object.pointer("/metadata/name").cloned().unwrap_or(Value::Null);
    let ns = object
        .pointer("/metadata/namespace")
        .cloned()
        .unwrap_or(Value::Null);
    let mut request = json!({
        "uid": uid,
        "kind": { "group": "app.k8s.io", "version": "v1beta1", "kind": "Application" },
        "resource": { "group": "app.k8s.io", "version": "v1beta1", "resource": "applications" },
        "operation": operation,
        "userInfo": { "username": "tester" },
        "dryRun": false,
        "name": name,
        "namespace": ns,
    });
    if operation == "DELETE" {
        request["oldObject"] = object;
    } else {
        request["object"] = object;
    }
    json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": request,
    })
}
