//! In-memory Kubernetes API server for unit tests.
//!
//! Serves `/version` plus GET, POST and PUT on any object path, enforcing
//! `resourceVersion` on replace the way the real API server does. Objects are
//! stored as JSON keyed by their request path.

use axum::http::{Method, Request, Response, StatusCode};
use kube::client::Body;
use kube::Client;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};

pub const NAMESPACE: &str = "secret-agent-system";

#[derive(Clone, Default)]
pub struct FakeApiServer {
    objects: Arc<Mutex<BTreeMap<String, Value>>>,
    next_version: Arc<Mutex<u64>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl FakeApiServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client whose default namespace is [`NAMESPACE`]
    pub fn client(&self) -> Client {
        let server = self.clone();
        let service = tower::service_fn(move |request: Request<Body>| {
            let server = server.clone();
            async move { Ok::<_, Infallible>(server.handle(request).await) }
        });
        Client::new(service, NAMESPACE)
    }

    pub fn get(&self, path: &str) -> Option<Value> {
        self.objects.lock().unwrap().get(path).cloned()
    }

    /// Store `object` at `path` as if another client wrote it
    pub fn put(&self, path: &str, mut object: Value) {
        object["metadata"]["resourceVersion"] = json!(self.bump());
        self.objects.lock().unwrap().insert(path.to_string(), object);
    }

    /// `METHOD path` of every request served so far
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    fn bump(&self) -> String {
        let mut version = self.next_version.lock().unwrap();
        *version += 1;
        version.to_string()
    }

    async fn handle(&self, request: Request<Body>) -> Response<Body> {
        let method = request.method().clone();
        let path = request.uri().path().to_string();
        self.requests.lock().unwrap().push(format!("{method} {path}"));
        let body: Value = match request.into_body().collect_bytes().await {
            Ok(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes).unwrap_or(Value::Null),
            _ => Value::Null,
        };

        if path == "/version" {
            return respond(StatusCode::OK, &version());
        }

        match method {
            Method::GET => match self.get(&path) {
                Some(object) => respond(StatusCode::OK, &object),
                None => status(StatusCode::NOT_FOUND, "NotFound"),
            },
            Method::POST => {
                let name = body["metadata"]["name"].as_str().unwrap_or_default();
                let key = format!("{path}/{name}");
                if self.get(&key).is_some() {
                    return status(StatusCode::CONFLICT, "AlreadyExists");
                }
                self.put(&key, body);
                respond(StatusCode::CREATED, &self.get(&key).unwrap())
            }
            Method::PUT => {
                let Some(current) = self.get(&path) else {
                    return status(StatusCode::NOT_FOUND, "NotFound");
                };
                let expected = &body["metadata"]["resourceVersion"];
                if !expected.is_null() && expected != &current["metadata"]["resourceVersion"] {
                    return status(StatusCode::CONFLICT, "Conflict");
                }
                self.put(&path, body);
                respond(StatusCode::OK, &self.get(&path).unwrap())
            }
            _ => status(StatusCode::METHOD_NOT_ALLOWED, "MethodNotAllowed"),
        }
    }
}

fn version() -> Value {
    json!({
        "major": "1",
        "minor": "30",
        "gitVersion": "v1.30.0",
        "gitCommit": "7c48c2bd72b9bf5c44d21d7338cc7bea77d0ad2a",
        "gitTreeState": "clean",
        "buildDate": "2024-04-17T17:27:03Z",
        "goVersion": "go1.22.2",
        "compiler": "gc",
        "platform": "linux/amd64"
    })
}

fn respond(code: StatusCode, value: &Value) -> Response<Body> {
    Response::builder()
        .status(code)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(value).unwrap()))
        .unwrap()
}

fn status(code: StatusCode, reason: &str) -> Response<Body> {
    respond(
        code,
        &json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": reason,
            "reason": reason,
            "code": code.as_u16()
        }),
    )
}
