//! In-process fakes shared by the unit tests

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use sha1::{Digest, Sha1};

use crate::agent::LocalEndpoint;
use crate::directory::{DirectoryTransport, HttpResponse};
use crate::tunnel::{OnEstablished, TunnelConnector, TunnelError, TunnelParameters, TunnelSession};

/// A request the fake directory received
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: &'static str,
    pub path: String,
    pub params: Vec<(String, String)>,
}

impl RecordedRequest {
    pub fn param(&self, name: &str) -> Option<String> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
    }
}

struct DirectoryState {
    license_key: String,
    port: u16,
    node_name: Option<String>,
    public_key: Option<String>,
    smtp: Value,
    limits: Value,
    failures: HashMap<String, u16>,
    bodies: HashMap<String, String>,
    offline: bool,
    requests: Vec<RecordedRequest>,
}

/// Directory that answers like the real service, from in-memory state
pub struct FakeDirectory {
    state: Mutex<DirectoryState>,
}

impl FakeDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(DirectoryState {
                license_key: "datlicense".to_string(),
                port: 1234,
                node_name: Some("thename".to_string()),
                public_key: None,
                smtp: json!({}),
                limits: json!({}),
                failures: HashMap::new(),
                bodies: HashMap::new(),
                offline: false,
                requests: Vec::new(),
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DirectoryState> {
        self.state.lock().unwrap()
    }

    /// Answer every request to `path` with `status`
    pub fn fail(&self, path: &str, status: u16) {
        self.lock().failures.insert(path.to_string(), status);
    }

    pub fn recover(&self, path: &str) {
        self.lock().failures.remove(path);
    }

    /// Answer `path` with 200 and a fixed body
    pub fn override_body(&self, path: &str, body: &str) {
        self.lock().bodies.insert(path.to_string(), body.to_string());
    }

    /// Every request fails without a response
    pub fn go_offline(&self) {
        self.lock().offline = true;
    }

    pub fn set_node_name(&self, name: Option<&str>) {
        self.lock().node_name = name.map(str::to_string);
    }

    pub fn set_smtp(&self, smtp: Value) {
        self.lock().smtp = smtp;
    }

    pub fn set_limits(&self, limits: Value) {
        self.lock().limits = limits;
    }

    /// Pretend `public_key` was registered earlier
    pub fn register_key(&self, public_key: &str) {
        self.lock().public_key = Some(public_key.to_string());
    }

    pub fn registered_key(&self) -> Option<String> {
        self.lock().public_key.clone()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.lock().requests.clone()
    }

    pub fn calls(&self, path: &str) -> usize {
        self.lock().requests.iter().filter(|r| r.path == path).count()
    }

    pub fn total_calls(&self) -> usize {
        self.lock().requests.len()
    }

    fn handle(
        &self,
        method: &'static str,
        path: &str,
        params: &[(&str, String)],
    ) -> anyhow::Result<HttpResponse> {
        let mut state = self.lock();
        let request = RecordedRequest {
            method,
            path: path.to_string(),
            params: params
                .iter()
                .map(|(key, value)| (key.to_string(), value.clone()))
                .collect(),
        };
        state.requests.push(request.clone());

        if state.offline {
            anyhow::bail!("connection refused");
        }
        if let Some(status) = state.failures.get(path) {
            return Ok(HttpResponse::new(*status, ""));
        }
        if let Some(body) = state.bodies.get(path) {
            return Ok(HttpResponse::new(200, body.clone()));
        }

        let body = match (method, path) {
            ("GET", "/create_license") => json!({ "license_key": state.license_key }),
            ("GET", "/info") => json!({
                "port": state.port,
                "pubkey_sha1": state.public_key.as_deref().map(sha1_hex),
                "node_name": state.node_name,
            }),
            ("GET", "/smtp_config") => state.smtp.clone(),
            ("GET", "/limits") => state.limits.clone(),
            ("POST", "/set_node_name") => {
                state.node_name = request.param("node_name");
                json!({})
            }
            ("POST", "/set_public_key") => {
                state.public_key = request.param("public_key");
                json!({})
            }
            ("POST", "/set_version") | ("POST", "/usage") => json!({}),
            _ => return Ok(HttpResponse::new(404, "")),
        };

        Ok(HttpResponse::new(200, body.to_string()))
    }
}

fn sha1_hex(value: &str) -> String {
    hex::encode(Sha1::digest(value.as_bytes()))
}

#[async_trait]
impl DirectoryTransport for FakeDirectory {
    async fn get(&self, path: &str, query: &[(&str, String)]) -> anyhow::Result<HttpResponse> {
        self.handle("GET", path, query)
    }

    async fn post_form(&self, path: &str, form: &[(&str, String)]) -> anyhow::Result<HttpResponse> {
        self.handle("POST", path, form)
    }
}

/// Local endpoint that refuses a fixed number of times, then accepts
pub struct FlakyEndpoint {
    refusals: AtomicUsize,
    pub checks: AtomicUsize,
}

impl FlakyEndpoint {
    pub fn new(refusals: usize) -> Arc<Self> {
        Arc::new(Self {
            refusals: AtomicUsize::new(refusals),
            checks: AtomicUsize::new(0),
        })
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocalEndpoint for FlakyEndpoint {
    async fn check(&self) -> std::io::Result<()> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        let remaining = self.refusals.load(Ordering::SeqCst);
        if remaining > 0 {
            self.refusals.store(remaining - 1, Ordering::SeqCst);
            return Err(std::io::ErrorKind::ConnectionRefused.into());
        }
        Ok(())
    }
}

/// What a scripted session does when started
#[derive(Debug, Clone)]
pub enum SessionScript {
    /// Authentication rejected by the proxy
    RejectAuth,
    /// Transport failure before the forward is up
    TransportFailure,
    /// Non-tunnel failure inside the session
    Unexpected,
    /// Forward comes up, then the connection drops
    EstablishThenDrop,
    /// Forward comes up and stays until stopped
    EstablishThenWait,
}

/// Connector that hands out sessions following a script, one entry per session
pub struct ScriptedConnector {
    script: Mutex<VecDeque<SessionScript>>,
    pub built: Mutex<Vec<TunnelParameters>>,
}

impl ScriptedConnector {
    pub fn new(script: impl IntoIterator<Item = SessionScript>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            built: Mutex::new(Vec::new()),
        })
    }

    pub fn sessions(&self) -> usize {
        self.built.lock().unwrap().len()
    }

    pub fn parameters(&self) -> Vec<TunnelParameters> {
        self.built.lock().unwrap().clone()
    }
}

impl TunnelConnector for ScriptedConnector {
    fn connect(&self, params: TunnelParameters) -> Result<Arc<dyn TunnelSession>, TunnelError> {
        self.built.lock().unwrap().push(params);
        let script = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SessionScript::EstablishThenWait);
        Ok(Arc::new(ScriptedSession {
            script,
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            wake: tokio::sync::Notify::new(),
        }))
    }
}

struct ScriptedSession {
    script: SessionScript,
    running: AtomicBool,
    stopped: AtomicBool,
    wake: tokio::sync::Notify,
}

#[async_trait]
impl TunnelSession for ScriptedSession {
    async fn start(&self, on_established: OnEstablished) -> Result<(), TunnelError> {
        match self.script {
            SessionScript::RejectAuth => Err(TunnelError::AuthenticationFailed),
            SessionScript::TransportFailure => {
                Err(TunnelError::Transport(anyhow::anyhow!("connection reset")))
            }
            SessionScript::Unexpected => {
                Err(TunnelError::InvalidKey(russh_keys::Error::CouldNotReadKey))
            }
            SessionScript::EstablishThenDrop => {
                self.running.store(true, Ordering::SeqCst);
                on_established();
                Ok(())
            }
            SessionScript::EstablishThenWait => {
                self.running.store(true, Ordering::SeqCst);
                on_established();
                while !self.stopped.load(Ordering::SeqCst) {
                    self.wake.notified().await;
                }
                Ok(())
            }
        }
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
