//! HTTP front end for a [`SessionEngine`].
//!
//! Requests are handled one at a time on a single thread; the engine sits
//! behind a mutex so the CLI can share it.

use anyhow::{anyhow, Result};
use arena_session::{SessionEngine, SessionError};
use percent_encoding::percent_decode_str;
use serde::Serialize;
use serde_json::{json, Value};
use std::io::Read;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread;
use tiny_http::{Header, Method, Request, Response, Server};
use tracing::{debug, info, warn};

const MAX_BODY_BYTES: u64 = 1 << 20;

pub struct DriverServer {
    pub endpoint: String,
    server: Arc<Server>,
    server_thread: Option<thread::JoinHandle<()>>,
}

impl DriverServer {
    pub fn start(bind: &str, engine: Arc<Mutex<SessionEngine>>) -> Result<Self> {
        let listener = TcpListener::bind(bind)
            .map_err(|e| anyhow!("failed to bind driver server on {}: {}", bind, e))?;
        let addr = listener.local_addr()?;
        let server = Arc::new(
            Server::from_listener(listener, None).map_err(|e| anyhow!(e.to_string()))?,
        );
        let endpoint = format!("http://{}:{}", addr.ip(), addr.port());
        info!(endpoint = %endpoint, "driver server listening");

        let worker = server.clone();
        let handle = thread::spawn(move || {
            for request in worker.incoming_requests() {
                handle_request(&engine, request);
            }
        });

        Ok(Self {
            endpoint,
            server,
            server_thread: Some(handle),
        })
    }

    /// Blocks until the server thread exits. A panic on that thread has
    /// already dropped the engine and is reported as an error.
    pub fn wait(mut self) -> Result<()> {
        match self.server_thread.take().map(|handle| handle.join()) {
            Some(Err(_)) => Err(anyhow!("driver server thread panicked")),
            _ => Ok(()),
        }
    }

    pub fn stop(mut self) {
        self.server.unblock();
        if let Some(handle) = self.server_thread.take() {
            let _ = handle.join();
        }
    }
}

fn handle_request(engine: &Mutex<SessionEngine>, mut request: Request) {
    let method = request.method().clone();
    let url = request.url().to_string();
    let mut body = String::new();
    let read = request
        .as_reader()
        .take(MAX_BODY_BYTES)
        .read_to_string(&mut body);
    let (status, payload) = match read {
        Ok(_) => {
            let mut guard = engine.lock().unwrap_or_else(|e| e.into_inner());
            route(&mut guard, &method, &url, &body)
        }
        Err(err) => error_body(400, "bad_request", &format!("unreadable body: {}", err)),
    };
    debug!(method = %method, url = %url, status, "driver request");
    let mut response = Response::from_string(payload.to_string()).with_status_code(status);
    if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
        response = response.with_header(header);
    }
    if let Err(err) = request.respond(response) {
        warn!(url = %url, error = %err, "failed to write driver response");
    }
}

fn error_body(status: u16, code: &str, message: &str) -> (u16, Value) {
    (
        status,
        json!({"ok": false, "error": {"code": code, "message": message}}),
    )
}

fn session_error(err: &SessionError) -> (u16, Value) {
    let status = match err {
        SessionError::Registry(arena_session::RegistryError::NotFound(_)) => 404,
        SessionError::ResultsNotReady => 400,
        SessionError::SessionInProgress(_)
        | SessionError::NoActiveSession
        | SessionError::Aborted(_) => 409,
        SessionError::Registry(_) | SessionError::Collaborator { .. } => 500,
    };
    error_body(status, err.code(), &err.to_string())
}

fn ok_with<T: Serialize>(value: &T) -> (u16, Value) {
    match serde_json::to_value(value) {
        Ok(Value::Object(mut map)) => {
            map.insert("ok".to_string(), Value::Bool(true));
            (200, Value::Object(map))
        }
        Ok(other) => (200, json!({"ok": true, "value": other})),
        Err(err) => error_body(500, "serialize_failed", &err.to_string()),
    }
}

fn split_query(url: &str) -> (&str, Option<&str>) {
    match url.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (url, None),
    }
}

fn query_param<'a>(query: Option<&'a str>, name: &str) -> Option<&'a str> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

/// Percent-decodes one path segment or query value. Query values also map `+` to a space.
fn decode_component(raw: &str, form: bool) -> std::result::Result<String, (u16, Value)> {
    let raw = if form {
        raw.replace('+', " ")
    } else {
        raw.to_string()
    };
    percent_decode_str(&raw)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|e| error_body(400, "bad_request", &format!("'{}' is not valid UTF-8: {}", raw, e)))
}

fn parse_body(body: &str) -> std::result::Result<Value, (u16, Value)> {
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(body)
        .map_err(|e| error_body(400, "bad_request", &format!("body must be JSON: {}", e)))
}

/// Dispatches one request against the engine and returns the status and JSON body.
pub fn route(engine: &mut SessionEngine, method: &Method, url: &str, body: &str) -> (u16, Value) {
    let (path, query) = split_query(url);
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match (method, segments.as_slice()) {
        (Method::Post, ["start", problem_id]) if !problem_id.is_empty() => {
            let problem_id = match decode_component(problem_id, false) {
                Ok(id) => id,
                Err(resp) => return resp,
            };
            match engine.start_problem(&problem_id) {
                Ok(ack) => ok_with(&ack),
                Err(err) => session_error(&err),
            }
        }
        (Method::Post, ["submit"]) => {
            let body = match parse_body(body) {
                Ok(body) => body,
                Err(resp) => return resp,
            };
            let outcome = if let Some(action) = body.get("action").and_then(Value::as_str) {
                engine.submit(action)
            } else if let Some(solution) = body.get("solution") {
                engine.submit_solution(Some(solution.clone()).filter(|v| !v.is_null()))
            } else {
                return error_body(
                    400,
                    "bad_request",
                    "submit body must carry \"solution\" or \"action\"",
                );
            };
            match outcome {
                Ok(outcome) => ok_with(&outcome),
                Err(err) => session_error(&err),
            }
        }
        (Method::Get, ["status"]) => ok_with(&engine.status()),
        (Method::Get, ["results"]) => match engine.results() {
            Ok(results) => (200, json!({"ok": true, "results": results})),
            Err(err) => session_error(&err),
        },
        (Method::Get, ["report"]) => match engine.report() {
            Ok(report) => (200, json!({"ok": true, "report": report})),
            Err(err) => session_error(&err),
        },
        (Method::Get, ["problems"]) => {
            let filter = match query_param(query, "filter").map(|f| decode_component(f, true)) {
                Some(Err(resp)) => return resp,
                Some(Ok(filter)) => Some(filter),
                None => None,
            };
            let ids = engine.registry().ids(filter.as_deref());
            (200, json!({"ok": true, "problems": ids}))
        }
        (Method::Post, ["abort"]) => {
            let body = match parse_body(body) {
                Ok(body) => body,
                Err(resp) => return resp,
            };
            let reason = body
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("aborted by driver");
            match engine.abort(reason) {
                Ok(report) => (200, json!({"ok": true, "report": report})),
                Err(err) => session_error(&err),
            }
        }
        _ => error_body(404, "not_found", &format!("no route for {} {}", method, path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_session::{
        CatalogContext, CleanupRegistry, InterruptGate, ProblemCatalog, ProblemRegistry,
    };

    const CATALOG: &str = r#"
schema_version: problem_catalog_v1
problems:
  - id: misconfig_app
    namespace: hotel-reservation
    faulty_service: [geo]
    app:
      name: hotel-reservation
      deploy: ["true"]
    fault:
      inject: ["true"]
      recover: ["true"]
    oracles:
      localization: { kind: exact_set }
  - id: network_loss
    namespace: hotel-reservation
    faulty_service: [geo]
    app:
      name: hotel-reservation
      deploy: ["true"]
    fault:
      inject: ["true"]
      recover: ["true"]
"#;

    fn ignore_interrupt() {}

    macro_rules! engine {
        () => {{
            static GATE: InterruptGate = InterruptGate::new(ignore_interrupt);
            static REG: CleanupRegistry = CleanupRegistry::new();
            let catalog = ProblemCatalog::parse(CATALOG).expect("catalog");
            let registry =
                ProblemRegistry::from_catalog(&catalog, CatalogContext::default()).expect("registry");
            SessionEngine::new(Arc::new(registry)).with_guard_scope(&GATE, &REG)
        }};
    }

    #[test]
    fn full_protocol_over_routes() {
        let mut engine = engine!();
        let (status, body) = route(&mut engine, &Method::Post, "/start/misconfig_app", "");
        assert_eq!(status, 200);
        assert_eq!(body["stage"], json!("detection"));

        let (status, _) = route(&mut engine, &Method::Get, "/results", "");
        assert_eq!(status, 400);

        let (_, body) = route(&mut engine, &Method::Post, "/submit", r#"{"solution": "No"}"#);
        assert_eq!(body["status"], json!("accepted"));
        let (_, body) = route(&mut engine, &Method::Post, "/submit", r#"{"action": "submit(\"Yes\")"}"#);
        assert_eq!(body["stage"], json!("localization"));
        let (_, body) = route(&mut engine, &Method::Post, "/submit", r#"{"solution": ["geo"]}"#);
        assert_eq!(body["stage"], json!("done"));

        let (status, body) = route(&mut engine, &Method::Get, "/results", "");
        assert_eq!(status, 200);
        assert_eq!(body["results"]["Localization"]["success"], json!(true));
        assert!(body["results"]["TTL"].is_number());

        let (status, body) = route(&mut engine, &Method::Get, "/report", "");
        assert_eq!(status, 200);
        assert_eq!(body["report"]["outcome"], json!("done"));
    }

    #[test]
    fn errors_carry_code_and_status() {
        let mut engine = engine!();
        let (status, body) = route(&mut engine, &Method::Post, "/submit", r#"{"solution": "No"}"#);
        assert_eq!(status, 409);
        assert_eq!(body["ok"], json!(false));
        assert_eq!(body["error"]["code"], json!("no_active_session"));

        let (status, body) = route(&mut engine, &Method::Post, "/start/unknown", "");
        assert_eq!(status, 404);
        assert_eq!(body["error"]["code"], json!("problem_not_found"));

        route(&mut engine, &Method::Post, "/start/network_loss", "");
        let (status, body) = route(&mut engine, &Method::Post, "/start/network_loss", "");
        assert_eq!(status, 409);
        assert_eq!(body["error"]["code"], json!("session_in_progress"));

        let (status, _) = route(&mut engine, &Method::Post, "/submit", "{not json");
        assert_eq!(status, 400);
        let (status, _) = route(&mut engine, &Method::Post, "/submit", r#"{"answer": "No"}"#);
        assert_eq!(status, 400);
        let (status, _) = route(&mut engine, &Method::Delete, "/status", "");
        assert_eq!(status, 404);
    }

    #[test]
    fn problems_can_be_filtered() {
        let mut engine = engine!();
        let (_, body) = route(&mut engine, &Method::Get, "/problems", "");
        assert_eq!(body["problems"], json!(["misconfig_app", "network_loss"]));
        let (_, body) = route(&mut engine, &Method::Get, "/problems?filter=network", "");
        assert_eq!(body["problems"], json!(["network_loss"]));
        let (_, body) = route(&mut engine, &Method::Get, "/problems?filter=config%5Fapp", "");
        assert_eq!(body["problems"], json!(["misconfig_app"]));
        let (status, _) = route(&mut engine, &Method::Get, "/problems?filter=%FF", "");
        assert_eq!(status, 400);
    }

    #[test]
    fn problem_ids_are_percent_decoded() {
        let mut engine = engine!();
        let (status, body) = route(&mut engine, &Method::Post, "/start/network%5Floss", "");
        assert_eq!(status, 200);
        assert_eq!(body["problem_id"], json!("network_loss"));

        let mut engine = engine!();
        let (status, body) = route(&mut engine, &Method::Post, "/start/%C3%28", "");
        assert_eq!(status, 400);
        assert_eq!(body["error"]["code"], json!("bad_request"));
        let (status, body) = route(&mut engine, &Method::Post, "/start/misconfig%20app", "");
        assert_eq!(status, 404);
        assert!(body["error"]["message"]
            .as_str()
            .expect("message")
            .contains("misconfig app"));
    }

    #[test]
    fn abort_ends_the_session() {
        let mut engine = engine!();
        route(&mut engine, &Method::Post, "/start/network_loss", "");
        route(&mut engine, &Method::Post, "/submit", r#"{"solution": "No"}"#);
        let (status, body) = route(&mut engine, &Method::Post, "/abort", r#"{"reason": "timeout"}"#);
        assert_eq!(status, 200);
        assert_eq!(body["report"]["outcome"], json!("aborted"));
        assert_eq!(body["report"]["abort_reason"], json!("timeout"));

        let (status, body) = route(&mut engine, &Method::Get, "/status", "");
        assert_eq!(status, 200);
        assert_eq!(body["aborted"], json!(true));
        let (status, body) = route(&mut engine, &Method::Post, "/submit", r#"{"solution": "Yes"}"#);
        assert_eq!(status, 409);
        assert_eq!(body["error"]["code"], json!("session_aborted"));
    }

    #[test]
    fn serves_over_tcp() {
        use std::io::Write;
        use std::net::TcpStream;

        let engine = Arc::new(Mutex::new(engine!()));
        let server = DriverServer::start("127.0.0.1:0", engine).expect("start");
        let addr = server.endpoint.trim_start_matches("http://").to_string();
        let mut stream = TcpStream::connect(&addr).expect("connect");
        stream
            .write_all(b"GET /problems HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .expect("write");
        let mut response = String::new();
        stream.read_to_string(&mut response).expect("read");
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("network_loss"));
        server.stop();
    }

    fn send(addr: &str, method: &str, path: &str, body: &str) -> String {
        use std::io::Write;
        use std::net::TcpStream;

        let mut stream = TcpStream::connect(addr).expect("connect");
        let request = format!(
            "{} {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{}",
            method,
            path,
            body.len(),
            body
        );
        stream.write_all(request.as_bytes()).expect("write");
        let mut response = String::new();
        let _ = stream.read_to_string(&mut response);
        response
    }

    #[test]
    fn request_panic_drops_the_engine_and_recovers_the_fault() {
        use anyhow::Result;
        use arena_oracle::{EvalContext, Oracle, Verdict};
        use arena_session::{Application, OracleSet, Problem};
        use std::sync::atomic::{AtomicUsize, Ordering};

        static RECOVERS: AtomicUsize = AtomicUsize::new(0);
        static GATE: InterruptGate = InterruptGate::new(ignore_interrupt);
        static REG: CleanupRegistry = CleanupRegistry::new();

        struct Crashing;
        impl Oracle for Crashing {
            fn kind(&self) -> &'static str {
                "crashing"
            }
            fn evaluate(&self, _ctx: &EvalContext<'_>) -> Result<Verdict> {
                panic!("trace index out of range");
            }
        }

        struct Idle;
        impl Application for Idle {
            fn name(&self) -> &str {
                "idle"
            }
            fn deploy(&self) -> Result<()> {
                Ok(())
            }
            fn delete(&self) -> Result<()> {
                Ok(())
            }
            fn start_workload(&self) -> Result<()> {
                Ok(())
            }
            fn cleanup(&self) -> Result<()> {
                Ok(())
            }
        }

        struct Fragile {
            app: Idle,
            services: Vec<String>,
            oracles: OracleSet,
        }
        impl Problem for Fragile {
            fn id(&self) -> &str {
                "fragile"
            }
            fn app(&self) -> &dyn Application {
                &self.app
            }
            fn faulty_service(&self) -> &[String] {
                &self.services
            }
            fn oracles(&self) -> &OracleSet {
                &self.oracles
            }
            fn inject_fault(&self) -> Result<()> {
                Ok(())
            }
            fn recover_fault(&self) -> Result<()> {
                RECOVERS.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let mut registry = ProblemRegistry::new();
        registry
            .register(
                "fragile",
                Box::new(|| {
                    Ok(Arc::new(Fragile {
                        app: Idle,
                        services: vec!["geo".to_string()],
                        oracles: OracleSet::default().with_localization(Box::new(Crashing)),
                    }) as Arc<dyn Problem>)
                }),
            )
            .expect("register");
        let engine = SessionEngine::new(Arc::new(registry)).with_guard_scope(&GATE, &REG);
        let server = DriverServer::start("127.0.0.1:0", Arc::new(Mutex::new(engine))).expect("start");
        let addr = server.endpoint.trim_start_matches("http://").to_string();

        assert!(send(&addr, "POST", "/start/fragile", "").starts_with("HTTP/1.1 200"));
        assert!(send(&addr, "POST", "/submit", r#"{"solution": "No"}"#).starts_with("HTTP/1.1 200"));
        assert!(send(&addr, "POST", "/submit", r#"{"solution": "Yes"}"#).contains("localization"));
        assert_eq!(RECOVERS.load(Ordering::SeqCst), 0);
        assert_eq!(REG.len(), 1);

        send(&addr, "POST", "/submit", r#"{"solution": ["geo"]}"#);
        assert!(server.wait().is_err());
        assert_eq!(RECOVERS.load(Ordering::SeqCst), 1);
        assert!(REG.is_empty());
    }
}
