//! Minimal mock apid service for client tests.
//!
//! Serves `/api/functions.json` from the registered function set and one
//! endpoint per mocked function, recording call history. HTTP handling is
//! deliberately small: one request per connection, `Connection: close`.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};

#[derive(Clone)]
struct MockFunction {
    cachable: u64,
    status: u16,
    body: String,
    delay: Option<Duration>,
}

#[derive(Default)]
struct State {
    functions: HashMap<String, MockFunction>,
    calls: Vec<(String, HashMap<String, String>)>,
}

pub struct MockApid {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
    accept_task: JoinHandle<()>,
}

impl MockApid {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(State::default()));

        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    let _ = handle(stream, state).await;
                });
            }
        });

        Self {
            addr,
            state,
            accept_task,
        }
    }

    /// `host:port` form suitable for `Client::new`.
    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    /// Registers `function` returning `result` wrapped as `{"result": ...}`
    /// with status 200.
    pub fn mock_function(&self, function: &str, cachable: u64, result: serde_json::Value) {
        self.mock_raw(
            function,
            cachable,
            200,
            serde_json::json!({ "result": result }).to_string(),
        );
    }

    /// Registers `function` answering with an arbitrary status and body.
    pub fn mock_raw(&self, function: &str, cachable: u64, status: u16, body: String) {
        self.state.lock().unwrap().functions.insert(
            function.to_string(),
            MockFunction {
                cachable,
                status,
                body,
                delay: None,
            },
        );
    }

    /// Adds a fixed delay before `function` responds.
    pub fn delay_function(&self, function: &str, delay: Duration) {
        if let Some(f) = self.state.lock().unwrap().functions.get_mut(function) {
            f.delay = Some(delay);
        }
    }

    pub fn call_count(&self, function: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(f, _)| f == function)
            .count()
    }

    pub fn last_args(&self, function: &str) -> Option<HashMap<String, String>> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .rev()
            .find(|(f, _)| f == function)
            .map(|(_, args)| args.clone())
    }

    /// Stops accepting connections; subsequent requests are refused.
    pub fn shutdown(&self) {
        self.accept_task.abort();
    }
}

impl Drop for MockApid {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn handle(mut stream: TcpStream, state: Arc<Mutex<State>>) -> std::io::Result<()> {
    let mut raw = Vec::new();
    let mut buf = [0u8; 1024];

    // Read the head, then as much body as content-length promises
    let (head_len, content_length) = loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        raw.extend_from_slice(&buf[..n]);
        if let Some(pos) = find_head_end(&raw) {
            let head = String::from_utf8_lossy(&raw[..pos]);
            let content_length = head
                .lines()
                .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(str::trim).map(String::from))
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(0);
            break (pos + 4, content_length);
        }
    };

    while raw.len() < head_len + content_length {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&buf[..n]);
    }

    let head = String::from_utf8_lossy(&raw[..head_len]).to_string();
    let path = head
        .lines()
        .next()
        .and_then(|l| l.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();
    let body = String::from_utf8_lossy(&raw[head_len..]).to_string();

    let (status, response_body, delay) = respond(&path, &body, &state);

    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    let reason = if status == 200 { "OK" } else { "Error" };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{response_body}",
        response_body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

fn respond(
    path: &str,
    body: &str,
    state: &Arc<Mutex<State>>,
) -> (u16, String, Option<Duration>) {
    let mut state = state.lock().unwrap();

    if path == "/api/functions.json" {
        let functions: serde_json::Map<String, serde_json::Value> = state
            .functions
            .iter()
            .map(|(name, f)| {
                (
                    name.clone(),
                    serde_json::json!({
                        "function": name,
                        "path": format!("/mock/{name}"),
                        "return": "result",
                        "params": {},
                        "cachable": f.cachable,
                    }),
                )
            })
            .collect();
        let body = serde_json::json!({ "functions": functions }).to_string();
        return (200, body, None);
    }

    if let Some(name) = path.strip_prefix("/mock/") {
        let name = name.to_string();
        if let Some(f) = state.functions.get(&name).cloned() {
            let args = parse_form(body);
            state.calls.push((name, args));
            return (f.status, f.body, f.delay);
        }
    }

    (404, String::from("{}"), None)
}

fn find_head_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_form(body: &str) -> HashMap<String, String> {
    body.split('&')
        .filter(|p| !p.is_empty())
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((percent_decode(k), percent_decode(v)))
        })
        .collect()
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("");
                if let Ok(b) = u8::from_str_radix(hex, 16) {
                    out.push(b);
                    i += 2;
                } else {
                    out.push(b'%');
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
