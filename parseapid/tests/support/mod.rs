//! Test doubles for the daemon's collaborators: a mock apid service, a mock
//! webhook endpoint, and a line-oriented SMTP test client.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    task::JoinHandle,
    time::timeout,
};

/// Minimal one-request-per-connection HTTP server; the handler maps
/// `(path, body)` to `(status, response_body)`.
pub struct MockHttp {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl MockHttp {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&str, &str) -> (u16, String) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handler = Arc::new(handler);

        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let _ = serve_one(stream, handler.as_ref()).await;
                });
            }
        });

        Self { addr, task }
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for MockHttp {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_one<F>(mut stream: TcpStream, handler: &F) -> std::io::Result<()>
where
    F: Fn(&str, &str) -> (u16, String),
{
    let mut raw = Vec::new();
    let mut buf = [0u8; 1024];

    let (head_len, content_length) = loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        raw.extend_from_slice(&buf[..n]);
        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&raw[..pos]);
            let content_length = head
                .lines()
                .find_map(|l| {
                    l.to_ascii_lowercase()
                        .strip_prefix("content-length:")
                        .map(str::trim)
                        .map(String::from)
                })
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

    let (status, response_body) = handler(&path, &body);
    let reason = if status == 200 { "OK" } else { "Error" };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{response_body}",
        response_body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

pub fn parse_form(body: &str) -> HashMap<String, String> {
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

/// apid double: serves the manifest for `getParseHostSettings` and answers
/// it with a configurable status and result payload.
pub struct MockApid {
    http: MockHttp,
    state: Arc<Mutex<(u16, serde_json::Value)>>,
}

impl MockApid {
    pub async fn start(cachable: u64) -> Self {
        let state = Arc::new(Mutex::new((200, serde_json::json!({}))));
        let respond_state = Arc::clone(&state);

        let http = MockHttp::start(move |path, _body| {
            if path == "/api/functions.json" {
                let manifest = serde_json::json!({
                    "functions": {
                        "getParseHostSettings": {
                            "function": "getParseHostSettings",
                            "path": "/apid/getParseHostSettings",
                            "return": "result",
                            "params": {},
                            "cachable": cachable,
                        }
                    }
                });
                return (200, manifest.to_string());
            }

            let (status, result) = respond_state.lock().unwrap().clone();
            if status == 200 {
                (200, serde_json::json!({ "result": result }).to_string())
            } else {
                (
                    status,
                    serde_json::json!({"code": 0, "message": "mock failure", "traceback": "", "repro": ""})
                        .to_string(),
                )
            }
        })
        .await;

        Self { http, state }
    }

    pub fn addr(&self) -> String {
        self.http.addr()
    }

    pub fn set_settings(&self, user_id: i64, url: &str) {
        *self.state.lock().unwrap() = (
            200,
            serde_json::json!({"user_id": user_id, "url": url, "spam_check_outgoing": 0, "send_raw": 0}),
        );
    }

    pub fn set_no_settings(&self) {
        *self.state.lock().unwrap() = (200, serde_json::json!({}));
    }

    pub fn set_failure(&self, status: u16) {
        *self.state.lock().unwrap() = (status, serde_json::json!({}));
    }
}

/// Webhook double: records every decoded `email` field it is POSTed.
pub struct MockWebhook {
    http: MockHttp,
    state: Arc<Mutex<(u16, Vec<String>)>>,
}

impl MockWebhook {
    pub async fn start(status: u16) -> Self {
        let state = Arc::new(Mutex::new((status, Vec::new())));
        let respond_state = Arc::clone(&state);

        let http = MockHttp::start(move |_path, body| {
            let form = parse_form(body);
            let mut state = respond_state.lock().unwrap();
            state
                .1
                .push(form.get("email").cloned().unwrap_or_default());
            (state.0, String::from("ok"))
        })
        .await;

        Self { http, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}/post", self.http.addr())
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().unwrap().1.len()
    }

    pub fn emails(&self) -> Vec<String> {
        self.state.lock().unwrap().1.clone()
    }
}

/// Line-oriented SMTP test client.
pub struct SmtpClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl SmtpClient {
    pub async fn connect(addr: &str) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    pub async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    pub async fn read_reply(&mut self) -> String {
        let mut line = String::new();
        let n = timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for reply")
            .unwrap();
        assert!(n > 0, "connection closed while waiting for reply");
        line.trim_end().to_string()
    }

    pub async fn expect_code(&mut self, code: u16) -> String {
        let reply = self.read_reply().await;
        assert!(
            reply.starts_with(&format!("{code} ")),
            "expected {code}, got: {reply}"
        );
        reply
    }

    pub async fn expect_eof(&mut self) {
        let mut rest = Vec::new();
        let read = timeout(Duration::from_secs(5), self.reader.read_to_end(&mut rest)).await;
        assert!(read.is_ok(), "connection was not closed");
    }
}

/// Polls `cond` until it holds or `wait` elapses.
pub async fn wait_until(wait: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + wait;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    cond()
}
