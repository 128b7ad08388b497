use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::{de::DeserializeOwned, Deserialize};
use serde_json::value::RawValue;
use thiserror::Error;
use tokio::sync::watch;

use parseapid_cache::MemoryCache;
use parseapid_common::internal;

use crate::types::{ApidError, ParseHostSettings, User};

const MANIFEST_ATTEMPTS: u32 = 5;
const MANIFEST_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Per-function routing data served by `/api/functions.json`. Loaded once at
/// client construction and immutable afterwards.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FunctionMetadata {
    pub function: String,
    pub path: String,
    #[serde(rename = "return")]
    pub result_key: String,
    pub params: HashMap<String, String>,
    pub cachable: u64,
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to load functions from {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("functions manifest returned status {0}")]
    Status(u16),

    #[error("error decoding functions.json: {0}")]
    Decode(#[from] reqwest::Error),

    #[error("no functions found in manifest")]
    NoFunctions,
}

/// Argument map for an apid call. Ordered so that the request fingerprint
/// used for caching and piggybacking is deterministic.
#[derive(Debug, Clone, Default)]
pub struct Args(BTreeMap<String, ArgValue>);

#[derive(Debug, Clone)]
pub enum ArgValue {
    Int(i64),
    Str(String),
}

impl From<i64> for ArgValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for ArgValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Str(v) => f.write_str(v),
        }
    }
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn set(mut self, key: &str, value: impl Into<ArgValue>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    fn form_pairs(&self) -> Vec<(String, String)> {
        self.0
            .iter()
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect()
    }
}

impl fmt::Display for Args {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            write!(f, "{k}:{v}")?;
        }
        Ok(())
    }
}

fn request_key(function: &str, args: &Args) -> String {
    format!("{function}({args})")
}

type PendingMap = Arc<Mutex<HashMap<String, watch::Receiver<()>>>>;

/// Releases the in-flight marker for one request key. The map entry is
/// removed before the watch sender drops, so by the time waiters wake the
/// cache write (if any) is already visible.
struct InFlight {
    key: String,
    pending: PendingMap,
    _tx: watch::Sender<()>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.pending.lock().unwrap().remove(&self.key);
    }
}

enum Role {
    /// This call owns the upstream request for its key.
    Owner(Option<InFlight>),
    /// Another call is already in flight for the same key.
    Waiter(watch::Receiver<()>),
}

/// Typed client for the apid metadata service.
///
/// Calls whose function manifest marks them cachable are response-cached for
/// the advertised TTL, and concurrent identical calls piggyback on a single
/// upstream request: the first caller performs the POST and populates the
/// cache, the rest wait and read the cache.
pub struct Client {
    addr: String,
    http: reqwest::Client,
    functions: HashMap<String, FunctionMetadata>,
    cache: MemoryCache,
    pending: PendingMap,
}

impl Client {
    /// Loads the function manifest from `addr` (`host[:port]`) and returns a
    /// ready client. Manifest retrieval is retried a bounded number of times
    /// with a fixed delay; exhausting the retries is fatal.
    pub async fn new(addr: impl Into<String>, cache: MemoryCache) -> Result<Self, ManifestError> {
        let addr = addr.into();
        let http = reqwest::Client::new();
        let functions = Self::load_functions(&http, &addr).await?;

        internal!(level = DEBUG, "Loaded {} apid functions", functions.len());

        Ok(Self {
            addr,
            http,
            functions,
            cache,
            pending: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn load_functions(
        http: &reqwest::Client,
        addr: &str,
    ) -> Result<HashMap<String, FunctionMetadata>, ManifestError> {
        let url = format!("http://{addr}/api/functions.json");

        let mut attempt = 0;
        let rsp = loop {
            attempt += 1;
            match http.get(&url).send().await {
                Ok(rsp) if rsp.status() == reqwest::StatusCode::OK => break rsp,
                Ok(rsp) if attempt >= MANIFEST_ATTEMPTS => {
                    return Err(ManifestError::Status(rsp.status().as_u16()));
                }
                Err(err) if attempt >= MANIFEST_ATTEMPTS => {
                    return Err(ManifestError::Fetch { url, source: err });
                }
                Ok(rsp) => {
                    internal!(
                        level = DEBUG,
                        "functions.json returned status {}, retrying in {:?}",
                        rsp.status(),
                        MANIFEST_RETRY_DELAY
                    );
                }
                Err(err) => {
                    internal!(
                        level = DEBUG,
                        "Error while fetching functions.json: {err}, retrying in {:?}",
                        MANIFEST_RETRY_DELAY
                    );
                }
            }
            tokio::time::sleep(MANIFEST_RETRY_DELAY).await;
        };

        let mut wrapper: HashMap<String, HashMap<String, FunctionMetadata>> =
            rsp.json().await.map_err(ManifestError::Decode)?;

        wrapper
            .remove("functions")
            .ok_or(ManifestError::NoFunctions)
    }

    /// Calls `function` with `args` and returns the raw JSON bytes found
    /// under the function's result key.
    pub async fn call(&self, function: &str, args: &Args) -> Result<Vec<u8>, ApidError> {
        let meta = self.functions.get(function).ok_or_else(|| {
            ApidError::new(597, format!("function '{function}' does not exist"))
        })?;
        let key = request_key(function, args);
        let cacheable = meta.cachable > 0;

        if cacheable {
            match self.join_or_register(&key) {
                Role::Waiter(mut rx) => {
                    // The owner either populated the cache or failed; a
                    // dropped sender wakes us either way.
                    let _ = rx.changed().await;
                    if let Some(hit) = self.cache.get(&key) {
                        return Ok(hit);
                    }
                    // Owner failed: fall through and make our own request.
                    self.post(meta, args, &key, None).await
                }
                Role::Owner(guard) => self.post(meta, args, &key, guard).await,
            }
        } else {
            self.post(meta, args, &key, None).await
        }
    }

    /// Atomically either joins an in-flight request for `key` or registers
    /// this call as the owner. A cache hit while registering short-circuits.
    fn join_or_register(&self, key: &str) -> Role {
        let mut pending = self.pending.lock().unwrap();
        if let Some(rx) = pending.get(key) {
            return Role::Waiter(rx.clone());
        }
        if self.cache.get(key).is_some() {
            // Fresh entry, no request needed; post() will re-read it.
            return Role::Owner(None);
        }
        let (tx, rx) = watch::channel(());
        pending.insert(key.to_string(), rx);
        Role::Owner(Some(InFlight {
            key: key.to_string(),
            pending: Arc::clone(&self.pending),
            _tx: tx,
        }))
    }

    async fn post(
        &self,
        meta: &FunctionMetadata,
        args: &Args,
        key: &str,
        guard: Option<InFlight>,
    ) -> Result<Vec<u8>, ApidError> {
        if let Some(hit) = self.cache.get(key) {
            return Ok(hit);
        }

        let url = format!("http://{}{}", self.addr, meta.path);
        let rsp = self
            .http
            .post(&url)
            .form(&args.form_pairs())
            .send()
            .await
            .map_err(|err| {
                ApidError::new(599, format!("error in http request: {err} url={url}"))
            })?;

        let status = rsp.status();
        if status != reqwest::StatusCode::OK {
            let mut err: ApidError = rsp.json().await.unwrap_or_default();
            err.code = status.as_u16();
            return Err(err);
        }

        let body = rsp.bytes().await.map_err(|err| {
            ApidError::new(599, format!("error in http request: {err} url={url}"))
        })?;

        let wrapper: HashMap<String, Box<RawValue>> =
            serde_json::from_slice(&body).map_err(|err| {
                ApidError::new(598, format!("error decoding JSON: '{err}' url={url}"))
            })?;

        let result = wrapper.get(&meta.result_key).ok_or_else(|| {
            ApidError::new(
                596,
                format!(
                    "no result found in JSON property '{}' url={url}",
                    meta.result_key
                ),
            )
        })?;

        let raw = result.get().as_bytes().to_vec();

        if meta.cachable > 0 {
            self.cache
                .set(key, raw.clone(), Duration::from_secs(meta.cachable));
        }
        // Release the in-flight marker only after the cache write, so
        // piggybacked callers find the entry when they wake.
        drop(guard);

        Ok(raw)
    }

    async fn call_and_decode<T: DeserializeOwned>(
        &self,
        function: &str,
        args: &Args,
    ) -> Result<T, ApidError> {
        let raw = self.call(function, args).await?;
        serde_json::from_slice(&raw)
            .map_err(|err| ApidError::new(598, format!("error decoding JSON: '{err}'")))
    }

    /// Parse settings for a recipient domain. A host with no parse
    /// configuration yields the zero-valued record, not an error.
    pub async fn get_parse_host_settings(
        &self,
        host: &str,
    ) -> Result<ParseHostSettings, ApidError> {
        let settings: Option<ParseHostSettings> = self
            .call_and_decode("getParseHostSettings", &Args::new().set("host", host))
            .await?;
        Ok(settings.unwrap_or_default())
    }

    pub async fn get_user(&self, user_id: i64) -> Result<User, ApidError> {
        self.call_and_decode("getUser", &Args::new().set("userid", user_id))
            .await
    }
}
