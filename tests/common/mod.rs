#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use wordroot::completion::{CompletionClient, CompletionOptions, TransportError};
use wordroot::{app, build_state, AppConfig, AppState};

pub const NIGHT: &str = r#"{
  "oldest_root": {
    "word": "*nókʷts",
    "pronunciation": "NOHK-wts",
    "language": "Proto-Indo-European",
    "meaning": "night"
  },
  "evolution": "PIE *nókʷts > Proto-Germanic *nahts > Old English niht > Middle English night",
  "related_words": "nocturnal - of the night\nNacht - night (German)\nnox - night (Latin)"
}"#;

/// What a [`StubCompletion`] does when called.
pub enum StubReply {
    Text(String),
    RateLimited,
    Unauthorized,
    Hang(Duration),
    Panic,
}

/// Test double for the completion provider that counts calls and keeps
/// the last prompt it received.
pub struct StubCompletion {
    reply: StubReply,
    calls: AtomicUsize,
    last_prompt: Mutex<Option<String>>,
}

impl StubCompletion {
    pub fn new(reply: StubReply) -> Arc<Self> {
        Arc::new(Self {
            reply,
            calls: AtomicUsize::new(0),
            last_prompt: Mutex::new(None),
        })
    }

    pub fn text(raw: &str) -> Arc<Self> {
        Self::new(StubReply::Text(raw.to_string()))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.last_prompt.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl CompletionClient for StubCompletion {
    async fn complete(
        &self,
        prompt: &str,
        _options: &CompletionOptions,
    ) -> Result<String, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_prompt.lock().unwrap() = Some(prompt.to_string());
        match &self.reply {
            StubReply::Text(raw) => Ok(raw.clone()),
            StubReply::RateLimited => Err(TransportError::RateLimited),
            StubReply::Unauthorized => Err(TransportError::Unauthorized { status: 401 }),
            StubReply::Hang(d) => {
                tokio::time::sleep(*d).await;
                Ok(NIGHT.to_string())
            }
            StubReply::Panic => panic!("stub completion exploded"),
        }
    }
}

pub fn client_of(stub: &Arc<StubCompletion>) -> Option<Arc<dyn CompletionClient>> {
    let client: Arc<dyn CompletionClient> = stub.clone();
    Some(client)
}

/// Serve `state` on an ephemeral port and return its base URL.
pub async fn serve(state: AppState) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(state);
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{}", addr), handle)
}

pub async fn spawn_app(
    config: AppConfig,
    completion: Option<Arc<dyn CompletionClient>>,
) -> (String, JoinHandle<()>) {
    serve(build_state(config, completion)).await
}

pub async fn spawn_with_stub(stub: &Arc<StubCompletion>) -> (String, JoinHandle<()>) {
    spawn_app(AppConfig::default(), client_of(stub)).await
}

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        self.originals
            .entry(key.to_string())
            .or_insert_with(|| std::env::var(key).ok());
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}
