//! Scripted collaborators for unit tests.

use crate::error::SyncError;
use crate::fetcher::FlagFetcher;
use crate::model::EvaluatedFlag;
use crate::stream::{ByteStream, EventSource};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_stream::StreamExt;

/// Outcome of one `open()` call.
pub enum Script {
    Refuse,
    /// Sends the chunks then ends the connection.
    Body(Vec<&'static str>),
    /// Sends the chunks then keeps the connection open.
    Hold(Vec<&'static str>),
}

/// Plays back one [`Script`] per connection, refusing once exhausted.
pub struct ScriptedSource {
    scripts: Mutex<VecDeque<Script>>,
    opened_at: Mutex<Vec<Instant>>,
}

impl fmt::Debug for ScriptedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ScriptedSource")
    }
}

impl ScriptedSource {
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            opened_at: Mutex::new(Vec::new()),
        })
    }

    pub fn opened_at(&self) -> Vec<Instant> {
        self.opened_at.lock().clone()
    }
}

fn chunks(chunks: Vec<&'static str>) -> impl tokio_stream::Stream<Item = Result<Bytes, SyncError>> {
    tokio_stream::iter(
        chunks
            .into_iter()
            .map(|c| Ok::<_, SyncError>(Bytes::from_static(c.as_bytes()))),
    )
}

#[async_trait]
impl EventSource for ScriptedSource {
    async fn open(&self) -> Result<ByteStream, SyncError> {
        self.opened_at.lock().push(Instant::now());
        let script = self.scripts.lock().pop_front().unwrap_or(Script::Refuse);
        match script {
            Script::Refuse => Err(SyncError::Connection("refused".to_string())),
            Script::Body(body) => Ok(Box::pin(chunks(body))),
            Script::Hold(body) => Ok(Box::pin(chunks(body).chain(tokio_stream::pending()))),
        }
    }
}

/// Returns the configured response on every call, after the configured
/// delay.
pub struct StubFetcher {
    response: Mutex<Result<Vec<EvaluatedFlag>, SyncError>>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
}

impl fmt::Debug for StubFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StubFetcher")
    }
}

impl StubFetcher {
    pub fn new(response: Result<Vec<EvaluatedFlag>, SyncError>) -> Arc<Self> {
        Arc::new(Self {
            response: Mutex::new(response),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn respond(&self, response: Result<Vec<EvaluatedFlag>, SyncError>) {
        *self.response.lock() = response;
    }

    pub fn delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FlagFetcher for StubFetcher {
    async fn fetch_all(&self) -> Result<Vec<EvaluatedFlag>, SyncError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.response.lock().clone()
    }
}
