#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::State,
    http::{
        header::{CONTENT_RANGE, CONTENT_TYPE, RANGE},
        HeaderMap, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use futures_util::stream;
use streamrelay::extractor::{Extractor, ResolveError};
use tokio::net::TcpListener;

/// Scripted stand-in for the extraction tool.
///
/// Each id maps to a queue of outcomes; the last one repeats forever.
#[derive(Default)]
pub struct FakeExtractor {
    outcomes: Mutex<HashMap<String, VecDeque<Result<String, ResolveError>>>>,
    calls: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    delay: Mutex<Duration>,
}

impl FakeExtractor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, track_id: &str, url: impl Into<String>) {
        self.script(track_id, [Ok(url.into())]);
    }

    pub fn fail(&self, track_id: &str, error: ResolveError) {
        self.script(track_id, [Err(error)]);
    }

    pub fn script(
        &self,
        track_id: &str,
        outcomes: impl IntoIterator<Item = Result<String, ResolveError>>,
    ) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(track_id.to_owned(), outcomes.into_iter().collect());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn calls_for(&self, track_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(track_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_outcome(&self, track_id: &str) -> Result<String, ResolveError> {
        let mut outcomes = self.outcomes.lock().unwrap();
        let Some(queue) = outcomes.get_mut(track_id) else {
            return Err(ResolveError::Unavailable(format!("{track_id} unknown")));
        };
        if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            queue.front().cloned().unwrap()
        }
    }
}

#[async_trait]
impl Extractor for FakeExtractor {
    async fn extract(&self, track_id: &str) -> Result<String, ResolveError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(track_id.to_owned())
            .or_default() += 1;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.next_outcome(track_id)
    }
}

pub const AUDIO_LEN: usize = 200_000;

pub fn audio() -> Vec<u8> {
    (0..AUDIO_LEN).map(|i| (i % 251) as u8).collect()
}

#[derive(Default)]
pub struct UpstreamState {
    pub hits: AtomicUsize,
    pub range_requests: AtomicUsize,
    pub unstable_failures: AtomicUsize,
}

/// Fake CDN serving a known byte pattern in various states of health.
pub struct Upstream {
    pub addr: SocketAddr,
    pub state: Arc<UpstreamState>,
}

impl Upstream {
    pub async fn spawn() -> Self {
        let state = Arc::new(UpstreamState::default());
        let app = Router::new()
            .route("/audio", get(full))
            .route("/forbidden", get(forbidden))
            .route("/flaky", get(flaky))
            .route("/flaky-norange", get(flaky_without_range))
            .route("/expiring", get(expiring))
            .route("/slow", get(slow))
            .route("/unstable", get(unstable))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    pub fn range_requests(&self) -> usize {
        self.state.range_requests.load(Ordering::SeqCst)
    }
}

fn range_start(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(RANGE)?
        .to_str()
        .ok()?
        .strip_prefix("bytes=")?
        .strip_suffix('-')?
        .parse()
        .ok()
}

fn partial(start: usize) -> Response {
    (
        StatusCode::PARTIAL_CONTENT,
        [
            (CONTENT_TYPE, "audio/webm".to_owned()),
            (
                CONTENT_RANGE,
                format!("bytes {start}-{}/{AUDIO_LEN}", AUDIO_LEN - 1),
            ),
        ],
        audio()[start..].to_vec(),
    )
        .into_response()
}

/// Sends the first half of the audio, then drops the connection once the
/// client has had time to receive the headers and that half.
fn truncated() -> Response {
    let chunks = stream::unfold(0_u8, |step| async move {
        match step {
            0 => Some((Ok(Bytes::from(audio()[..AUDIO_LEN / 2].to_vec())), 1)),
            1 => {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Some((Err(io::Error::other("upstream dropped the connection")), 2))
            }
            _ => None,
        }
    });
    ([(CONTENT_TYPE, "audio/webm")], Body::from_stream(chunks)).into_response()
}

async fn full(State(state): State<Arc<UpstreamState>>, headers: HeaderMap) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    if let Some(start) = range_start(&headers) {
        state.range_requests.fetch_add(1, Ordering::SeqCst);
        return partial(start);
    }
    ([(CONTENT_TYPE, "audio/webm")], audio()).into_response()
}

async fn forbidden(State(state): State<Arc<UpstreamState>>) -> StatusCode {
    state.hits.fetch_add(1, Ordering::SeqCst);
    StatusCode::FORBIDDEN
}

async fn flaky(State(state): State<Arc<UpstreamState>>, headers: HeaderMap) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    if let Some(start) = range_start(&headers) {
        state.range_requests.fetch_add(1, Ordering::SeqCst);
        return partial(start);
    }
    truncated()
}

async fn flaky_without_range(
    State(state): State<Arc<UpstreamState>>,
    headers: HeaderMap,
) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    if range_start(&headers).is_some() {
        state.range_requests.fetch_add(1, Ordering::SeqCst);
    }
    truncated()
}

/// Truncated like `/flaky`, but refuses every ranged request as if the
/// signed URL had expired in the meantime.
async fn expiring(State(state): State<Arc<UpstreamState>>, headers: HeaderMap) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    if range_start(&headers).is_some() {
        state.range_requests.fetch_add(1, Ordering::SeqCst);
        return StatusCode::FORBIDDEN.into_response();
    }
    truncated()
}

/// Never ends: a kilobyte every 20ms.
async fn slow(State(state): State<Arc<UpstreamState>>) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let chunks = stream::unfold((), |()| async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Some((Ok::<_, io::Error>(Bytes::from_static(&[7; 1024])), ()))
    });
    ([(CONTENT_TYPE, "audio/mp4")], Body::from_stream(chunks)).into_response()
}

/// Fails twice with 503, then serves the audio.
async fn unstable(State(state): State<Arc<UpstreamState>>) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    if state.unstable_failures.fetch_add(1, Ordering::SeqCst) < 2 {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ([(CONTENT_TYPE, "audio/webm")], audio()).into_response()
}

/// Polls `condition` until it holds or a few seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}
