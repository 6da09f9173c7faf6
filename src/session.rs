//! Per-connection proxy sessions.
//!
//! Every request for `/proxy/{track_id}` gets a [`ProxySession`] that walks
//! through the phases of [`Phase`] in order:
//!
//! 1. `Accepted`: the request arrived; the track id is not yet validated.
//! 2. `Admission`: a [`Permit`] is requested from the concurrency gate.
//! 3. `Metadata`: display metadata is looked up.
//! 4. `Resolve`: the track id is resolved to an upstream URL.
//! 5. `Fetch`: the upstream URL is opened, with retries.
//! 6. `Streaming`: bytes are relayed to the client.
//! 7. `Recovering`: the upstream dropped mid-stream and is being reopened.
//! 8. `Terminal`: the session is over.
//!
//! A session that fails in any phase is simply dropped. Dropping moves it to
//! `Terminal` and releases its permit, which makes `Drop` the one place the
//! concurrency gate is decremented.
//!
//! # Mid-stream recovery
//!
//! When the upstream connection fails after streaming began, the session
//! re-resolves the track and asks the upstream for the remaining bytes with
//! a `Range` request. If the upstream answers `206 Partial Content` the new
//! body is spliced onto the client connection and playback continues
//! uninterrupted. Otherwise the client connection is aborted, so the player
//! sees an error rather than a clean end of track and can reconnect.

use std::{
    fmt, io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    time::Instant,
};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::{Response, StatusCode};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use url::Url;

use crate::{
    extractor::ResolveError,
    gate::Permit,
    http::{Client, FetchError},
    icy::MetadataInjector,
    resolver::Resolver,
    uuid::Uuid,
};

/// Byte stream of an upstream response.
pub type UpstreamBody = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// What a session needs to reach the upstream.
#[derive(Clone)]
pub struct Backend {
    pub resolver: Arc<Resolver>,
    pub http: Client,
}

/// Why the upstream could not be opened.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Lifecycle phase of a session.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Accepted,
    Admission,
    Metadata,
    Resolve,
    Fetch,
    Streaming,
    Recovering,
    Terminal,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Accepted => "accepted",
            Self::Admission => "admission",
            Self::Metadata => "metadata",
            Self::Resolve => "resolve",
            Self::Fetch => "fetch",
            Self::Streaming => "streaming",
            Self::Recovering => "recovering",
            Self::Terminal => "terminal",
        };
        f.write_str(name)
    }
}

/// One proxied connection.
#[derive(Debug)]
pub struct ProxySession {
    id: Uuid,
    track_id: String,
    client: SocketAddr,
    phase: Phase,
    permit: Option<Permit>,
    started: Instant,
    relayed: u64,
}

impl ProxySession {
    /// Largest chunk handed to the client in one piece.
    pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

    /// Chunks buffered between the relay task and the client connection.
    pub const CHANNEL_CAPACITY: usize = 16;

    /// Mid-stream reconnects attempted before giving up.
    pub const MAX_RECOVERIES: usize = 2;

    /// Starts a session for a request from `client`.
    ///
    /// The track id is taken as given; it is validated by the caller.
    #[must_use]
    pub fn new(track_id: impl Into<String>, client: SocketAddr) -> Self {
        let session = Self {
            id: Uuid::fast_v4(),
            track_id: track_id.into(),
            client,
            phase: Phase::Accepted,
            permit: None,
            started: Instant::now(),
            relayed: 0,
        };
        debug!("[{session}] accepted connection from {client}");
        session
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    #[must_use]
    pub fn client(&self) -> SocketAddr {
        self.client
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Bytes of upstream audio delivered so far.
    #[must_use]
    pub fn relayed(&self) -> u64 {
        self.relayed
    }

    /// Moves the session to `phase`, tracing the transition.
    ///
    /// Phases only ever move forward, except for `Recovering` going back to
    /// `Streaming` once the upstream is reopened.
    pub fn advance(&mut self, phase: Phase) {
        if self.phase != phase {
            trace!("[{self}] {} -> {phase}", self.phase);
            self.phase = phase;
        }
    }

    /// Takes ownership of the admission slot for the rest of the session.
    pub fn admit(&mut self, permit: Permit) {
        self.permit = Some(permit);
    }

    /// Whether the session holds an admission slot.
    #[must_use]
    pub fn is_admitted(&self) -> bool {
        self.permit.is_some()
    }

    /// Opens the upstream at `url`.
    ///
    /// If the upstream rejects the URL outright, the cached resolution is
    /// invalidated and the track re-resolved and opened once more. Returns
    /// the URL that was finally opened.
    ///
    /// # Errors
    ///
    /// Returns an error if resolution or the fetch fails.
    pub async fn fetch(
        &self,
        backend: &Backend,
        url: Url,
        offset: Option<u64>,
    ) -> Result<(Url, Response), UpstreamError> {
        match backend.http.open(&url, offset).await {
            Ok(response) => Ok((url, response)),
            Err(FetchError::Rejected(status)) => {
                info!("[{self}] upstream rejected url with {status}; re-resolving");
                backend.resolver.invalidate(&self.track_id);

                let url = backend.resolver.resolve(&self.track_id).await?;
                let response = backend.http.open(&url, offset).await?;
                Ok((url, response))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Relays `response` to the client until either side is done.
    ///
    /// Runs as its own task and owns the session, so the admission slot is
    /// held exactly as long as bytes may still flow. Ends early when the
    /// client goes away or `shutdown` changes.
    pub async fn relay(
        mut self,
        backend: Backend,
        response: Response,
        mut injector: Option<MetadataInjector>,
        mut shutdown: watch::Receiver<bool>,
        tx: mpsc::Sender<io::Result<Bytes>>,
    ) {
        self.advance(Phase::Streaming);
        if *shutdown.borrow_and_update() {
            return;
        }

        let mut body: UpstreamBody = Box::pin(response.bytes_stream());
        let mut recoveries = 0;

        loop {
            let next = tokio::select! {
                biased;

                () = tx.closed() => {
                    debug!("[{self}] client disconnected");
                    break;
                }

                _ = shutdown.changed() => {
                    debug!("[{self}] shutting down");
                    break;
                }

                next = body.next() => next,
            };

            match next {
                Some(Ok(mut chunk)) => {
                    while !chunk.is_empty() {
                        let piece = chunk.split_to(chunk.len().min(Self::MAX_CHUNK_SIZE));
                        self.relayed += piece.len() as u64;

                        let piece = match injector.as_mut() {
                            Some(injector) => injector.inject(piece),
                            None => piece,
                        };

                        if tx.send(Ok(piece)).await.is_err() {
                            debug!("[{self}] client disconnected");
                            return;
                        }
                    }
                }

                None => {
                    debug!("[{self}] upstream finished");
                    break;
                }

                Some(Err(e)) => {
                    if recoveries < Self::MAX_RECOVERIES {
                        recoveries += 1;
                        self.advance(Phase::Recovering);
                        warn!(
                            "[{self}] upstream failed after {} bytes: {e}; reconnecting ({recoveries}/{})",
                            self.relayed,
                            Self::MAX_RECOVERIES
                        );

                        let recovered = tokio::select! {
                            biased;
                            () = tx.closed() => None,
                            recovered = self.recover(&backend) => recovered,
                        };

                        if let Some(recovered) = recovered {
                            body = recovered;
                            self.advance(Phase::Streaming);
                            continue;
                        }

                        if tx.is_closed() {
                            debug!("[{self}] client disconnected during recovery");
                            break;
                        }
                    }

                    error!("[{self}] aborting stream after {} bytes: {e}", self.relayed);
                    // The client may be gone already.
                    let _ = tx.send(Err(io::Error::other(e))).await;
                    break;
                }
            }
        }
    }

    /// Reopens the upstream at the current offset.
    async fn recover(&self, backend: &Backend) -> Option<UpstreamBody> {
        let offset = self.relayed;
        let opened = async {
            let url = backend.resolver.resolve(&self.track_id).await?;
            self.fetch(backend, url, Some(offset)).await
        };

        let response = match opened.await {
            Ok((_, response)) => response,
            Err(e) => {
                warn!("[{self}] reconnecting failed: {e}");
                return None;
            }
        };

        let status = response.status();
        let resumable = status == StatusCode::PARTIAL_CONTENT
            || (offset == 0 && status == StatusCode::OK);
        if !resumable {
            warn!("[{self}] upstream cannot resume at byte {offset}: answered {status}");
            return None;
        }

        info!("[{self}] resumed at byte {offset}");
        Some(Box::pin(response.bytes_stream()))
    }
}

impl fmt::Display for ProxySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.id.short(), self.track_id)
    }
}

impl Drop for ProxySession {
    fn drop(&mut self) {
        let from = self.phase;
        self.advance(Phase::Terminal);

        // Releases the admission slot.
        if self.permit.take().is_some() {
            debug!(
                "[{self}] closed in {from} after {:.1}s and {} bytes",
                self.started.elapsed().as_secs_f32(),
                self.relayed
            );
        }
    }
}
