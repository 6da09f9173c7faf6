//! Metadata-injecting streaming proxy.
//!
//! Serves every catalog track as a plain HTTP audio stream that players can
//! open like an internet radio station:
//!
//! * `GET /proxy/{track_id}` streams the track. The response names the
//!   track in an `icy-name` header and, for players that ask with
//!   `Icy-MetaData: 1`, also in-band every `icy-metaint` bytes.
//! * `GET /health` reports stream and cache counters as JSON.
//!
//! Streams are admitted up to a fixed limit; beyond that, requests are
//! refused with `503` instead of queued.
//!
//! | Status | Meaning |
//! |--------|---------|
//! | 200 | Streaming |
//! | 400 | Malformed track id |
//! | 502 | Track could not be resolved or fetched |
//! | 503 | Too many concurrent streams |
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use streamrelay::{
//!     config::ProxyConfig,
//!     error::Result,
//!     proxy::Proxy,
//!     resolver::Resolver,
//!     store::TrackStore,
//! };
//!
//! async fn example(resolver: Arc<Resolver>, store: Arc<TrackStore>) -> Result<()> {
//!     let proxy = Proxy::new(&ProxyConfig::default(), resolver, store)?;
//!     let listener = proxy.bind().await?;
//!     proxy
//!         .serve(listener, async {
//!             tokio::signal::ctrl_c().await.ok();
//!         })
//!         .await
//! }
//! ```

use std::{
    future::Future,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use axum::{
    body::Body,
    extract::{ConnectInfo, Path, State},
    http::{
        header::{CACHE_CONTROL, CONTENT_TYPE},
        HeaderMap, HeaderName, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::stream;
use serde_json::json;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::{
    net::TcpListener,
    sync::{mpsc, watch},
};
use url::Url;

use crate::{
    config::ProxyConfig,
    error::{Error, Result},
    gate::ConcurrencyGate,
    http::Client,
    icy::MetadataInjector,
    resolver::Resolver,
    session::{Backend, Phase, ProxySession},
    store::{TrackStore, FALLBACK_DISPLAY_NAME},
    track_id::TrackId,
};

const SERVICE_NAME: &str = env!("CARGO_PKG_NAME");

/// Content type used when the upstream does not declare an audio type.
const DEFAULT_CONTENT_TYPE: &str = "audio/webm";

static ICY_NAME: HeaderName = HeaderName::from_static("icy-name");
static ICY_METAINT: HeaderName = HeaderName::from_static("icy-metaint");
static ICY_METADATA: HeaderName = HeaderName::from_static("icy-metadata");

struct Inner {
    config: ProxyConfig,
    backend: Backend,
    store: Arc<TrackStore>,
    gate: ConcurrencyGate,
    shutdown: watch::Sender<bool>,
    started: OffsetDateTime,
}

/// The streaming proxy server.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<Inner>,
}

impl Proxy {
    /// Creates a proxy that resolves through `resolver` and reads display
    /// metadata from `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if the upstream HTTP client cannot be built.
    pub fn new(config: &ProxyConfig, resolver: Arc<Resolver>, store: Arc<TrackStore>) -> Result<Self> {
        let http = Client::new(config)?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                config: config.clone(),
                backend: Backend { resolver, http },
                store,
                gate: ConcurrencyGate::new(config.max_concurrent_streams),
                shutdown,
                started: OffsetDateTime::now_utc(),
            }),
        })
    }

    /// The routes of the proxy, ready to be served or nested.
    ///
    /// Handlers read the client address from `ConnectInfo`, so the router must
    /// be served with `into_make_service_with_connect_info::<SocketAddr>()`.
    #[must_use]
    pub fn router(&self) -> Router {
        Router::new()
            .route("/proxy/{track_id}", get(stream_track))
            .route("/health", get(health))
            .with_state(Arc::clone(&self.inner))
    }

    /// Binds the configured host and port.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(&self) -> Result<TcpListener> {
        let config = &self.inner.config;
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        Ok(listener)
    }

    /// Serves requests on `listener` until `shutdown` completes.
    ///
    /// On shutdown, active streams are ended and the call returns once
    /// their connections have closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        info!(
            "proxy listening on http://{addr} (max {} streams)",
            self.inner.gate.max()
        );

        let inner = Arc::clone(&self.inner);
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!(
                    "proxy shutting down with {} active streams",
                    inner.gate.active()
                );
                inner.shutdown.send_replace(true);
            })
            .await?;

        Ok(())
    }

    /// Number of streams currently admitted.
    #[must_use]
    pub fn active_streams(&self) -> usize {
        self.inner.gate.active()
    }

    /// The URL a player should open to stream `track_id`.
    ///
    /// A wildcard listen address is replaced by loopback of the same
    /// family, so the URL is always one a local player can open.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured host is not a valid URL host.
    pub fn track_url(&self, track_id: &str) -> Result<Url> {
        let config = &self.inner.config;
        track_url(&config.host, config.port, track_id)
    }
}

fn track_url(host: &str, port: u16, track_id: &str) -> Result<Url> {
    let host = match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) if ip.is_unspecified() => Ipv4Addr::LOCALHOST.to_string(),
        Ok(IpAddr::V4(ip)) => ip.to_string(),
        Ok(IpAddr::V6(ip)) if ip.is_unspecified() => format!("[{}]", Ipv6Addr::LOCALHOST),
        Ok(IpAddr::V6(ip)) => format!("[{ip}]"),
        Err(_) => host.to_owned(),
    };

    let mut url = Url::parse(&format!("http://{host}:{port}/"))?;
    url.path_segments_mut()
        .map_err(|()| Error::internal("proxy url cannot carry a path"))?
        .pop_if_empty()
        .extend(["proxy", track_id]);
    Ok(url)
}

impl Inner {
    /// Display text for the session's track. Never fails: metadata is
    /// cosmetic.
    async fn display_name(&self, session: &ProxySession) -> String {
        let store = Arc::clone(&self.store);
        let track_id = session.track_id().to_owned();

        let lookup = tokio::task::spawn_blocking(move || store.get(&track_id))
            .await
            .map_err(Error::from)
            .and_then(|result| result);

        match lookup {
            Ok(Some(metadata)) => metadata.display_name(),
            Ok(None) => {
                debug!("[{session}] no metadata; using fallback title");
                FALLBACK_DISPLAY_NAME.to_owned()
            }
            Err(e) => {
                warn!("[{session}] metadata lookup failed: {e}; using fallback title");
                FALLBACK_DISPLAY_NAME.to_owned()
            }
        }
    }

    async fn record_stream_url(&self, session: &ProxySession, url: &Url) {
        let store = Arc::clone(&self.store);
        let track_id = session.track_id().to_owned();
        let url = url.to_string();

        let update = tokio::task::spawn_blocking(move || store.update_stream_url(&track_id, &url))
            .await
            .map_err(Error::from)
            .and_then(|result| result);
        if let Err(e) = update {
            warn!("[{session}] could not record stream url: {e}");
        }
    }
}

fn reject(status: StatusCode, message: impl Into<String>) -> Response {
    (status, message.into()).into_response()
}

/// `icy-name` value for `title`, which may contain any UTF-8.
fn icy_name(title: &str) -> HeaderValue {
    HeaderValue::from_bytes(title.as_bytes())
        .unwrap_or_else(|_| HeaderValue::from_static(FALLBACK_DISPLAY_NAME))
}

async fn stream_track(
    State(inner): State<Arc<Inner>>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
    Path(track_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let mut session = ProxySession::new(track_id, client);

    if let Err(e) = session.track_id().parse::<TrackId>() {
        debug!("[{session}] {e}");
        return reject(e.kind.status_code(), e.to_string());
    }

    session.advance(Phase::Admission);
    let Some(permit) = inner.gate.try_acquire() else {
        warn!(
            "[{session}] refusing stream: {} of {} streams active",
            inner.gate.active(),
            inner.gate.max()
        );
        return reject(
            StatusCode::SERVICE_UNAVAILABLE,
            "too many concurrent streams; try again shortly",
        );
    };
    session.admit(permit);

    session.advance(Phase::Metadata);
    let title = inner.display_name(&session).await;

    session.advance(Phase::Resolve);
    let url = match inner.backend.resolver.resolve(session.track_id()).await {
        Ok(url) => url,
        Err(e) => {
            warn!("[{session}] {e}");
            return reject(StatusCode::BAD_GATEWAY, e.to_string());
        }
    };

    session.advance(Phase::Fetch);
    let (url, response) = match session.fetch(&inner.backend, url, None).await {
        Ok(opened) => opened,
        Err(e) => {
            warn!("[{session}] {e}");
            return reject(StatusCode::BAD_GATEWAY, e.to_string());
        }
    };
    inner.record_stream_url(&session, &url).await;

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .filter(|value| value.as_bytes().starts_with(b"audio/"))
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_CONTENT_TYPE));

    let mut response_headers = HeaderMap::new();
    response_headers.insert(CONTENT_TYPE, content_type);
    response_headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response_headers.insert(ICY_NAME.clone(), icy_name(&title));

    let wants_icy = headers
        .get(&ICY_METADATA)
        .is_some_and(|value| value.as_bytes().trim_ascii() == b"1");
    let injector = wants_icy.then(|| {
        let injector = MetadataInjector::new(inner.config.icy_metaint, &title);
        response_headers.insert(ICY_METAINT.clone(), HeaderValue::from(injector.interval()));
        injector
    });

    info!(
        "[{session}] streaming \"{title}\" from {} to {client}",
        url.host_str().unwrap_or("upstream")
    );

    let (tx, mut rx) = mpsc::channel(ProxySession::CHANNEL_CAPACITY);
    tokio::spawn(session.relay(
        inner.backend.clone(),
        response,
        injector,
        inner.shutdown.subscribe(),
        tx,
    ));

    let body = Body::from_stream(stream::poll_fn(move |cx| rx.poll_recv(cx)));
    (response_headers, body).into_response()
}

async fn health(State(inner): State<Arc<Inner>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": SERVICE_NAME,
        "started_at": inner.started.format(&Rfc3339).ok(),
        "active_streams": inner.gate.active(),
        "max_streams": inner.gate.max(),
        "cache": inner.backend.resolver.stats(),
    }))
}
