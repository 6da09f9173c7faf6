mod common;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use common::{audio, eventually, FakeExtractor, Upstream, AUDIO_LEN};
use reqwest::StatusCode;
use streamrelay::{
    config::ProxyConfig,
    extractor::ResolveError,
    proxy::Proxy,
    resolver::{Options, Resolver},
    store::{TrackMetadata, TrackStore},
};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

const TRACK: &str = "dQw4w9WgXcQ";
const OTHER: &str = "9bZkp7q19f0";

struct Harness {
    addr: SocketAddr,
    proxy: Proxy,
    fake: Arc<FakeExtractor>,
    store: Arc<TrackStore>,
    upstream: Upstream,
    client: reqwest::Client,
    stop: Option<oneshot::Sender<()>>,
    server: JoinHandle<()>,
}

impl Harness {
    async fn start() -> Self {
        Self::with_config(config()).await
    }

    async fn with_config(config: ProxyConfig) -> Self {
        let upstream = Upstream::spawn().await;
        let fake = FakeExtractor::new();
        let store = Arc::new(TrackStore::open_in_memory().unwrap());
        let resolver = Arc::new(Resolver::new(
            fake.clone(),
            Options {
                network_retry_delay: Duration::from_millis(10),
                ..Options::default()
            },
        ));

        let proxy = Proxy::new(&config, resolver, Arc::clone(&store)).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (stop, stopped) = oneshot::channel::<()>();
        let server = {
            let proxy = proxy.clone();
            tokio::spawn(async move {
                proxy
                    .serve(listener, async {
                        let _ = stopped.await;
                    })
                    .await
                    .unwrap();
            })
        };

        Self {
            addr,
            proxy,
            fake,
            store,
            upstream,
            client: reqwest::Client::new(),
            stop: Some(stop),
            server,
        }
    }

    fn serve_from(&self, track_id: &str, path: &str) {
        self.fake.set(track_id, self.upstream.url(path));
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("http://{}{path}", self.addr))
            .send()
            .await
            .unwrap()
    }
}

fn config() -> ProxyConfig {
    ProxyConfig {
        host: "127.0.0.1".to_owned(),
        max_concurrent_streams: 4,
        upstream_backoff_ms: 10,
        upstream_read_timeout_secs: 5,
        ..ProxyConfig::default()
    }
}

/// Splits an ICY stream into audio and the non-empty metadata blocks.
fn strip_icy(body: &[u8], metaint: usize) -> (Vec<u8>, Vec<String>) {
    let mut audio = Vec::new();
    let mut titles = Vec::new();
    let mut rest = body;

    loop {
        let take = rest.len().min(metaint);
        audio.extend_from_slice(&rest[..take]);
        rest = &rest[take..];
        if rest.is_empty() {
            break;
        }

        let len = usize::from(rest[0]) * 16;
        if len > 0 {
            let text = String::from_utf8_lossy(&rest[1..=len]);
            titles.push(text.trim_end_matches('\0').to_owned());
        }
        rest = &rest[1 + len..];
    }

    (audio, titles)
}

#[tokio::test]
async fn streams_track_with_metadata() {
    let harness = Harness::start().await;
    harness.serve_from(TRACK, "/audio");
    harness
        .store
        .put(TRACK, &TrackMetadata::new("Never Gonna Give You Up", Some("Rick Astley")))
        .unwrap();

    let response = harness.get(&format!("/proxy/{TRACK}")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let headers = response.headers();
    assert_eq!(headers["content-type"], "audio/webm");
    assert_eq!(headers["cache-control"], "no-cache");
    assert_eq!(headers["icy-name"], "Rick Astley - Never Gonna Give You Up");
    assert!(headers.get("icy-metaint").is_none());

    let body = response.bytes().await.unwrap();
    assert_eq!(body.len(), AUDIO_LEN);
    assert_eq!(&body[..], &audio()[..]);

    let record = harness.store.stream_record(TRACK).unwrap().unwrap();
    assert_eq!(record.url, harness.upstream.url("/audio"));

    let proxy = harness.proxy.clone();
    eventually(|| proxy.active_streams() == 0).await;
}

#[tokio::test]
async fn forwards_audio_content_type() {
    let harness = Harness::start().await;
    harness.serve_from(TRACK, "/slow");

    let response = harness.get(&format!("/proxy/{TRACK}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "audio/mp4");
}

#[tokio::test]
async fn unknown_metadata_uses_fallback_label() {
    let harness = Harness::start().await;
    harness.serve_from(TRACK, "/audio");

    let response = harness.get(&format!("/proxy/{TRACK}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["icy-name"],
        "Unknown Artist - Unknown Title"
    );
    assert_eq!(response.bytes().await.unwrap().len(), AUDIO_LEN);
}

#[tokio::test]
async fn malformed_id_is_rejected_before_resolving() {
    let harness = Harness::start().await;

    for path in ["/proxy/short", "/proxy/dQw4w9WgXcQQ", "/proxy/dQw4w9WgXc%21"] {
        let response = harness.get(path).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{path}");
    }

    assert_eq!(harness.fake.calls(), 0);
    assert_eq!(harness.proxy.active_streams(), 0);
}

#[tokio::test]
async fn resolution_failure_is_bad_gateway() {
    let harness = Harness::start().await;
    harness
        .fake
        .fail(TRACK, ResolveError::RegionLocked("blocked".to_owned()));

    let response = harness.get(&format!("/proxy/{TRACK}")).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(!response.text().await.unwrap().is_empty());
    assert_eq!(harness.proxy.active_streams(), 0);
}

#[tokio::test]
async fn refuses_streams_beyond_limit() {
    let harness = Harness::with_config(ProxyConfig {
        max_concurrent_streams: 2,
        ..config()
    })
    .await;
    harness.serve_from(TRACK, "/slow");
    harness.serve_from(OTHER, "/slow");

    let first = harness.get(&format!("/proxy/{TRACK}")).await;
    let second = harness.get(&format!("/proxy/{OTHER}")).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(harness.proxy.active_streams(), 2);

    let third = harness.get(&format!("/proxy/{TRACK}")).await;
    assert_eq!(third.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(harness.proxy.active_streams(), 2);

    drop(first);
    let proxy = harness.proxy.clone();
    eventually(|| proxy.active_streams() == 1).await;

    let fourth = harness.get(&format!("/proxy/{TRACK}")).await;
    assert_eq!(fourth.status(), StatusCode::OK);
    drop(second);
}

#[tokio::test]
async fn client_disconnect_releases_slot() {
    let harness = Harness::start().await;
    harness.serve_from(TRACK, "/slow");

    let mut response = harness.get(&format!("/proxy/{TRACK}")).await;
    assert!(response.chunk().await.unwrap().is_some());
    assert_eq!(harness.proxy.active_streams(), 1);

    drop(response);
    let proxy = harness.proxy.clone();
    eventually(|| proxy.active_streams() == 0).await;
}

#[tokio::test]
async fn rejected_url_is_reresolved() {
    let harness = Harness::start().await;
    harness.fake.script(
        TRACK,
        [
            Ok(harness.upstream.url("/forbidden")),
            Ok(harness.upstream.url("/audio")),
        ],
    );

    let response = harness.get(&format!("/proxy/{TRACK}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(&response.bytes().await.unwrap()[..], &audio()[..]);
    assert_eq!(harness.fake.calls_for(TRACK), 2);
}

#[tokio::test]
async fn persistently_rejected_url_is_bad_gateway() {
    let harness = Harness::start().await;
    harness.serve_from(TRACK, "/forbidden");

    let response = harness.get(&format!("/proxy/{TRACK}")).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(harness.fake.calls_for(TRACK), 2);
    assert_eq!(harness.proxy.active_streams(), 0);
}

#[tokio::test]
async fn transient_upstream_errors_are_retried() {
    let harness = Harness::start().await;
    harness.serve_from(TRACK, "/unstable");

    let response = harness.get(&format!("/proxy/{TRACK}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.bytes().await.unwrap().len(), AUDIO_LEN);
    assert_eq!(harness.upstream.hits(), 3);
}

#[tokio::test]
async fn resumes_after_mid_stream_drop() {
    let harness = Harness::start().await;
    harness.serve_from(TRACK, "/flaky");

    let response = harness.get(&format!("/proxy/{TRACK}")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.bytes().await.unwrap();
    assert_eq!(body.len(), AUDIO_LEN);
    assert_eq!(&body[..], &audio()[..]);
    assert_eq!(harness.upstream.range_requests(), 1);
}

#[tokio::test]
async fn reresolves_when_resume_is_rejected() {
    let harness = Harness::start().await;
    harness.fake.script(
        TRACK,
        [
            Ok(harness.upstream.url("/expiring")),
            Ok(harness.upstream.url("/audio")),
        ],
    );

    let response = harness.get(&format!("/proxy/{TRACK}")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.bytes().await.unwrap();
    assert_eq!(body.len(), AUDIO_LEN);
    assert_eq!(&body[..], &audio()[..]);

    // One refused resume on the expired URL, one honored on the new one.
    assert_eq!(harness.fake.calls_for(TRACK), 2);
    assert_eq!(harness.upstream.range_requests(), 2);
}

#[tokio::test]
async fn aborts_when_upstream_cannot_resume() {
    let harness = Harness::start().await;
    harness.serve_from(TRACK, "/flaky-norange");

    let response = harness.get(&format!("/proxy/{TRACK}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.bytes().await.is_err());

    let proxy = harness.proxy.clone();
    eventually(|| proxy.active_streams() == 0).await;
}

#[tokio::test]
async fn injects_icy_metadata_on_request() {
    let harness = Harness::with_config(ProxyConfig {
        icy_metaint: 1000,
        ..config()
    })
    .await;
    harness.serve_from(TRACK, "/audio");
    harness
        .store
        .put(TRACK, &TrackMetadata::new("Title", Some("Artist")))
        .unwrap();

    let response = harness
        .client
        .get(format!("http://{}/proxy/{TRACK}", harness.addr))
        .header("Icy-MetaData", "1")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["icy-metaint"], "1000");

    let body = response.bytes().await.unwrap();
    let (stream, titles) = strip_icy(&body, 1000);
    assert_eq!(stream, audio());
    assert_eq!(titles, ["StreamTitle='Artist - Title';"]);
}

#[tokio::test]
async fn health_reports_counters() {
    let harness = Harness::start().await;
    harness.serve_from(TRACK, "/slow");

    let _stream = harness.get(&format!("/proxy/{TRACK}")).await;

    let body = harness.get("/health").await.bytes().await.unwrap();
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["service"], "streamrelay");
    assert_eq!(health["active_streams"], 1);
    assert_eq!(health["max_streams"], 4);
    assert_eq!(health["cache"]["size"], 1);
    assert_eq!(health["cache"]["fresh"], 1);
}

#[tokio::test]
async fn shutdown_ends_active_streams() {
    let mut harness = Harness::start().await;
    harness.serve_from(TRACK, "/slow");

    let mut response = harness.get(&format!("/proxy/{TRACK}")).await;
    assert!(response.chunk().await.unwrap().is_some());

    harness.stop.take().unwrap().send(()).unwrap();

    // Drain until the proxy ends the body.
    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while let Ok(Some(_)) = response.chunk().await {}
    })
    .await;
    assert!(drained.is_ok());

    tokio::time::timeout(Duration::from_secs(5), &mut harness.server)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(harness.proxy.active_streams(), 0);
}

#[tokio::test]
async fn track_url_points_at_proxy() {
    let harness = Harness::start().await;
    assert_eq!(
        harness.proxy.track_url(TRACK).unwrap().as_str(),
        format!("http://127.0.0.1:8080/proxy/{TRACK}")
    );
}
