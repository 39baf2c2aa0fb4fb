use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, instrument};
use url::Url;

use folio_core::{
    DisplayTree, DocumentInfo, DocumentMetadata, DocumentSource, FetchOutcome, FetchPayload,
    FetchRequest, LayoutRecord, PageSummary, ResourceKind, Viewer,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: String,
    pub headers: HashMap<String, String>,
    pub request_timeout_ms: u64,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            headers: HashMap::new(),
            request_timeout_ms: 10_000,
            retry_attempts: 3,
            retry_base_delay_ms: 250,
        }
    }
}

pub fn document_path(document_id: &str) -> String {
    format!("api/document/{document_id}")
}

pub fn spans_path(document_id: &str) -> String {
    format!("api/document/{document_id}/layout")
}

pub fn image_path(document_id: &str, page_number: usize) -> String {
    format!("api/document/{document_id}/page/{page_number}/image")
}

pub fn layout_path(document_id: &str, page_number: usize) -> String {
    format!("api/document/{document_id}/page/{page_number}/layout")
}

#[derive(Debug, Deserialize)]
struct DocumentMetaRecord {
    #[serde(default)]
    meta: DocumentMetadata,
    filename: String,
}

pub struct HttpDocumentSource {
    client: Client,
    base_url: Url,
}

impl HttpDocumentSource {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let mut base_url = Url::parse(&config.base_url)
            .with_context(|| format!("invalid base url {:?}", config.base_url))?;
        // Url::join drops the last segment unless the base path ends in a slash
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        for (name, value) in &config.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name {name:?}"))?;
            let header_value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for header {name}"))?;
            headers.insert(header_name, header_value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .context("failed to build http client")?;
        Ok(Self { client, base_url })
    }

    pub fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("invalid endpoint path {path:?}"))
    }

    async fn get_bytes(&self, url: Url) -> Result<Bytes> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .with_context(|| format!("GET {url}"))?;
        response
            .bytes()
            .await
            .with_context(|| format!("reading body of {url}"))
    }
}

#[async_trait::async_trait]
impl DocumentSource for HttpDocumentSource {
    #[instrument(skip(self))]
    async fn fetch_document_meta(&self, id: &str) -> Result<DocumentInfo> {
        let url = self.endpoint(&document_path(id))?;
        let record: DocumentMetaRecord = self
            .client
            .get(url.clone())
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .with_context(|| format!("GET {url}"))?
            .json()
            .await
            .with_context(|| format!("decoding document record from {url}"))?;
        Ok(DocumentInfo {
            id: id.to_string(),
            filename: record.filename,
            meta: record.meta,
        })
    }

    #[instrument(skip(self))]
    async fn fetch_page_spans(&self, id: &str) -> Result<Vec<PageSummary>> {
        let url = self.endpoint(&spans_path(id))?;
        self.client
            .get(url.clone())
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .with_context(|| format!("GET {url}"))?
            .json()
            .await
            .with_context(|| format!("decoding page summaries from {url}"))
    }

    #[instrument(skip(self))]
    async fn fetch_page_image(&self, id: &str, page_number: usize) -> Result<Bytes> {
        let url = self.endpoint(&image_path(id, page_number))?;
        self.get_bytes(url).await
    }

    #[instrument(skip(self))]
    async fn fetch_page_layout(&self, id: &str, page_number: usize) -> Result<LayoutRecord> {
        let url = self.endpoint(&layout_path(id, page_number))?;
        let body = self.get_bytes(url).await?;
        serde_json::from_slice(&body)
            .with_context(|| format!("malformed layout record for page {page_number}"))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RemoteConfig) -> Self {
        Self {
            attempts: config.retry_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let backoff = self.base_delay * (1u32 << attempt.min(6));
        let jitter_ceiling = backoff.as_millis() as u64 / 2;
        let jitter = if jitter_ceiling == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ceiling)
        };
        backoff + Duration::from_millis(jitter)
    }
}

async fn fetch_payload(source: &dyn DocumentSource, request: &FetchRequest) -> Result<FetchPayload> {
    match request.kind {
        ResourceKind::Image => source
            .fetch_page_image(&request.document_id, request.page_number)
            .await
            .map(FetchPayload::Image),
        ResourceKind::Layout => source
            .fetch_page_layout(&request.document_id, request.page_number)
            .await
            .map(FetchPayload::Layout),
    }
}

pub async fn fetch_with_retry(
    source: &dyn DocumentSource,
    policy: RetryPolicy,
    request: &FetchRequest,
) -> Result<FetchPayload> {
    let mut attempt = 0;
    loop {
        match fetch_payload(source, request).await {
            Ok(payload) => return Ok(payload),
            Err(err) => {
                if attempt + 1 >= policy.attempts {
                    return Err(err);
                }
                let delay = policy.delay_for(attempt);
                debug!(
                    page = request.page_number,
                    kind = ?request.kind,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying page resource fetch"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

pub struct ResourceFetcher {
    source: Arc<dyn DocumentSource>,
    policy: RetryPolicy,
    tx: mpsc::UnboundedSender<FetchOutcome>,
    rx: mpsc::UnboundedReceiver<FetchOutcome>,
    in_flight: usize,
}

impl ResourceFetcher {
    pub fn new(source: Arc<dyn DocumentSource>, policy: RetryPolicy) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            source,
            policy,
            tx,
            rx,
            in_flight: 0,
        }
    }

    pub fn dispatch(&mut self, requests: Vec<FetchRequest>) {
        for request in requests {
            self.in_flight += 1;
            let source = Arc::clone(&self.source);
            let policy = self.policy;
            let tx = self.tx.clone();
            tokio::spawn(async move {
                let payload = fetch_with_retry(source.as_ref(), policy, &request).await;
                let outcome = FetchOutcome {
                    page_number: request.page_number,
                    kind: request.kind,
                    generation: request.generation,
                    payload,
                };
                // the receiver may already be gone during shutdown
                let _ = tx.send(outcome);
            });
        }
    }

    pub async fn next(&mut self) -> Option<FetchOutcome> {
        if self.in_flight == 0 {
            return None;
        }
        let outcome = self.rx.recv().await;
        if outcome.is_some() {
            self.in_flight -= 1;
        }
        outcome
    }

    pub fn try_next(&mut self) -> Option<FetchOutcome> {
        match self.rx.try_recv() {
            Ok(outcome) => {
                self.in_flight -= 1;
                Some(outcome)
            }
            Err(_) => None,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight == 0
    }
}

pub async fn pump_until_idle<D: DisplayTree>(viewer: &mut Viewer<D>, fetcher: &mut ResourceFetcher) {
    loop {
        fetcher.dispatch(viewer.take_fetch_requests());
        let Some(outcome) = fetcher.next().await else {
            return;
        };
        viewer.apply_fetch_outcome(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use folio_core::{
        RecordingDisplay, Span, VersionedLayoutRecord, ViewerOptions, LAYOUT_SCHEMA_VERSION,
    };

    fn tiny_layout() -> LayoutRecord {
        LayoutRecord::Versioned(VersionedLayoutRecord {
            version: LAYOUT_SCHEMA_VERSION,
            width: 100.0,
            height: 100.0,
            span: Span { start: 0, end: 0 },
            blocks: Vec::new(),
        })
    }

    struct StubSource {
        page_count: usize,
        failures: usize,
        calls: AtomicUsize,
    }

    impl StubSource {
        fn new(page_count: usize) -> Self {
            Self {
                page_count,
                failures: 0,
                calls: AtomicUsize::new(0),
            }
        }

        fn flaky(failures: usize) -> Self {
            Self {
                page_count: 1,
                failures,
                calls: AtomicUsize::new(0),
            }
        }

        fn take_turn(&self) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(anyhow::anyhow!("transient failure"))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait::async_trait]
    impl DocumentSource for StubSource {
        async fn fetch_document_meta(&self, id: &str) -> Result<DocumentInfo> {
            Ok(DocumentInfo {
                id: id.to_string(),
                filename: "stub.pdf".to_string(),
                meta: DocumentMetadata::default(),
            })
        }

        async fn fetch_page_spans(&self, _id: &str) -> Result<Vec<PageSummary>> {
            Ok((1..=self.page_count)
                .map(|page| PageSummary {
                    width: 100.0,
                    height: 100.0,
                    span: Span {
                        start: (page as u64 - 1) * 10,
                        end: (page as u64 - 1) * 10 + 9,
                    },
                })
                .collect())
        }

        async fn fetch_page_image(&self, _id: &str, _page_number: usize) -> Result<Bytes> {
            self.take_turn()?;
            Ok(Bytes::from_static(b"png"))
        }

        async fn fetch_page_layout(&self, _id: &str, _page_number: usize) -> Result<LayoutRecord> {
            self.take_turn()?;
            Ok(tiny_layout())
        }
    }

    fn quick_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            base_delay: Duration::from_millis(1),
        }
    }

    fn image_request(page_number: usize, generation: u64) -> FetchRequest {
        FetchRequest {
            document_id: "doc-1".to_string(),
            page_number,
            kind: ResourceKind::Image,
            generation,
        }
    }

    #[test]
    fn default_config_fills_missing_fields() {
        let config: RemoteConfig =
            serde_json::from_value(serde_json::json!({"base_url": "http://example.test"}))
                .unwrap();
        assert_eq!(config.base_url, "http://example.test");
        assert_eq!(config.request_timeout_ms, 10_000);
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.retry_base_delay_ms, 250);
        assert!(config.headers.is_empty());
    }

    #[test]
    fn endpoint_joins_base_with_and_without_path() {
        let bare = HttpDocumentSource::new(&RemoteConfig {
            base_url: "http://localhost:9000".to_string(),
            ..RemoteConfig::default()
        })
        .unwrap();
        assert_eq!(
            bare.endpoint(&image_path("doc-1", 3)).unwrap().as_str(),
            "http://localhost:9000/api/document/doc-1/page/3/image"
        );

        let prefixed = HttpDocumentSource::new(&RemoteConfig {
            base_url: "http://gateway.test/folio".to_string(),
            ..RemoteConfig::default()
        })
        .unwrap();
        assert_eq!(
            prefixed.endpoint(&layout_path("doc-1", 3)).unwrap().as_str(),
            "http://gateway.test/folio/api/document/doc-1/page/3/layout"
        );
    }

    #[test]
    fn resource_paths_match_service_layout() {
        assert_eq!(document_path("d"), "api/document/d");
        assert_eq!(spans_path("d"), "api/document/d/layout");
        assert_eq!(image_path("d", 12), "api/document/d/page/12/image");
        assert_eq!(layout_path("d", 12), "api/document/d/page/12/layout");
    }

    #[test]
    fn invalid_header_names_are_rejected() {
        let mut config = RemoteConfig::default();
        config
            .headers
            .insert("bad header".to_string(), "v".to_string());
        assert!(HttpDocumentSource::new(&config).is_err());
    }

    #[test]
    fn backoff_grows_exponentially_with_bounded_jitter() {
        let policy = RetryPolicy {
            attempts: 5,
            base_delay: Duration::from_millis(100),
        };
        for attempt in 0..4u32 {
            let floor = Duration::from_millis(100 * (1 << attempt));
            let ceiling = floor + floor / 2;
            let delay = policy.delay_for(attempt);
            assert!(delay >= floor, "attempt {attempt}: {delay:?} < {floor:?}");
            assert!(delay <= ceiling, "attempt {attempt}: {delay:?} > {ceiling:?}");
        }
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failures() {
        let source = StubSource::flaky(2);
        let payload = fetch_with_retry(&source, quick_retry(3), &image_request(1, 1))
            .await
            .unwrap();
        assert!(matches!(payload, FetchPayload::Image(_)));
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_surfaces_error_after_final_attempt() {
        let source = StubSource::flaky(9);
        let err = fetch_with_retry(&source, quick_retry(3), &image_request(1, 1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("transient failure"));
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fetcher_tracks_in_flight_requests() {
        let source = Arc::new(StubSource::new(1));
        let mut fetcher = ResourceFetcher::new(source, quick_retry(1));
        assert!(fetcher.is_idle());

        fetcher.dispatch(vec![
            image_request(1, 7),
            FetchRequest {
                document_id: "doc-1".to_string(),
                page_number: 1,
                kind: ResourceKind::Layout,
                generation: 7,
            },
        ]);
        assert_eq!(fetcher.in_flight(), 2);

        let first = fetcher.next().await.unwrap();
        let second = fetcher.next().await.unwrap();
        assert_eq!(first.generation, 7);
        assert_eq!(second.generation, 7);
        let mut kinds = [first.kind, second.kind];
        kinds.sort_by_key(|kind| matches!(kind, ResourceKind::Layout));
        assert_eq!(kinds, [ResourceKind::Image, ResourceKind::Layout]);

        assert!(fetcher.is_idle());
        assert!(fetcher.next().await.is_none());
        assert!(fetcher.try_next().is_none());
    }

    #[tokio::test]
    async fn try_next_polls_without_blocking() {
        let source = Arc::new(StubSource::new(1));
        let mut fetcher = ResourceFetcher::new(source, quick_retry(1));
        assert!(fetcher.try_next().is_none());

        fetcher.dispatch(vec![image_request(1, 1)]);
        let mut outcome = None;
        for _ in 0..1000 {
            outcome = fetcher.try_next();
            if outcome.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let outcome = outcome.expect("fetch should complete");
        assert!(outcome.payload.is_ok());
        assert!(fetcher.is_idle());
    }

    #[tokio::test]
    async fn pump_drives_viewer_until_window_is_ready() {
        let source = Arc::new(StubSource::new(5));
        let mut viewer = Viewer::new(RecordingDisplay::new(), ViewerOptions::default());
        viewer.open_document(source.as_ref(), "doc-9").await.unwrap();
        let mut fetcher = ResourceFetcher::new(source, quick_retry(1));

        pump_until_idle(&mut viewer, &mut fetcher).await;

        assert!(fetcher.is_idle());
        for page in viewer.pages() {
            let expected = page.page_number <= 3;
            assert_eq!(page.image_loaded, expected, "page {}", page.page_number);
            assert_eq!(page.layout_loaded, expected, "page {}", page.page_number);
            assert!(!page.loading, "page {}", page.page_number);
        }

        viewer.set_page_number(5, false).unwrap();
        pump_until_idle(&mut viewer, &mut fetcher).await;
        let page = viewer.page(5).unwrap();
        assert!(page.image_loaded && page.layout_loaded);
    }
}
