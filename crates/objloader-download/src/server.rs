use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use objloader_protocol::{
    parse_single, AuthMethod, GetObjectsRequest, LineParser, ProtocolError, ServerEndpoints,
};
use objloader_queue::Queue;
use objloader_types::{Item, ObjectId};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{DownloadError, DownloadResult};
use crate::pool::{Delivery, Pool};
use crate::traits::{Downloader, PoolOptions};

const MISSING_SAMPLE: usize = 5;

/// Where to download a graph from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDownloaderOptions {
    pub server_url: String,
    pub stream_id: String,
    /// The root object.
    pub object_id: String,
    #[serde(default)]
    pub token: Option<String>,
    /// Extra headers sent with every request.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

/// Downloads objects from an object server.
///
/// Batches are sent as one `POST` each and the response body is parsed as it
/// streams in, one `<id>\t<json>` record per line.
pub struct ServerDownloader {
    client: Client,
    endpoints: ServerEndpoints,
    object_id: ObjectId,
    auth: AuthMethod,
    headers: HeaderMap,
    pool: Pool,
}

impl ServerDownloader {
    pub fn new(options: ServerDownloaderOptions) -> DownloadResult<Self> {
        let auth = AuthMethod::from_token(options.token.as_deref());
        let headers = build_headers(&auth, &options.headers)?;
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            endpoints: ServerEndpoints::new(&options.server_url, &options.stream_id),
            object_id: ObjectId::new(options.object_id),
            auth,
            headers,
            pool: Pool::new("download"),
        })
    }

    pub fn endpoints(&self) -> &ServerEndpoints {
        &self.endpoints
    }

    pub fn object_id(&self) -> &ObjectId {
        &self.object_id
    }

    pub fn auth(&self) -> &AuthMethod {
        &self.auth
    }
}

#[async_trait]
impl Downloader for ServerDownloader {
    fn initialize_pool(
        &self,
        results: Arc<dyn Queue<Item>>,
        options: PoolOptions,
    ) -> DownloadResult<()> {
        let fetcher = Arc::new(BatchFetcher {
            client: self.client.clone(),
            url: self.endpoints.get_objects_url(),
            headers: self.headers.clone(),
        });
        info!(
            url = %fetcher.url,
            auth = self.auth.display_name(),
            total = options.total,
            "starting server download pool"
        );
        self.pool.start(results, options, move |results, batch| {
            let fetcher = Arc::clone(&fetcher);
            async move { fetcher.fetch(&*results, batch).await }
        })
    }

    fn add(&self, id: ObjectId) {
        self.pool.add(id);
    }

    async fn download_single(&self) -> DownloadResult<Option<Item>> {
        let url = self.endpoints.single_object_url(&self.object_id);
        debug!(url = %url, "downloading root object");
        let response = self
            .client
            .get(&url)
            .headers(self.headers.clone())
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            warn!(id = %self.object_id, "root object not found on server");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(status_error(status, &url));
        }
        let body = response.bytes().await?;
        Ok(parse_single(&self.object_id, &body)?)
    }

    fn take_error(&self) -> Option<DownloadError> {
        self.pool.take_error()
    }

    async fn dispose_async(&self) {
        self.pool.dispose().await;
    }
}

struct BatchFetcher {
    client: Client,
    url: String,
    headers: HeaderMap,
}

impl BatchFetcher {
    async fn fetch(&self, results: &dyn Queue<Item>, batch: Vec<ObjectId>) -> DownloadResult<()> {
        let body = GetObjectsRequest::from_ids(&batch)?;
        let mut remaining: HashSet<ObjectId> = batch.into_iter().collect();
        let requested = remaining.len();

        let mut response = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .header(ACCEPT, "text/plain")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, &self.url));
        }

        let mut parser = LineParser::new();
        let mut delivery = Delivery::new(results);
        while let Some(chunk) = response.chunk().await? {
            for record in parser.feed(&chunk) {
                match record {
                    Ok(item) => {
                        remaining.remove(&item.base_id);
                        delivery.send(item).await;
                    }
                    Err(ProtocolError::Decode { id, reason }) => {
                        error!(id = %id, reason = %reason, "object failed to decode");
                        let id = ObjectId::new(id);
                        if remaining.remove(&id) {
                            delivery.send(Item::failed(id, reason)).await;
                        }
                    }
                    Err(e) => warn!(error = %e, "skipping malformed response line"),
                }
            }
        }
        parser.finish();

        if !remaining.is_empty() {
            let sample: Vec<&str> = remaining.iter().take(MISSING_SAMPLE).map(|id| id.as_str()).collect();
            warn!(
                missing = remaining.len(),
                sample = ?sample,
                "server did not return every requested object"
            );
            for id in remaining {
                delivery.send(Item::not_found(id)).await;
            }
        }

        debug!(requested, delivered = delivery.delivered(), "batch downloaded");
        Ok(())
    }
}

fn status_error(status: StatusCode, url: &str) -> DownloadError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DownloadError::AccessDenied,
        StatusCode::NOT_FOUND => DownloadError::NotFound(url.to_string()),
        other => DownloadError::FetchFailed {
            status: other.as_u16(),
        },
    }
}

fn build_headers(auth: &AuthMethod, extra: &[(String, String)]) -> DownloadResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (name, value) in extra {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| DownloadError::InvalidHeader(name.clone()))?;
        let value =
            HeaderValue::from_str(value).map_err(|_| DownloadError::InvalidHeader(name.to_string()))?;
        headers.insert(name, value);
    }
    if let Some(bearer) = auth.authorization_header() {
        let mut value = HeaderValue::from_str(&bearer)
            .map_err(|_| DownloadError::InvalidHeader(AUTHORIZATION.to_string()))?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use axum::body::Body;
    use axum::extract::{Path, State};
    use axum::http::HeaderMap as AxumHeaders;
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use objloader_queue::AsyncQueue;

    #[derive(Clone)]
    struct TestServer {
        objects: Arc<HashMap<String, String>>,
        status: StatusCode,
        chunk_size: usize,
        batches: Arc<Mutex<Vec<Vec<ObjectId>>>>,
        auth: Arc<Mutex<Vec<Option<String>>>>,
    }

    impl TestServer {
        fn new(objects: &[(&str, &str)]) -> Self {
            Self {
                objects: Arc::new(
                    objects
                        .iter()
                        .map(|(id, json)| (id.to_string(), json.to_string()))
                        .collect(),
                ),
                status: StatusCode::OK,
                chunk_size: 7,
                batches: Arc::default(),
                auth: Arc::default(),
            }
        }

        fn failing(status: StatusCode) -> Self {
            Self {
                status,
                ..Self::new(&[])
            }
        }

        async fn spawn(&self) -> String {
            let app = Router::new()
                .route("/api/getobjects/:stream", post(get_objects))
                .route("/objects/:stream/:object/single", get(single_object))
                .with_state(self.clone());
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            format!("http://{addr}")
        }
    }

    async fn get_objects(
        State(server): State<TestServer>,
        headers: AxumHeaders,
        Json(request): Json<GetObjectsRequest>,
    ) -> Response {
        server.auth.lock().unwrap().push(
            headers
                .get("authorization")
                .map(|v| v.to_str().unwrap().to_string()),
        );
        if server.status != StatusCode::OK {
            return server.status.into_response();
        }
        let ids = request.ids().unwrap();
        server.batches.lock().unwrap().push(ids.clone());

        let mut body = Vec::new();
        for id in &ids {
            if let Some(json) = server.objects.get(id.as_str()) {
                body.extend_from_slice(format!("{id}\t{json}\n").as_bytes());
            }
        }
        // Small chunks so records straddle reads.
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> = body
            .chunks(server.chunk_size)
            .map(|c| Ok(c.to_vec()))
            .collect();
        Body::from_stream(futures_util::stream::iter(chunks)).into_response()
    }

    async fn single_object(
        State(server): State<TestServer>,
        Path((_stream, object)): Path<(String, String)>,
    ) -> Response {
        match server.objects.get(&object) {
            Some(json) => json.clone().into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        }
    }

    fn downloader(url: &str, object_id: &str, token: Option<&str>) -> ServerDownloader {
        ServerDownloader::new(ServerDownloaderOptions {
            server_url: url.to_string(),
            stream_id: "stream".into(),
            object_id: object_id.into(),
            token: token.map(str::to_string),
            headers: vec![],
        })
        .unwrap()
    }

    fn start(dl: &ServerDownloader, total: usize) -> Arc<AsyncQueue<Item>> {
        let results = Arc::new(AsyncQueue::new());
        dl.initialize_pool(
            results.clone(),
            PoolOptions {
                total,
                max_wait: Duration::from_millis(10),
            },
        )
        .unwrap();
        results
    }

    async fn collect(results: &AsyncQueue<Item>, n: usize) -> Vec<Item> {
        let mut items = Vec::new();
        for _ in 0..n {
            let item = tokio::time::timeout(Duration::from_secs(5), results.next())
                .await
                .expect("timed out waiting for item")
                .expect("results finished early");
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn streams_three_records() {
        let server = TestServer::new(&[
            ("id1", r#"{"id":"id1"}"#),
            ("id2", r#"{"id":"id2"}"#),
            ("id3", r#"{"id":"id3"}"#),
        ]);
        let url = server.spawn().await;
        let dl = downloader(&url, "root", None);
        let results = start(&dl, 3);
        for id in ["id1", "id2", "id3"] {
            dl.add(ObjectId::new(id));
        }

        let items = collect(&results, 3).await;
        for (item, id) in items.iter().zip(["id1", "id2", "id3"]) {
            assert_eq!(item.base_id.as_str(), id);
            assert_eq!(item.base.as_ref().unwrap().id(), id);
        }
        assert_eq!(server.batches.lock().unwrap().len(), 1);
        assert!(dl.take_error().is_none());
        dl.dispose_async().await;
    }

    #[tokio::test]
    async fn missing_ids_become_placeholders() {
        let server = TestServer::new(&[("id1", r#"{"id":"id1"}"#)]);
        let url = server.spawn().await;
        let dl = downloader(&url, "root", None);
        let results = start(&dl, 2);
        dl.add(ObjectId::new("id1"));
        dl.add(ObjectId::new("ghost"));

        let items = collect(&results, 2).await;
        assert!(items[0].is_resolved());
        assert_eq!(items[1], Item::not_found("ghost"));
        dl.dispose_async().await;
    }

    #[tokio::test]
    async fn bad_record_is_scoped_to_its_id() {
        let server = TestServer::new(&[
            ("id1", r#"{"id":"id1"}"#),
            ("id2", r#"{"id":"id2","#),
            ("id3", r#"{"id":"id3"}"#),
        ]);
        let url = server.spawn().await;
        let dl = downloader(&url, "root", None);
        let results = start(&dl, 3);
        for id in ["id1", "id2", "id3"] {
            dl.add(ObjectId::new(id));
        }

        let items = collect(&results, 3).await;
        assert!(items[0].is_resolved());
        assert_eq!(items[1].base_id.as_str(), "id2");
        assert!(!items[1].is_resolved());
        let reason = items[1].error.as_deref().expect("decode error is carried");
        assert!(reason.contains("EOF"), "unexpected reason: {reason}");
        assert!(items[2].is_resolved());
        // The batch itself did not fail.
        assert!(dl.take_error().is_none());
        dl.dispose_async().await;
    }

    #[tokio::test]
    async fn access_denied_finishes_results() {
        for status in [StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN] {
            let server = TestServer::failing(status);
            let url = server.spawn().await;
            let dl = downloader(&url, "root", Some("bad-token"));
            let results = start(&dl, 1);
            dl.add(ObjectId::new("id1"));

            let end = tokio::time::timeout(Duration::from_secs(5), results.next())
                .await
                .unwrap();
            assert!(end.is_none());
            assert_eq!(dl.take_error(), Some(DownloadError::AccessDenied));
            dl.dispose_async().await;
        }
    }

    #[tokio::test]
    async fn server_error_is_fetch_failed() {
        let server = TestServer::failing(StatusCode::INTERNAL_SERVER_ERROR);
        let url = server.spawn().await;
        let dl = downloader(&url, "root", None);
        let results = start(&dl, 1);
        dl.add(ObjectId::new("id1"));

        let end = tokio::time::timeout(Duration::from_secs(5), results.next())
            .await
            .unwrap();
        assert!(end.is_none());
        assert_eq!(
            dl.take_error(),
            Some(DownloadError::FetchFailed { status: 500 })
        );
        dl.dispose_async().await;
    }

    #[tokio::test]
    async fn sends_bearer_token() {
        let server = TestServer::new(&[("id1", r#"{"id":"id1"}"#)]);
        let url = server.spawn().await;
        let dl = downloader(&url, "root", Some("secret"));
        let results = start(&dl, 1);
        dl.add(ObjectId::new("id1"));
        collect(&results, 1).await;
        assert_eq!(
            *server.auth.lock().unwrap(),
            vec![Some("Bearer secret".to_string())]
        );
        dl.dispose_async().await;
    }

    #[tokio::test]
    async fn downloads_root_directly() {
        let server = TestServer::new(&[("root", r#"{"id":"root","__closure":{"a":1}}"#)]);
        let url = server.spawn().await;

        let root = downloader(&url, "root", None)
            .download_single()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(root.base_id.as_str(), "root");
        assert_eq!(root.base.unwrap().closure().len(), 1);

        let missing = downloader(&url, "nope", None).download_single().await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn pool_lifecycle() {
        let dl = downloader("http://127.0.0.1:9", "root", None);
        dl.add(ObjectId::new("dropped"));
        let results: Arc<dyn Queue<Item>> = Arc::new(AsyncQueue::<Item>::new());
        let options = PoolOptions {
            total: 1,
            max_wait: Duration::from_millis(10),
        };
        dl.initialize_pool(results.clone(), options).unwrap();
        assert_eq!(
            dl.initialize_pool(results.clone(), options),
            Err(DownloadError::AlreadyInitialized)
        );
        dl.dispose_async().await;
        assert_eq!(
            dl.initialize_pool(results, options),
            Err(DownloadError::Disposed)
        );
    }

    #[test]
    fn rejects_invalid_headers() {
        let result = ServerDownloader::new(ServerDownloaderOptions {
            server_url: "http://localhost".into(),
            headers: vec![("bad header".into(), "v".into())],
            ..Default::default()
        });
        assert!(matches!(result, Err(DownloadError::InvalidHeader(_))));
    }
}
