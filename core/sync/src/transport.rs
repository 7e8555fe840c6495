//! Remote API contract and its HTTP implementation.

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::debug;
use url::Url;

use metapm_common::{Action, EntityKind, Error, Result};
use metapm_storage::PendingOperation;

use crate::connectivity::ReachabilityProbe;

/// Characters escaped inside a single path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'\\')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// HTTP method of a remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl fmt::Display for ApiMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ApiMethod::Get => "GET",
            ApiMethod::Post => "POST",
            ApiMethod::Put => "PUT",
            ApiMethod::Delete => "DELETE",
        };
        write!(f, "{}", name)
    }
}

/// A single remote call derived from a queue entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: ApiMethod,
    /// Absolute path, e.g. `/api/tasks/42`.
    pub path: String,
    pub body: Option<Value>,
}

impl ApiRequest {
    /// Map a queue entry to exactly one remote call.
    ///
    /// CREATE → POST to the collection; UPDATE → PUT to the record;
    /// DELETE → DELETE of the record. Update and delete address the record by
    /// the identifier carried in the payload.
    ///
    /// # Errors
    /// - `UnknownOperation` if the operation name is outside the known set
    /// - `InvalidInput` if an update/delete payload has no identifier
    pub fn for_operation(op: &PendingOperation) -> Result<Self> {
        let kind = op.kind()?;
        let entity = kind.entity;

        let request = match kind.action {
            Action::Create => Self {
                method: ApiMethod::Post,
                path: entity.collection_path().to_string(),
                body: Some(op.payload.clone()),
            },
            Action::Update => Self {
                method: ApiMethod::Put,
                path: record_path(entity, &op.payload)?,
                body: Some(op.payload.clone()),
            },
            Action::Delete => Self {
                method: ApiMethod::Delete,
                path: record_path(entity, &op.payload)?,
                body: None,
            },
        };
        Ok(request)
    }

    /// Fetch the full collection of a kind.
    pub fn list(entity: EntityKind) -> Self {
        Self {
            method: ApiMethod::Get,
            path: entity.collection_path().to_string(),
            body: None,
        }
    }
}

fn record_path(entity: EntityKind, payload: &Value) -> Result<String> {
    let id = entity.record_id(payload)?;
    // URL parsing resolves these as dot segments, escaped or not.
    if id == "." || id == ".." {
        return Err(Error::InvalidInput(format!(
            "{} identifier '{}' cannot address a record",
            entity, id
        )));
    }
    let encoded = utf8_percent_encode(&id, SEGMENT).to_string();
    Ok(entity.item_path(&encoded))
}

/// Pull the record array out of a collection listing.
///
/// Listings are either a bare array or an object with the array under the
/// table name (`{"tasks": [...]}`).
pub fn unwrap_collection(entity: EntityKind, body: Value) -> Result<Vec<Value>> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove(entity.table()) {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(Error::Serialization(format!(
                "{} listing has no '{}' array",
                entity,
                entity.table()
            ))),
        },
        other => Err(Error::Serialization(format!(
            "Unexpected {} listing: {}",
            entity, other
        ))),
    }
}

/// Transport for remote API calls.
///
/// Implementations must classify unreachable or timed-out calls as
/// `Error::Network` and non-success responses as `Error::Http`.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Perform one call. Returns the JSON body, if the response had one.
    async fn send(&self, request: &ApiRequest) -> Result<Option<Value>>;

    /// Fetch every record of a kind.
    async fn fetch_collection(&self, entity: EntityKind) -> Result<Vec<Value>> {
        let body = self
            .send(&ApiRequest::list(entity))
            .await?
            .ok_or_else(|| Error::Serialization(format!("Empty {} listing", entity)))?;
        unwrap_collection(entity, body)
    }
}

/// reqwest-backed transport and reachability probe.
pub struct HttpTransport {
    http: Client,
    base_url: Url,
    health_path: String,
}

impl HttpTransport {
    /// Create a transport for the service at `base_url`.
    ///
    /// Every call, including the probe, is bounded by `timeout`.
    ///
    /// # Errors
    /// - `Config` if the base URL does not parse
    /// - `Network` if the HTTP client cannot be built
    pub fn new(base_url: &str, health_path: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("Invalid base URL '{}': {}", base_url, e)))?;

        let http = Client::builder()
            .user_agent(concat!("metapm-offline/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            health_path: health_path.to_string(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::InvalidInput(format!("Invalid request path '{}': {}", path, e)))
    }

    /// Handle API response with error checking.
    async fn handle_response(
        &self,
        request: &ApiRequest,
        response: reqwest::Response,
    ) -> Result<Option<Value>> {
        let status = response.status();
        let body = if status.is_success() {
            response
                .text()
                .await
                .map_err(|e| Error::Network(format!("Failed to read response: {}", e)))?
        } else {
            response.text().await.unwrap_or_default()
        };
        classify_response(request, status, body)
    }
}

/// Turn a response status and body into the call's outcome.
fn classify_response(
    request: &ApiRequest,
    status: StatusCode,
    body: String,
) -> Result<Option<Value>> {
    // A record already gone remotely is what a delete asked for.
    if request.method == ApiMethod::Delete && status == StatusCode::NOT_FOUND {
        debug!("{} {} already absent remotely", request.method, request.path);
        return Ok(None);
    }

    if !status.is_success() {
        return Err(Error::Http {
            status: status.as_u16(),
            body,
        });
    }

    if body.trim().is_empty() {
        return Ok(None);
    }

    match serde_json::from_str(&body) {
        Ok(value) => Ok(Some(value)),
        Err(e) if request.method == ApiMethod::Get => Err(Error::Serialization(format!(
            "Failed to parse response: {}",
            e
        ))),
        Err(_) => Ok(None),
    }
}

/// Any answer short of a server error proves the service is reachable.
fn health_outcome(status: StatusCode) -> Result<()> {
    if status.is_server_error() {
        return Err(Error::Http {
            status: status.as_u16(),
            body: String::new(),
        });
    }
    Ok(())
}

fn network_error(action: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Network(format!("{} timed out", action))
    } else {
        Error::Network(format!("{} failed: {}", action, err))
    }
}

#[async_trait]
impl RemoteTransport for HttpTransport {
    async fn send(&self, request: &ApiRequest) -> Result<Option<Value>> {
        let url = self.url(&request.path)?;
        let method = match request.method {
            ApiMethod::Get => Method::GET,
            ApiMethod::Post => Method::POST,
            ApiMethod::Put => Method::PUT,
            ApiMethod::Delete => Method::DELETE,
        };
        debug!("{} {}", request.method, url);

        let mut builder = self.http.request(method, url);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| network_error(&format!("{} {}", request.method, request.path), e))?;

        self.handle_response(request, response).await
    }
}

#[async_trait]
impl ReachabilityProbe for HttpTransport {
    async fn check(&self) -> Result<()> {
        let url = self.url(&self.health_path)?;
        let response = self
            .http
            .head(url)
            .header(reqwest::header::CACHE_CONTROL, "no-store")
            .send()
            .await
            .map_err(|e| network_error("Health check", e))?;

        health_outcome(response.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    fn op(operation: &str, payload: Value) -> PendingOperation {
        PendingOperation {
            id: 1,
            operation: operation.to_string(),
            payload,
            enqueued_at: Utc::now(),
            synced: false,
            synced_at: None,
        }
    }

    #[test]
    fn test_route_table() {
        let cases = [
            ("CREATE_TASK", json!({"taskId": 5}), ApiMethod::Post, "/api/tasks"),
            ("UPDATE_TASK", json!({"taskId": 5}), ApiMethod::Put, "/api/tasks/5"),
            ("DELETE_PROJECT", json!({"projectCode": "MPM"}), ApiMethod::Delete, "/api/projects/MPM"),
            ("CREATE_BUG", json!({"bugId": "B-1"}), ApiMethod::Post, "/api/backlog/bugs"),
            ("UPDATE_REQUIREMENT", json!({"requirementId": "R-2"}), ApiMethod::Put, "/api/backlog/requirements/R-2"),
        ];

        for (name, payload, method, path) in cases {
            let request = ApiRequest::for_operation(&op(name, payload)).unwrap();
            assert_eq!(request.method, method, "{name}");
            assert_eq!(request.path, path, "{name}");
        }
    }

    #[test]
    fn test_delete_has_no_body() {
        let request =
            ApiRequest::for_operation(&op("DELETE_BUG", json!({"bugId": "B-9"}))).unwrap();
        assert!(request.body.is_none());

        let request =
            ApiRequest::for_operation(&op("CREATE_TASK", json!({"taskId": 1, "title": "t"})))
                .unwrap();
        assert_eq!(request.body, Some(json!({"taskId": 1, "title": "t"})));
    }

    #[test]
    fn test_identifier_is_path_encoded() {
        let request =
            ApiRequest::for_operation(&op("UPDATE_PROJECT", json!({"projectCode": "A/B C"})))
                .unwrap();
        assert_eq!(request.path, "/api/projects/A%2FB%20C");
    }

    #[test]
    fn test_identifier_stays_one_segment() {
        let base = Url::parse("http://pm.example").unwrap();

        let request =
            ApiRequest::for_operation(&op("DELETE_PROJECT", json!({"projectCode": "A\\B"})))
                .unwrap();
        assert_eq!(request.path, "/api/projects/A%5CB");
        assert_eq!(base.join(&request.path).unwrap().path(), "/api/projects/A%5CB");

        let request =
            ApiRequest::for_operation(&op("UPDATE_TASK", json!({"taskId": "..x"}))).unwrap();
        assert_eq!(base.join(&request.path).unwrap().path(), "/api/tasks/..x");

        for id in [".", ".."] {
            let err = ApiRequest::for_operation(&op("DELETE_PROJECT", json!({"projectCode": id})))
                .unwrap_err();
            assert!(matches!(err, Error::InvalidInput(_)), "{id}");
        }
    }

    #[test]
    fn test_unknown_and_malformed_operations() {
        let err = ApiRequest::for_operation(&op("ARCHIVE_TASK", json!({}))).unwrap_err();
        assert!(matches!(err, Error::UnknownOperation(_)));

        let err = ApiRequest::for_operation(&op("UPDATE_TASK", json!({"title": "x"}))).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_unwrap_collection_envelopes() {
        let items = unwrap_collection(
            EntityKind::Bug,
            json!({"bugs": [{"bugId": "B-1"}], "count": 1}),
        )
        .unwrap();
        assert_eq!(items.len(), 1);

        let items = unwrap_collection(EntityKind::Task, json!([{"taskId": 1}, {"taskId": 2}]))
            .unwrap();
        assert_eq!(items.len(), 2);

        assert!(unwrap_collection(EntityKind::Project, json!({"count": 0})).is_err());
    }

    fn request(method: ApiMethod) -> ApiRequest {
        ApiRequest {
            method,
            path: "/api/tasks/1".to_string(),
            body: None,
        }
    }

    #[test]
    fn test_classify_response() {
        let delete = request(ApiMethod::Delete);
        let put = request(ApiMethod::Put);
        let get = request(ApiMethod::Get);

        assert_eq!(
            classify_response(&delete, StatusCode::NOT_FOUND, "gone".into()).unwrap(),
            None
        );
        assert_eq!(
            classify_response(&delete, StatusCode::NO_CONTENT, String::new()).unwrap(),
            None
        );
        assert_eq!(
            classify_response(&put, StatusCode::OK, "{\"taskId\": 1}".into()).unwrap(),
            Some(json!({"taskId": 1}))
        );
        assert_eq!(
            classify_response(&put, StatusCode::OK, "saved".into()).unwrap(),
            None
        );

        let err = classify_response(&get, StatusCode::OK, "<html>".into()).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));

        match classify_response(&put, StatusCode::NOT_FOUND, "missing".into()) {
            Err(Error::Http { status, body }) => {
                assert_eq!(status, 404);
                assert_eq!(body, "missing");
            }
            other => panic!("expected Http error, got {:?}", other),
        }
        let err =
            classify_response(&put, StatusCode::INTERNAL_SERVER_ERROR, String::new()).unwrap_err();
        assert!(matches!(err, Error::Http { status: 500, .. }));
    }

    #[test]
    fn test_health_outcome() {
        assert!(health_outcome(StatusCode::OK).is_ok());
        assert!(health_outcome(StatusCode::NOT_FOUND).is_ok());
        assert!(health_outcome(StatusCode::METHOD_NOT_ALLOWED).is_ok());
        let err = health_outcome(StatusCode::SERVICE_UNAVAILABLE).unwrap_err();
        assert!(matches!(err, Error::Http { status: 503, .. }));
    }

    /// Serve one raw HTTP response; the request head is sent back on the channel.
    async fn stub_server(response: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (head_tx, head_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut chunk = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&chunk[..n]);
            }
            let _ = head_tx.send(String::from_utf8_lossy(&head).into_owned());
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });

        (format!("http://{}", addr), head_rx)
    }

    fn transport(base_url: &str, timeout: Duration) -> HttpTransport {
        HttpTransport::new(base_url, "/api/health", timeout).unwrap()
    }

    #[tokio::test]
    async fn test_delete_of_missing_record_succeeds() {
        let (base, head) =
            stub_server("HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await;
        let delete =
            ApiRequest::for_operation(&op("DELETE_PROJECT", json!({"projectCode": "A\\B"})))
                .unwrap();

        let body = transport(&base, Duration::from_secs(5)).send(&delete).await.unwrap();
        assert_eq!(body, None);
        assert!(head
            .await
            .unwrap()
            .starts_with("DELETE /api/projects/A%5CB HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_no_content_reply_succeeds() {
        let (base, _head) =
            stub_server("HTTP/1.1 204 No Content\r\nconnection: close\r\n\r\n").await;
        let delete =
            ApiRequest::for_operation(&op("DELETE_TASK", json!({"taskId": 4}))).unwrap();

        let body = transport(&base, Duration::from_secs(5)).send(&delete).await.unwrap();
        assert_eq!(body, None);
    }

    #[tokio::test]
    async fn test_server_error_reply_is_http_error() {
        let (base, _head) = stub_server(
            "HTTP/1.1 500 Internal Server Error\r\ncontent-length: 4\r\nconnection: close\r\n\r\nboom",
        )
        .await;
        let get = ApiRequest::list(EntityKind::Task);

        match transport(&base, Duration::from_secs(5)).send(&get).await {
            Err(Error::Http { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("expected Http error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_health_check_over_http() {
        let (base, head) = stub_server(
            "HTTP/1.1 405 Method Not Allowed\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;
        assert!(transport(&base, Duration::from_secs(5)).check().await.is_ok());
        assert!(head.await.unwrap().starts_with("HEAD /api/health HTTP/1.1"));

        let (base, _head) = stub_server(
            "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;
        let err = transport(&base, Duration::from_secs(5)).check().await.unwrap_err();
        assert!(matches!(err, Error::Http { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_unanswered_call_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        // Accept and hold the connection without ever replying.
        let silent = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(socket);
        });

        let err = transport(&base, Duration::from_millis(200))
            .send(&ApiRequest::list(EntityKind::Bug))
            .await
            .unwrap_err();
        match err {
            Error::Network(message) => assert!(message.contains("timed out"), "{message}"),
            other => panic!("expected Network error, got {:?}", other),
        }
        silent.abort();
    }

    #[test]
    fn test_http_transport_rejects_bad_base_url() {
        let err = HttpTransport::new("not a url", "/health", Duration::from_secs(1))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }
}
