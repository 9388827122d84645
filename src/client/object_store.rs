//! HTTP client for the object store: HEAD/GET/POST of content-addressed
//! chunks and POST of snapshot records.

use std::io::{self};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::{bail, format_err, Error};
use bytes::Bytes;
use http::{Request, StatusCode};
use hyper::client::{Client, HttpConnector};
use hyper::{Body, Uri};
use openssl::ssl::{SslConnector, SslMethod};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

use crate::hash::Sha256Digest;

const USER_AGENT: &str = "backup-agent/1.0";

/// Whether the previous `HEAD`/`GET` confirms the object exists.
pub enum Presence {
    Present,
    Absent,
}

/// Async client over `hyper` + `tokio-openssl`, talking to one object-store
/// base URL.
#[derive(Clone)]
pub struct ObjectStoreClient {
    client: Client<HttpsConnector, Body>,
    base_url: String,
}

impl ObjectStoreClient {
    pub fn new(base_url: String) -> Self {
        let ssl_connector = SslConnector::builder(SslMethod::tls()).unwrap().build();
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        let connector = HttpsConnector {
            http,
            ssl_connector,
        };
        let client = Client::builder().build(connector);
        Self { client, base_url }
    }

    fn object_uri(&self, digest: &Sha256Digest) -> Result<Uri, Error> {
        format!("{}/object/{}", self.base_url, digest.to_hex())
            .parse()
            .map_err(Error::from)
    }

    fn snapshot_uri(&self, device_id: &str) -> Result<Uri, Error> {
        format!("{}/snapshot/{}", self.base_url, device_id)
            .parse()
            .map_err(Error::from)
    }

    /// `HEAD /object/{hex}`; `204` means present, `404` means absent, any
    /// other status is a permanent failure.
    pub async fn head_object(&self, digest: &Sha256Digest) -> Result<Presence, Error> {
        let request = Request::builder()
            .method("HEAD")
            .uri(self.object_uri(digest)?)
            .header(hyper::header::USER_AGENT, USER_AGENT)
            .body(Body::empty())?;
        let response = self.send_with_retry(request).await?;
        match response.status() {
            StatusCode::NO_CONTENT => Ok(Presence::Present),
            StatusCode::NOT_FOUND => Ok(Presence::Absent),
            status => Err(permanent_failure(status, Bytes::new())),
        }
    }

    /// `GET /object/{hex}`; `404` surfaces as `Ok(None)`.
    pub async fn get_object(&self, digest: &Sha256Digest) -> Result<Option<Vec<u8>>, Error> {
        let request = Request::builder()
            .method("GET")
            .uri(self.object_uri(digest)?)
            .header(hyper::header::USER_AGENT, USER_AGENT)
            .body(Body::empty())?;
        let response = self.send_with_retry(request).await?;
        match response.status() {
            StatusCode::OK => {
                let body = hyper::body::to_bytes(response.into_body()).await?;
                Ok(Some(body.to_vec()))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => {
                let body = hyper::body::to_bytes(response.into_body())
                    .await
                    .unwrap_or_default();
                Err(permanent_failure(status, body))
            }
        }
    }

    /// `POST /object/{hex}` with the raw chunk bytes; idempotent for
    /// identical content.
    pub async fn post_object(&self, digest: &Sha256Digest, bytes: Vec<u8>) -> Result<(), Error> {
        let request = Request::builder()
            .method("POST")
            .uri(self.object_uri(digest)?)
            .header(hyper::header::USER_AGENT, USER_AGENT)
            .header(hyper::header::CONTENT_TYPE, "application/octet-stream")
            .body(Body::from(bytes))?;
        let response = self.send_with_retry(request).await?;
        match response.status() {
            StatusCode::CREATED => Ok(()),
            status => {
                let body = hyper::body::to_bytes(response.into_body())
                    .await
                    .unwrap_or_default();
                Err(permanent_failure(status, body))
            }
        }
    }

    /// `POST /snapshot/{device-id}` with the XML snapshot body of §6.
    pub async fn post_snapshot(
        &self,
        device_id: &str,
        kind: &str,
        size: u64,
        hash_seq: &[Sha256Digest],
    ) -> Result<(), Error> {
        let mut body = format!("<snapshot kind=\"{}\" size=\"{}\">", kind, size);
        for digest in hash_seq {
            body.push_str(&format!("<hash>{}</hash>", digest.to_hex()));
        }
        body.push_str("</snapshot>");

        let request = Request::builder()
            .method("POST")
            .uri(self.snapshot_uri(device_id)?)
            .header(hyper::header::USER_AGENT, USER_AGENT)
            .header(hyper::header::CONTENT_TYPE, "application/xml")
            .body(Body::from(body))?;
        let response = self.send_with_retry(request).await?;
        match response.status() {
            StatusCode::CREATED => Ok(()),
            status => {
                let body = hyper::body::to_bytes(response.into_body())
                    .await
                    .unwrap_or_default();
                Err(permanent_failure(status, body))
            }
        }
    }

    /// Retries indefinitely on transport errors and 5xx, with exponential
    /// backoff capped at a few seconds; any other status is returned for
    /// the caller to classify. Requests in this client never carry more
    /// than a small chunk or snapshot body, so it's buffered once up front
    /// and replayed byte-for-byte on every attempt, including the first.
    async fn send_with_retry(&self, request: Request<Body>) -> Result<hyper::Response<Body>, Error> {
        let (parts, body) = request.into_parts();
        let body = hyper::body::to_bytes(body).await?;

        let mut backoff = Duration::from_millis(200);
        const MAX_BACKOFF: Duration = Duration::from_secs(8);
        loop {
            let attempt = rebuild_request(&parts, body.clone());
            match self.client.request(attempt).await {
                Ok(response) if response.status().is_server_error() => {
                    log::warn!("object store returned {}, retrying", response.status());
                }
                Ok(response) => return Ok(response),
                Err(err) => {
                    log::warn!("object store request failed: {}, retrying", err);
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
        }
    }
}

fn rebuild_request(parts: &http::request::Parts, body: Bytes) -> Request<Body> {
    let mut builder = Request::builder()
        .method(parts.method.clone())
        .uri(parts.uri.clone());
    for (name, value) in &parts.headers {
        builder = builder.header(name, value);
    }
    builder.body(Body::from(body)).expect("rebuild retried request")
}

fn permanent_failure(status: StatusCode, body: Bytes) -> Error {
    format_err!(
        "object store returned permanent failure {}: {}",
        status,
        String::from_utf8_lossy(&body)
    )
}

/// Wraps a plain or TLS-upgraded TCP stream behind one `AsyncRead`/`AsyncWrite`
/// type so `hyper::client::conn` can drive either uniformly.
enum Stream {
    Plain(TcpStream),
    Tls(Box<SslStream<TcpStream>>),
}

impl AsyncRead for Stream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

impl hyper::client::connect::Connection for Stream {
    fn connected(&self) -> hyper::client::connect::Connected {
        hyper::client::connect::Connected::new()
    }
}

/// A minimal `hyper::service::Service<Uri>` that dials plain TCP for `http`
/// and upgrades to TLS via `tokio-openssl` for `https`. No proxy support:
/// the object store is talked to directly, unlike the teacher's client
/// which also tunnels through an optional HTTP proxy.
#[derive(Clone)]
struct HttpsConnector {
    http: HttpConnector,
    ssl_connector: SslConnector,
}

impl hyper::service::Service<Uri> for HttpsConnector {
    type Response = Stream;
    type Error = Error;
    #[allow(clippy::type_complexity)]
    type Future = Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        use tower_service::Service;
        Service::poll_ready(&mut self.http, cx).map_err(Error::from)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let mut http = self.http.clone();
        let ssl_connector = self.ssl_connector.clone();
        let is_https = dst.scheme() == Some(&http::uri::Scheme::HTTPS);
        let host = dst.host().unwrap_or("").to_owned();

        Box::pin(async move {
            use tower_service::Service;
            let tcp = Service::call(&mut http, dst)
                .await
                .map_err(|err| format_err!("connect failed: {}", err))?;
            if !is_https {
                return Ok(Stream::Plain(tcp));
            }
            let config = ssl_connector.configure()?;
            let ssl = config.into_ssl(&host)?;
            let mut tls = SslStream::new(ssl, tcp)?;
            Pin::new(&mut tls).connect().await?;
            Ok(Stream::Tls(Box::new(tls)))
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn object_uri_is_hex_keyed() {
        let client = ObjectStoreClient::new("https://store.example".to_string());
        let digest = Sha256Digest::hash(b"abc");
        let uri = client.object_uri(&digest).unwrap();
        assert_eq!(uri.path(), format!("/object/{}", digest.to_hex()));
    }

    #[test]
    fn snapshot_uri_includes_device_id() {
        let client = ObjectStoreClient::new("https://store.example".to_string());
        let uri = client.snapshot_uri("dev-1").unwrap();
        assert_eq!(uri.path(), "/snapshot/dev-1");
    }
}
