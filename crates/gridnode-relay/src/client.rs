//! Minimal HTTP/1.1 client over hyper.
//!
//! One connection per request. Plain `http://` only.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use tracing::debug;
use url::Url;

use gridnode_core::HttpMethod;

use crate::error::{RelayError, RelayResult};

/// Status and body of an upstream response.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Send one request and read the whole response body.
pub async fn send(
    method: HttpMethod,
    url: &Url,
    body: Vec<u8>,
    timeout: Duration,
) -> RelayResult<HttpResponse> {
    if url.scheme() != "http" {
        return Err(RelayError::UnsupportedUrl(url.to_string()));
    }
    let host = url
        .host_str()
        .ok_or_else(|| RelayError::UnsupportedUrl(url.to_string()))?;
    let port = url.port_or_known_default().unwrap_or(80);
    let address = format!("{host}:{port}");

    let mut target = url.path().to_string();
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }

    let exchange = async {
        let stream = tokio::net::TcpStream::connect(&address)
            .await
            .map_err(|source| RelayError::Connect {
                address: address.clone(),
                source,
            })?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = http::Request::builder()
            .method(to_http_method(method))
            .uri(&target)
            .header("host", &address)
            .header("user-agent", concat!("gridnode-relay/", env!("CARGO_PKG_VERSION")))
            .header("accept", "application/json");
        if !body.is_empty() {
            builder = builder.header("content-type", "application/json; charset=utf-8");
        }
        let request = builder.body(Full::new(Bytes::from(body)))?;

        let response = sender.send_request(request).await?;
        let status = response.status().as_u16();
        let body = response.into_body().collect().await?.to_bytes().to_vec();
        debug!(%method, %url, status, "relay request complete");
        Ok::<_, RelayError>(HttpResponse { status, body })
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::Timeout(url.to_string())),
    }
}

/// `path` appended to the base path of `base`.
pub fn endpoint(base: &Url, path: &str) -> Url {
    let mut url = base.clone();
    let prefix = base.path().trim_end_matches('/');
    url.set_path(&format!("{prefix}{path}"));
    url.set_query(None);
    url.set_fragment(None);
    url
}

fn to_http_method(method: HttpMethod) -> http::Method {
    match method {
        HttpMethod::Get => http::Method::GET,
        HttpMethod::Post => http::Method::POST,
        HttpMethod::Delete => http::Method::DELETE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_keeps_base_path() {
        let base = Url::parse("http://relay:4723/wd/hub/").unwrap();
        assert_eq!(
            endpoint(&base, "/session").as_str(),
            "http://relay:4723/wd/hub/session"
        );

        let root = Url::parse("http://relay:4723").unwrap();
        assert_eq!(
            endpoint(&root, "/session/abc/url").as_str(),
            "http://relay:4723/session/abc/url"
        );
    }

    #[tokio::test]
    async fn https_is_rejected() {
        let url = Url::parse("https://relay.example.com/status").unwrap();
        let result = send(HttpMethod::Get, &url, Vec::new(), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(RelayError::UnsupportedUrl(_))));
    }

    #[tokio::test]
    async fn connection_refused_is_reported() {
        // Bind then drop to get a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let url = Url::parse(&format!("http://127.0.0.1:{port}/status")).unwrap();
        let result = send(HttpMethod::Get, &url, Vec::new(), Duration::from_secs(2)).await;
        assert!(matches!(result, Err(RelayError::Connect { .. })));
    }
}
