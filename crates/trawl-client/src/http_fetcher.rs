use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use trawl_core::traits::HttpFetcher;
use trawl_core::{Error, JobLike, Response};
use trawl_proxy::Rotator;

/// Plain HTTP fetcher backed by reqwest.
///
/// Issues one request per [`HttpFetcher::fetch`] call, decodes gzip
/// transparently and records the final URL after redirects. Transport
/// failures come back inside the response envelope; the engine owns retry.
#[derive(Clone)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
    rotator: Option<Arc<Rotator>>,
}

impl ReqwestFetcher {
    /// Default client: 30 s timeout, cookies shared across requests.
    pub fn new() -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Fetch(e.to_string()))?;

        Ok(Self {
            client,
            rotator: None,
        })
    }

    /// Use a caller-configured client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            rotator: None,
        }
    }

    /// Route every request through the next proxy in rotation.
    pub fn with_rotator(mut self, rotator: Arc<Rotator>) -> Self {
        self.rotator = Some(rotator);
        self
    }

    fn client_for_request(&self) -> Result<reqwest::Client, Error> {
        match &self.rotator {
            Some(rotator) => rotator.next_client(),
            None => Ok(self.client.clone()),
        }
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn fetch(&self, job: &dyn JobLike) -> Response {
        let started = Instant::now();

        let client = match self.client_for_request() {
            Ok(client) => client,
            Err(e) => return Response::from_error(e.to_string()),
        };

        let method = match reqwest::Method::from_bytes(job.method().as_bytes()) {
            Ok(method) => method,
            Err(_) => return Response::from_error(format!("invalid method {}", job.method())),
        };

        let mut request = client.request(method, job.full_url());

        for (name, value) in job.headers() {
            request = request.header(name, value);
        }

        if !job.body().is_empty() {
            request = request.body(Bytes::copy_from_slice(job.body()));
        }

        if let Some(deadline) = job.timeout() {
            if !deadline.is_zero() {
                request = request.timeout(deadline);
            }
        }

        let reply = match request.send().await {
            Ok(reply) => reply,
            Err(e) => return Response::from_error(e.to_string()),
        };

        let status = reply.status().as_u16();
        let final_url = reply.url().to_string();
        let headers = reply
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    v.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();

        // reqwest strips the Content-Encoding header and inflates gzip
        // bodies before this read.
        let body = match reply.bytes().await {
            Ok(body) => body.to_vec(),
            Err(e) => return Response::from_error(e.to_string()),
        };

        Response {
            url: final_url,
            status,
            headers,
            duration: started.elapsed(),
            body,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use trawl_core::{Job, JobRef};

    use super::*;

    /// One-shot HTTP server returning a canned response.
    async fn serve_once(response: Vec<u8>) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            // Read the full head plus any Content-Length body.
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);

                let text = String::from_utf8_lossy(&request);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let body_len = text
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length: "))
                        .or_else(|| text.lines().find_map(|l| l.strip_prefix("Content-Length: ")))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + body_len {
                        break;
                    }
                }
            }
            let request = String::from_utf8_lossy(&request).into_owned();

            stream.write_all(&response).await.unwrap();
            stream.shutdown().await.unwrap();
            request
        });

        (format!("http://{addr}"), handle)
    }

    #[tokio::test]
    async fn fetch_returns_status_headers_and_body() {
        let (url, server) = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\nX-Probe: yes\r\n\r\ntest".to_vec(),
        )
        .await;

        let fetcher = ReqwestFetcher::new().unwrap();
        let job: JobRef = std::sync::Arc::new(Job::new("GET", &url));

        let response = fetcher.fetch(job.as_ref()).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"test");
        assert_eq!(response.headers.get("x-probe").map(String::as_str), Some("yes"));
        assert!(response.error.is_none());
        assert!(response.url.starts_with("http://127.0.0.1"));

        let _ = server.await.unwrap();
    }

    #[tokio::test]
    async fn fetch_decodes_gzip_bodies() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"compressed payload").unwrap();
        let gz = encoder.finish().unwrap();

        let mut canned = format!(
            "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
            gz.len()
        )
        .into_bytes();
        canned.extend_from_slice(&gz);

        let (url, server) = serve_once(canned).await;

        let fetcher = ReqwestFetcher::new().unwrap();
        let job: JobRef = std::sync::Arc::new(Job::new("GET", &url));

        let response = fetcher.fetch(job.as_ref()).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"compressed payload");

        let _ = server.await.unwrap();
    }

    #[tokio::test]
    async fn fetch_sends_headers_body_and_sorted_params() {
        let (url, server) =
            serve_once(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n".to_vec()).await;

        let mut headers = HashMap::new();
        headers.insert("x-token".to_string(), "secret".to_string());

        let job: JobRef = std::sync::Arc::new(Job {
            method: "POST".into(),
            url,
            url_params: vec![("b".into(), "2".into()), ("a".into(), "1".into())],
            headers,
            body: b"payload".to_vec(),
            ..Default::default()
        });

        let fetcher = ReqwestFetcher::new().unwrap();
        let response = fetcher.fetch(job.as_ref()).await;
        assert_eq!(response.status, 204);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /?a=1&b=2 HTTP/1.1\r\n"), "{request}");
        assert!(request.contains("x-token: secret"));
        assert!(request.ends_with("payload"));
    }

    #[tokio::test]
    async fn transport_error_lands_in_the_envelope() {
        // Nothing listens on this port.
        let fetcher = ReqwestFetcher::new().unwrap();
        let job: JobRef = std::sync::Arc::new(Job::new("GET", "http://127.0.0.1:1"));

        let response = fetcher.fetch(job.as_ref()).await;
        assert_eq!(response.status, 0);
        assert!(response.error.is_some());
    }
}
