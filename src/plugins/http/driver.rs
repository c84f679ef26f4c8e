use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;

use crate::plugins::registry::{DriverContext, Downloader};

#[derive(thiserror::Error, Debug)]
pub enum HttpDriverError {
    #[error("http status error: {0}")]
    Status(StatusCode),
}

pub struct HttpDriver {
    client: reqwest::Client,
    ctx: DriverContext,
}

impl HttpDriver {
    pub fn new(ctx: DriverContext) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_str(&ctx.user_agent)?);
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(ctx.timeout_secs))
            .build()?;
        Ok(Self { client, ctx })
    }

    fn should_retry_status(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
            || status.is_server_error()
    }

    async fn sleep_backoff(&self, attempt: u32) {
        let base = self.ctx.retry_backoff_ms.max(1);
        let shift = attempt.min(16);
        let mul = 1u64 << shift;
        let ms = base.saturating_mul(mul).min(30_000);
        sleep(Duration::from_millis(ms)).await;
    }

    async fn get_with_retry(&self, url: &str, timeout: Option<Duration>) -> anyhow::Result<reqwest::Response> {
        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 0..=self.ctx.retries {
            if attempt > 0 {
                self.sleep_backoff(attempt - 1).await;
            }

            let mut req = self.client.get(url);
            if let Some(t) = timeout {
                req = req.timeout(t);
            }
            let resp = match req.send().await {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!(url, attempt, error = %e, "request failed");
                    last_err = Some(e.into());
                    continue;
                }
            };

            let status = resp.status();
            if status.is_success() {
                return Ok(resp);
            }
            if Self::should_retry_status(status) {
                tracing::debug!(url, attempt, %status, "retryable status");
                last_err = Some(HttpDriverError::Status(status).into());
                continue;
            }
            return Err(HttpDriverError::Status(status).into());
        }

        Err(last_err.unwrap_or_else(|| HttpDriverError::Status(StatusCode::REQUEST_TIMEOUT).into()))
    }

    /// GET a small text document, such as the manifest.
    pub async fn fetch_text(&self, url: &str) -> anyhow::Result<String> {
        let resp = self
            .get_with_retry(url, Some(Duration::from_secs(self.ctx.timeout_secs)))
            .await?;
        Ok(resp.text().await?)
    }
}

/// In-progress name: the full file name plus `.partial`, so `c2.zip` and `c2.pwr`
/// never share a scratch file.
fn partial_path(dest_dir: &Path, file_name: &str) -> PathBuf {
    dest_dir.join(format!("{}.partial", file_name))
}

async fn stream_to_file(resp: reqwest::Response, url: &str, partial: &Path) -> anyhow::Result<u64> {
    use anyhow::Context;

    let mut file = tokio::fs::File::create(partial)
        .await
        .with_context(|| format!("create {}", partial.display()))?;
    let mut stream = resp.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.with_context(|| format!("read body of {}", url))?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

#[async_trait]
impl Downloader for HttpDriver {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn download(&self, url: &str, dest_dir: &Path, file_name: &str) -> anyhow::Result<PathBuf> {
        use anyhow::Context;

        tokio::fs::create_dir_all(dest_dir)
            .await
            .with_context(|| format!("create_dir_all {}", dest_dir.display()))?;
        let target = dest_dir.join(file_name);
        let partial = partial_path(dest_dir, file_name);

        let resp = self.get_with_retry(url, None).await?;
        let total = resp.content_length();
        tracing::info!(url, ?total, target = %target.display(), "downloading");

        let written = match stream_to_file(resp, url, &partial).await {
            Ok(n) => n,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e);
            }
        };

        if let Some(t) = total {
            if written != t {
                let _ = tokio::fs::remove_file(&partial).await;
                anyhow::bail!("short body for {}: {} of {} bytes", url, written, t);
            }
        }

        if tokio::fs::metadata(&target).await.is_ok() {
            let _ = tokio::fs::remove_file(&target).await;
        }
        tokio::fs::rename(&partial, &target).await?;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Serve one connection: read the request head, then write `response` and close.
    async fn serve_once(response: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                match sock.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => head.extend_from_slice(&buf[..n]),
                }
            }
            let _ = sock.write_all(&response).await;
            let _ = sock.shutdown().await;
        });
        format!("http://{}/file", addr)
    }

    fn quick_driver() -> HttpDriver {
        let ctx = DriverContext { timeout_secs: 5, retries: 0, retry_backoff_ms: 1, ..DriverContext::default() };
        HttpDriver::new(ctx).unwrap()
    }

    #[test]
    fn partial_name_keeps_the_extension() {
        let dir = Path::new("/tmp/dl");
        assert_eq!(partial_path(dir, "c2.zip"), dir.join("c2.zip.partial"));
        assert_ne!(partial_path(dir, "c2.zip"), partial_path(dir, "c2.pwr"));
    }

    #[tokio::test]
    async fn download_finishes_without_leftovers() {
        let url = serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello".to_vec()).await;
        let dir = tempfile::tempdir().unwrap();

        let path = quick_driver().download(&url, dir.path(), "c2.zip").await.unwrap();
        assert_eq!(path, dir.path().join("c2.zip"));
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
        assert!(!dir.path().join("c2.zip.partial").exists());
    }

    #[tokio::test]
    async fn truncated_body_leaves_no_partial_file() {
        let url = serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\nConnection: close\r\n\r\nshort".to_vec()).await;
        let dir = tempfile::tempdir().unwrap();

        assert!(quick_driver().download(&url, dir.path(), "c2.zip").await.is_err());
        assert!(!dir.path().join("c2.zip").exists());
        assert!(!dir.path().join("c2.zip.partial").exists());
    }

    #[test]
    fn retries_only_transient_statuses() {
        assert!(HttpDriver::should_retry_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(HttpDriver::should_retry_status(StatusCode::BAD_GATEWAY));
        assert!(!HttpDriver::should_retry_status(StatusCode::NOT_FOUND));
        assert!(!HttpDriver::should_retry_status(StatusCode::FORBIDDEN));
    }

    #[tokio::test]
    async fn unreachable_host_fails_after_retries() {
        let ctx = DriverContext { timeout_secs: 1, retries: 1, retry_backoff_ms: 1, ..DriverContext::default() };
        let driver = HttpDriver::new(ctx).unwrap();
        let dir = tempfile::tempdir().unwrap();

        let res = driver.download("http://127.0.0.1:9/none.zip", dir.path(), "none.zip").await;
        assert!(res.is_err());
        assert!(!dir.path().join("none.zip").exists());
    }
}
