use crate::config::UpsizerConfig;
use crate::inspect::ImageRecord;
use crate::{fetch, upload, Result, UpsizerError};
use std::io::Read;
use std::path::Path;

/// Network collaborators of the discovery pipeline.
pub trait SearchTransport: Send + Sync {
    /// Submits the image to the search endpoint; returns the raw response.
    fn upload(&self, image_path: &Path) -> Result<Vec<u8>>;

    /// Plain (unrendered) GET of a results page.
    fn fetch_page(&self, url: &str) -> Result<String>;

    /// Downloads a candidate and decodes its header.
    fn fetch_image(&self, url: &str) -> Result<ImageRecord>;
}

pub struct HttpTransport {
    config: UpsizerConfig,
    upload_client: reqwest::blocking::Client,
    search_agent: ureq::Agent,
    image_agent: ureq::Agent,
}

impl HttpTransport {
    pub fn new(config: &UpsizerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: config.clone(),
            upload_client: build_upload_client(config)?,
            search_agent: build_search_agent(config),
            image_agent: build_image_agent(config),
        })
    }
}

impl SearchTransport for HttpTransport {
    fn upload(&self, image_path: &Path) -> Result<Vec<u8>> {
        upload::upload_image(&self.upload_client, &self.config, image_path)
    }

    fn fetch_page(&self, url: &str) -> Result<String> {
        fetch::fetch_page(&self.search_agent, &self.config, url)
    }

    fn fetch_image(&self, url: &str) -> Result<ImageRecord> {
        fetch::fetch_image(&self.image_agent, url, self.config.max_image_bytes)
    }
}

/// Client for the multipart search upload.
pub fn build_upload_client(config: &UpsizerConfig) -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .timeout(config.http_timeout())
        .user_agent(config.upload_user_agent.as_str())
        .build()
        .map_err(|e| UpsizerError::Config(format!("building upload client: {e}")))
}

pub fn build_search_agent(config: &UpsizerConfig) -> ureq::Agent {
    let config = ureq::Agent::config_builder()
        .http_status_as_error(false)
        .timeout_global(Some(config.http_timeout()))
        .user_agent(config.upload_user_agent.as_str())
        .build();
    config.into()
}

/// Agent for the image CDN. With `accept_invalid_certs` it does not verify
/// TLS certificates; callers that need verified downloads must not use it.
pub fn build_image_agent(config: &UpsizerConfig) -> ureq::Agent {
    let mut builder = ureq::Agent::config_builder()
        .http_status_as_error(false)
        .timeout_global(Some(config.http_timeout()))
        .user_agent(config.fetch_user_agent.as_str());
    if config.accept_invalid_certs {
        builder = builder.tls_config(
            ureq::tls::TlsConfig::builder()
                .disable_verification(true)
                .build(),
        );
    }
    builder.build().into()
}

pub(crate) fn transport_error(url: &str, err: ureq::Error) -> UpsizerError {
    UpsizerError::Network {
        url: url.to_string(),
        detail: err.to_string(),
    }
}

pub(crate) fn header_string(response: &ureq::http::Response<ureq::Body>, key: &str) -> String {
    response
        .headers()
        .get(key)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

pub(crate) fn read_body_limited(
    response: &mut ureq::http::Response<ureq::Body>,
    url: &str,
    max_bytes: u64,
) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    response
        .body_mut()
        .as_reader()
        .take(max_bytes.saturating_add(1))
        .read_to_end(&mut buf)
        .map_err(|e| UpsizerError::Network {
            url: url.to_string(),
            detail: format!("reading body: {e}"),
        })?;
    if buf.len() as u64 > max_bytes {
        return Err(UpsizerError::Network {
            url: url.to_string(),
            detail: format!("body larger than {max_bytes} bytes"),
        });
    }
    Ok(buf)
}

/// One-shot loopback HTTP server for transport tests.
#[cfg(test)]
pub(crate) mod test_server {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread::JoinHandle;

    pub(crate) fn http_response(status_line: &str, content_type: &str, body: &[u8]) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )
        .into_bytes();
        out.extend_from_slice(body);
        out
    }

    /// Accepts one connection, answers it with `response` and hands back the
    /// raw request (head and body).
    pub(crate) fn serve_once(response: Vec<u8>) -> (String, JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = std::thread::spawn(move || {
            let Ok((mut stream, _)) = listener.accept() else {
                return Vec::new();
            };
            let request = read_request(&mut stream);
            // The client may hang up before the whole answer is written.
            let _ = stream.write_all(&response);
            let _ = stream.flush();
            request
        });
        (format!("http://{addr}"), handle)
    }

    fn read_request(stream: &mut impl Read) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let head_end = loop {
            if let Some(pos) = find(&buf, b"\r\n\r\n") {
                break pos + 4;
            }
            match stream.read(&mut chunk) {
                Ok(0) | Err(_) => return buf,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).to_ascii_lowercase();
        let content_length = head
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok());
        let chunked = head.contains("transfer-encoding: chunked");
        loop {
            let body = &buf[head_end..];
            let complete = match content_length {
                Some(len) => body.len() >= len,
                None if chunked => body.ends_with(b"0\r\n\r\n"),
                None => true,
            };
            if complete {
                return buf;
            }
            match stream.read(&mut chunk) {
                Ok(0) | Err(_) => return buf,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }
}
