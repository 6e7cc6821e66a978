use std::path::{Path, PathBuf};
use std::time::Duration;

pub use reqwest::Method;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use pvebox_core::config::EndpointConfig;
use pvebox_core::error::{Error, Result};

/// Result of a bounded guest file read.
#[derive(Debug, Clone)]
pub struct FileRead {
    pub content: String,
    pub truncated: bool,
}

#[derive(Clone)]
struct Session {
    ticket: String,
    csrf_token: String,
}

enum Payload<'a> {
    Empty,
    Json(&'a Value),
    Form(&'a str),
}

/// Authenticated Proxmox VE API transport.
///
/// Holds one session (ticket + anti-forgery token) per endpoint, created
/// lazily and refreshed once per request on a 401. Login is idempotent
/// and cheap, so concurrent refreshes overwrite each other harmlessly
/// instead of being locked out.
pub struct ProxmoxClient {
    http: reqwest::Client,
    base_url: String,
    api_url: String,
    username: String,
    password: String,
    verify_tls: bool,
    session: Mutex<Option<Session>>,
}

impl ProxmoxClient {
    pub fn new(config: &EndpointConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(60));
        if !config.verify_tls {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder
            .build()
            .map_err(|e| Error::Network(format!("failed to build HTTP client: {e}")))?;

        let base_url = config.base_url();
        Ok(Self {
            api_url: format!("{base_url}/api2/json"),
            base_url,
            username: config.username(),
            password: config.password.clone(),
            verify_tls: config.verify_tls,
            http,
            session: Mutex::new(None),
        })
    }

    /// Management UI base, used for console links.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Obtain a fresh ticket and anti-forgery token.
    async fn login(&self) -> Result<Session> {
        debug!(url = %self.base_url, "logging in");
        let resp = self
            .http
            .post(format!("{}/access/ticket", self.api_url))
            .form(&[
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await
            .map_err(net_err)?;

        let status = resp.status();
        let text = resp.text().await.map_err(net_err)?;
        if !status.is_success() {
            return Err(Error::Transport {
                status: status.as_u16(),
                body: text,
            });
        }

        let body: Value = serde_json::from_str(&text)?;
        let data = &body["data"];
        let ticket = data["ticket"]
            .as_str()
            .ok_or_else(|| Error::Configuration("login response missing ticket".into()))?;
        // The anti-forgery token is required for every mutating verb; its
        // absence after a successful login is fatal, not retried.
        let csrf_token = data["CSRFPreventionToken"]
            .as_str()
            .ok_or_else(|| Error::Configuration("login response missing CSRF token".into()))?;

        let session = Session {
            ticket: ticket.to_string(),
            csrf_token: csrf_token.to_string(),
        };
        *self.session.lock().await = Some(session.clone());
        Ok(session)
    }

    async fn ensure_session(&self) -> Result<Session> {
        if let Some(session) = self.session.lock().await.clone() {
            return Ok(session);
        }
        self.login().await
    }

    async fn send_once(
        &self,
        session: &Session,
        method: &Method,
        path: &str,
        payload: &Payload<'_>,
    ) -> Result<reqwest::Response> {
        let mut req = self
            .http
            .request(method.clone(), format!("{}{}", self.api_url, path))
            .header("Cookie", format!("PVEAuthCookie={}", session.ticket));

        if *method == Method::POST || *method == Method::PUT || *method == Method::DELETE {
            req = req.header("CSRFPreventionToken", session.csrf_token.clone());
        }

        req = match payload {
            Payload::Empty => req,
            Payload::Json(value) => req.json(value),
            Payload::Form(body) => req
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(body.to_string()),
        };

        req.send().await.map_err(net_err)
    }

    /// Send with the 401-driven single re-login. A second 401 propagates
    /// through the normal error path.
    async fn send(
        &self,
        method: &Method,
        path: &str,
        payload: &Payload<'_>,
    ) -> Result<reqwest::Response> {
        let session = self.ensure_session().await?;
        let resp = self.send_once(&session, method, path, payload).await?;
        if resp.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }
        // Ticket likely expired (2 hour lifetime); log in once and retry.
        debug!(path, "got 401, refreshing ticket");
        let session = self.login().await?;
        self.send_once(&session, method, path, payload).await
    }

    /// Issue a JSON API request and return the `data` member of the
    /// response envelope. Non-2xx responses become [`Error::Transport`]
    /// carrying the response body.
    pub async fn request(&self, method: Method, path: &str, json: Option<&Value>) -> Result<Value> {
        let payload = match json {
            Some(value) => Payload::Json(value),
            None => Payload::Empty,
        };
        let resp = self.send(&method, path, &payload).await?;
        let status = resp.status();
        let text = resp.text().await.map_err(net_err)?;
        if !status.is_success() {
            return Err(Error::Transport {
                status: status.as_u16(),
                body: text,
            });
        }
        let body: Value = serde_json::from_str(&text)?;
        Ok(body.get("data").cloned().unwrap_or(Value::Null))
    }

    /// Like [`ProxmoxClient::request`] with a form-encoded body. Needed
    /// for config updates that delete keys (`delete=net0`).
    pub async fn request_form(&self, method: Method, path: &str, body: &str) -> Result<Value> {
        let resp = self.send(&method, path, &Payload::Form(body)).await?;
        let status = resp.status();
        let text = resp.text().await.map_err(net_err)?;
        if !status.is_success() {
            return Err(Error::Transport {
                status: status.as_u16(),
                body: text,
            });
        }
        let parsed: Value = serde_json::from_str(&text)?;
        Ok(parsed.get("data").cloned().unwrap_or(Value::Null))
    }

    /// Issue a request without raising on HTTP errors: 2xx responses
    /// yield the `data` member, error responses yield the whole envelope.
    /// Used by delete-then-verify-gone flows where an error response is
    /// the expected terminal state.
    pub async fn request_lenient(&self, method: Method, path: &str) -> Result<Value> {
        let resp = self.send(&method, path, &Payload::Empty).await?;
        let status = resp.status();
        let text = resp.text().await.map_err(net_err)?;
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        if status.is_success() {
            Ok(body.get("data").cloned().unwrap_or(Value::Null))
        } else {
            Ok(body)
        }
    }

    async fn ping_agent(&self, node: &str, vm_id: u32) -> Result<()> {
        self.request(
            Method::POST,
            &format!("/nodes/{node}/qemu/{vm_id}/agent/ping"),
            None,
        )
        .await?;
        Ok(())
    }

    /// Stream a guest file read, bounded by `max_size`.
    ///
    /// The declared Content-Length is checked before any body is read; a
    /// mid-stream overrun aborts and salvages whatever content can be
    /// recovered from the truncated JSON envelope.
    pub async fn read_file_streaming(
        &self,
        node: &str,
        vm_id: u32,
        filepath: &str,
        max_size: usize,
    ) -> Result<FileRead> {
        // Ping first so the ticket is refreshed outside the stream.
        self.ping_agent(node, vm_id).await?;
        let session = self.ensure_session().await?;

        let url = format!("{}/nodes/{node}/qemu/{vm_id}/agent/file-read", self.api_url);
        let mut resp = self
            .http
            .get(url)
            .query(&[("file", filepath)])
            .header("Cookie", format!("PVEAuthCookie={}", session.ticket))
            .send()
            .await
            .map_err(net_err)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.map_err(net_err)?;
            return Err(Error::Transport {
                status: status.as_u16(),
                body: text,
            });
        }

        if let Some(declared) = resp.content_length()
            && declared as usize > max_size
        {
            return Err(Error::OutputTooLarge {
                limit: max_size,
                partial: String::new(),
            });
        }

        let mut buf: Vec<u8> = Vec::new();
        while let Some(chunk) = resp.chunk().await.map_err(net_err)? {
            buf.extend_from_slice(&chunk);
            if buf.len() > max_size {
                return Err(Error::OutputTooLarge {
                    limit: max_size,
                    partial: salvage_content(&buf),
                });
            }
        }

        let body: Value = serde_json::from_slice(&buf)?;
        let data = body.get("data").cloned().unwrap_or(Value::Null);
        Ok(FileRead {
            content: data
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            truncated: data
                .get("truncated")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }

    /// Upload a local file to hypervisor storage via the multipart
    /// endpoint. Large binary bodies never pass through the JSON helper,
    /// and the blocking HTTP client runs on a `spawn_blocking` thread so
    /// the upload cannot stall concurrent operations.
    pub async fn upload_multipart(
        &self,
        node: &str,
        storage: &str,
        file: &Path,
        content_type: &str,
        filename: Option<&str>,
    ) -> Result<Value> {
        let session = self.ensure_session().await?;
        let url = format!("{}/nodes/{node}/storage/{storage}/upload", self.api_url);
        let file: PathBuf = file.to_path_buf();
        let remote_name = filename
            .map(str::to_string)
            .or_else(|| file.file_name().map(|n| n.to_string_lossy().into_owned()))
            .ok_or_else(|| Error::Configuration(format!("no filename for {}", file.display())))?;
        let content_type = content_type.to_string();
        let verify_tls = self.verify_tls;
        let ticket = session.ticket;
        let csrf_token = session.csrf_token;

        let join = tokio::task::spawn_blocking(move || -> Result<Value> {
            if !file.exists() {
                return Err(Error::NotFound(format!("file not found: {}", file.display())));
            }

            let client = reqwest::blocking::Client::builder()
                .danger_accept_invalid_certs(!verify_tls)
                .timeout(None)
                .build()
                .map_err(|e| Error::Network(format!("failed to build upload client: {e}")))?;

            let part = reqwest::blocking::multipart::Part::file(&file)
                .map_err(Error::Io)?
                .file_name(remote_name);
            let form = reqwest::blocking::multipart::Form::new()
                .text("content", content_type)
                .part("filename", part);

            let resp = client
                .post(url)
                .header("Cookie", format!("PVEAuthCookie={ticket}"))
                .header("CSRFPreventionToken", csrf_token)
                .multipart(form)
                .send()
                .map_err(|e| Error::Network(e.to_string()))?;

            let status = resp.status();
            let text = resp.text().map_err(|e| Error::Network(e.to_string()))?;
            if !status.is_success() {
                return Err(Error::Transport {
                    status: status.as_u16(),
                    body: text,
                });
            }
            let body: Value = serde_json::from_str(&text)?;
            Ok(body.get("data").cloned().unwrap_or(Value::Null))
        });

        join.await
            .map_err(|e| Error::Network(format!("upload task failed: {e}")))?
    }
}

fn net_err(err: reqwest::Error) -> Error {
    Error::Network(err.to_string())
}

/// Best-effort recovery of the `content` field from a truncated
/// `{"data":{"content":"..."}}` envelope. JSON escapes are decoded up to
/// the truncation point; an escape cut mid-sequence is dropped.
pub(crate) fn salvage_content(buf: &[u8]) -> String {
    let text = String::from_utf8_lossy(buf);
    let Some(idx) = text.find("\"content\":\"") else {
        return String::new();
    };
    let raw = &text[idx + "\"content\":\"".len()..];

    let mut out = String::new();
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => break,
            '\\' => match chars.next() {
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('t') => out.push('\t'),
                Some('b') => out.push('\u{8}'),
                Some('f') => out.push('\u{c}'),
                Some('u') => {
                    let hex: String = chars.by_ref().take(4).collect();
                    if hex.len() < 4 {
                        break;
                    }
                    match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                        Some(decoded) => out.push(decoded),
                        None => break,
                    }
                }
                Some(other) => out.push(other),
                None => break,
            },
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_salvage_content_plain() {
        let buf = br#"{"data":{"content":"hello wor"#;
        assert_eq!(salvage_content(buf), "hello wor");
    }

    #[test]
    fn test_salvage_content_with_escapes() {
        let buf = br#"{"data":{"content":"line1\nline2\ttab"#;
        assert_eq!(salvage_content(buf), "line1\nline2\ttab");
    }

    #[test]
    fn test_salvage_content_truncated_escape() {
        let buf = br#"{"data":{"content":"abc\u00"#;
        assert_eq!(salvage_content(buf), "abc");
    }

    #[test]
    fn test_salvage_content_complete_string() {
        let buf = br#"{"data":{"content":"done","truncated":false}}"#;
        assert_eq!(salvage_content(buf), "done");
    }

    #[test]
    fn test_salvage_content_missing_field() {
        assert_eq!(salvage_content(b"{\"data\":{}}"), "");
    }

    #[test]
    fn test_client_construction() {
        let cfg = EndpointConfig {
            host: "pve.example".into(),
            port: 8006,
            user: "root".into(),
            realm: "pam".into(),
            password: "pw".into(),
            node: "proxmox".into(),
            verify_tls: false,
        };
        let client = ProxmoxClient::new(&cfg).unwrap();
        assert_eq!(client.base_url(), "https://pve.example:8006");
    }
}
