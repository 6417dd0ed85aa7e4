//! Client side of the action protocol and the server-backed provider.

pub mod blindfs;
pub mod protocol;

use anyhow::{Context, Result};
use common::provider::FileInfo;
use serde_json::Value;

/// A remote action returned a non-200 status. The body is JSON when it
/// parses, the raw text otherwise.
#[derive(Debug, thiserror::Error)]
#[error("server returned {status}: {body}")]
pub struct RequestError {
    pub status: u16,
    pub body: Value,
}

/// Connection parameters for one server.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Single action endpoint, e.g. `https://backup.example.com:8888/`.
    pub url: String,
    pub login: String,
    pub password: String,
    /// Extra CA certificate (PEM) to trust for this server.
    pub ca_cert: Option<std::path::PathBuf>,
}

/// Client for the JSON-over-HTTPS action protocol: every call is a
/// multipart POST against the single server URL.
pub struct Client {
    http: reqwest::Client,
    config: ClientConfig,
}

impl Client {
    pub fn connect(config: ClientConfig) -> Result<std::sync::Arc<Self>> {
        let mut builder = reqwest::Client::builder();
        if let Some(ca_cert) = &config.ca_cert {
            let pem = std::fs::read(ca_cert)
                .with_context(|| format!("cannot read CA certificate {ca_cert:?}"))?;
            builder = builder.add_root_certificate(
                reqwest::Certificate::from_pem(&pem)
                    .with_context(|| format!("invalid CA certificate {ca_cert:?}"))?,
            );
        }
        let http = builder.build().context("failed building HTTP client")?;
        Ok(std::sync::Arc::new(Self { http, config }))
    }

    pub fn login(&self) -> &str {
        &self.config.login
    }

    async fn post_form(&self, form: reqwest::multipart::Form) -> Result<reqwest::Response> {
        self.http
            .post(&self.config.url)
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("request to {} failed", self.config.url))
    }

    async fn form_with_files(
        &self,
        params: &Value,
        files: Vec<(String, std::path::PathBuf)>,
    ) -> Result<reqwest::multipart::Form> {
        let mut form =
            reqwest::multipart::Form::new().text("params", serde_json::to_string(params)?);
        for (name, path) in files {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("cannot open {path:?} for upload"))?;
            // the visible filename is the staged temp's random name, never
            // the real one: the server must not learn plaintext names
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "upload".to_string());
            let part = reqwest::multipart::Part::stream(reqwest::Body::wrap_stream(
                tokio_util::io::ReaderStream::new(file),
            ))
            .file_name(file_name)
            .mime_str("application/octet-stream")?;
            form = form.part(name, part);
        }
        Ok(form)
    }

    async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        let body = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(_) => Value::String(text),
        };
        Err(RequestError {
            status: status.as_u16(),
            body,
        }
        .into())
    }

    /// Perform `action` with the given parameters and file parts; returns
    /// the decoded JSON response.
    pub async fn call_with_files<T: serde::Serialize>(
        &self,
        action: &str,
        extra: &T,
        files: Vec<(String, std::path::PathBuf)>,
    ) -> Result<Value> {
        let params = protocol::request_params(
            &self.config.login,
            &self.config.password,
            action,
            extra,
        )?;
        let form = self.form_with_files(&params, files).await?;
        tracing::debug!("calling action {action}");
        let response = Self::error_for_status(self.post_form(form).await?).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("action {action} returned malformed JSON"))
    }

    pub async fn call<T: serde::Serialize>(&self, action: &str, extra: &T) -> Result<Value> {
        self.call_with_files(action, extra, Vec::new()).await
    }

    /// Download raw file bytes (the `restore` action responds with the body
    /// verbatim rather than JSON).
    pub async fn restore(&self, fname: &str) -> Result<bytes::Bytes> {
        let params = protocol::request_params(
            &self.config.login,
            &self.config.password,
            "restore",
            &protocol::FnameParams {
                fname: fname.to_string(),
            },
        )?;
        let form = self.form_with_files(&params, Vec::new()).await?;
        let response = Self::error_for_status(self.post_form(form).await?).await?;
        Ok(response.bytes().await?)
    }

    /// Upload files to their wire relpaths. The result maps each relpath to
    /// an error message, empty on success; the request itself succeeds even
    /// when individual files are rejected.
    pub async fn backup(
        &self,
        files: Vec<(String, std::path::PathBuf)>,
    ) -> Result<std::collections::HashMap<String, String>> {
        let value = self
            .call_with_files("backup", &serde_json::Map::new(), files)
            .await?;
        serde_json::from_value(value).context("backup returned a malformed response")
    }

    pub async fn list_dir(&self, relpath: Vec<String>) -> Result<(Vec<String>, Vec<String>)> {
        let value = self
            .call("listdir", &protocol::ListDirParams { relpath })
            .await?;
        serde_json::from_value(value).context("listdir returned a malformed response")
    }

    pub async fn get_info(
        &self,
        root: String,
        items: Vec<Vec<String>>,
        encrypted: bool,
    ) -> Result<Vec<FileInfo>> {
        let value = self
            .call(
                "getinfo",
                &protocol::GetInfoParams {
                    root,
                    items,
                    encrypted,
                },
            )
            .await?;
        serde_json::from_value(value).context("getinfo returned a malformed response")
    }

    pub async fn is_case_sensitive(&self) -> Result<bool> {
        let value = self.call("iscasesensitive", &serde_json::Map::new()).await?;
        value
            .as_bool()
            .context("iscasesensitive returned a malformed response")
    }

    pub async fn check_exists(&self, fname: &str) -> Result<bool> {
        let value = self
            .call(
                "check_exists",
                &protocol::FnameParams {
                    fname: fname.to_string(),
                },
            )
            .await?;
        value
            .as_bool()
            .context("check_exists returned a malformed response")
    }

    pub async fn file_exists(&self, fname: &str) -> Result<bool> {
        let value = self
            .call(
                "file_exists",
                &protocol::FnameParams {
                    fname: fname.to_string(),
                },
            )
            .await?;
        value
            .as_bool()
            .context("file_exists returned a malformed response")
    }

    pub async fn directory_exists(&self, fname: &str) -> Result<bool> {
        let value = self
            .call(
                "directory_exists",
                &protocol::FnameParams {
                    fname: fname.to_string(),
                },
            )
            .await?;
        value
            .as_bool()
            .context("directory_exists returned a malformed response")
    }

    pub async fn mkdir(&self, relpath: &str) -> Result<()> {
        self.call(
            "mkdir",
            &protocol::MkdirParams {
                relpath: relpath.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    pub async fn utcnow(&self) -> Result<f64> {
        let value = self.call("utcnow", &serde_json::Map::new()).await?;
        value
            .as_f64()
            .context("utcnow returned a malformed response")
    }

    /// Register a server-side change observer; returns its uid.
    pub async fn listen_changes(&self, root: &str) -> Result<String> {
        let value = self
            .call(
                "listenchanges",
                &protocol::ListenChangesParams {
                    root: root.to_string(),
                },
            )
            .await?;
        value
            .as_str()
            .map(str::to_string)
            .context("listenchanges returned a malformed response")
    }

    /// Long-poll for buffered change events; blocks on the server for up to
    /// its poll TTL and returns an empty list on timeout.
    pub async fn poll_changes(&self, uid: &str) -> Result<Vec<protocol::WireEvent>> {
        let value = self
            .call(
                "pollchanges",
                &protocol::PollChangesParams {
                    uid: uid.to_string(),
                },
            )
            .await?;
        let items = value
            .as_array()
            .context("pollchanges returned a malformed response")?;
        items.iter().map(protocol::WireEvent::decode).collect()
    }

    /// Apply a batch of changes under `root`, uploading the listed file
    /// bodies alongside.
    pub async fn receive_changes(
        &self,
        root: String,
        uid: String,
        delet: Vec<Value>,
        dcopy: Vec<Value>,
        fcopy: Vec<Value>,
        files: Vec<(String, std::path::PathBuf)>,
    ) -> Result<()> {
        self.call_with_files(
            "receivechanges",
            &protocol::ReceiveChangesParams {
                root,
                uid,
                delet,
                dcopy,
                fcopy,
            },
            files,
        )
        .await?;
        Ok(())
    }

    pub async fn get_users(&self) -> Result<Value> {
        self.call("getusers", &serde_json::Map::new()).await
    }

    pub async fn save_user(&self, params: protocol::SaveUserParams) -> Result<()> {
        self.call("saveuser", &params).await?;
        Ok(())
    }

    pub async fn delete_user(&self, login: &str) -> Result<()> {
        self.call(
            "deleteuser",
            &protocol::DeleteUserParams {
                delete_login: login.to_string(),
            },
        )
        .await?;
        Ok(())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("url", &self.config.url)
            .field("login", &self.config.login)
            .finish()
    }
}
