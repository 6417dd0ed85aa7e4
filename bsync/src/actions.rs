//! Action dispatch for the backup server.
//!
//! Every request carries credentials; the resolved user confines all
//! filesystem work to `backup_root/<prefix>` and gates each action with its
//! permission codes. Paths arriving over the wire are validated before they
//! touch the filesystem.

use std::collections::HashMap;

use anyhow::{Context, Result};
use common::localfs::LocalFsProvider;
use common::provider::{Change, ChangeStream, EventKind, FileBody, FsProvider, KeyPolicy};
use common::relpath::RelPath;
use common::tmp::TempPath;
use remote::protocol::{self, WireChange};
use serde_json::{json, Value};

use crate::observers::EventObservers;
use crate::users::{SecurityManager, User};

/// Deliberate request rejection carrying the HTTP status to respond with.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct AbortRequest {
    pub status: u16,
    pub message: String,
}

impl AbortRequest {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// All user trees live under this directory.
    pub backup_root: std::path::PathBuf,
    pub passwd_file: std::path::PathBuf,
    /// Where multipart uploads are staged; system temp when unset.
    pub tmp_dir: Option<std::path::PathBuf>,
    pub poll_ttl: std::time::Duration,
    pub poll_granularity: std::time::Duration,
}

/// A file part of a multipart request, staged to a guarded temp file. The
/// part name is the wire relpath of the target.
#[derive(Debug)]
pub struct UploadPart {
    pub name: String,
    pub temp: TempPath,
}

/// What the HTTP shell should send back.
#[derive(Debug)]
pub enum ActionResponse {
    Json(Value),
    /// Stream the file's bytes verbatim (the `restore` action).
    FileDownload(std::path::PathBuf),
}

fn bad_request(message: &str) -> anyhow::Error {
    AbortRequest::new(400, message).into()
}

fn forbidden(message: &str) -> anyhow::Error {
    AbortRequest::new(403, message).into()
}

/// Validate a wire path. Rejects `..`, wildcards, absolute paths and the
/// other forms [`RelPath`] forbids.
fn safe_relpath(wire: &str) -> Result<RelPath> {
    RelPath::parse(wire).map_err(|_| bad_request("Invalid filename."))
}

fn safe_components(components: &[String]) -> Result<RelPath> {
    RelPath::from_components(components.iter().cloned())
        .map_err(|_| bad_request("Invalid filename."))
}

fn now_unix() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

/// Dispatches protocol actions against the local store.
pub struct ActionServer {
    config: ServerConfig,
    users: SecurityManager,
    observers: EventObservers,
}

impl ActionServer {
    pub fn new(config: ServerConfig) -> Self {
        let users = SecurityManager::new(config.passwd_file.clone());
        let observers = EventObservers::new(config.poll_ttl, config.poll_granularity);
        Self {
            config,
            users,
            observers,
        }
    }

    pub fn tmp_dir(&self) -> Option<&std::path::Path> {
        self.config.tmp_dir.as_deref()
    }

    pub fn observers(&self) -> &EventObservers {
        &self.observers
    }

    /// The user's home directory, created on demand.
    async fn home_dir(&self, user: &User) -> Result<std::path::PathBuf> {
        let home = if user.prefix.is_empty() {
            self.config.backup_root.clone()
        } else {
            let prefix = safe_relpath(&user.prefix)?;
            prefix.to_local(&self.config.backup_root)
        };
        tokio::fs::create_dir_all(&home)
            .await
            .with_context(|| format!("cannot create home directory {home:?}"))?;
        Ok(home)
    }

    /// Authenticate, authorize and run one action.
    pub async fn dispatch(&self, params: &Value, parts: &[UploadPart]) -> Result<ActionResponse> {
        let object = params.as_object().ok_or_else(|| bad_request("Bad request"))?;
        let str_param = |key: &str| object.get(key).and_then(Value::as_str).unwrap_or_default();
        let login = str_param("login").to_string();
        let action = str_param("action").to_string();

        let user = self
            .users
            .get_user(&login)
            .await?
            .ok_or_else(|| forbidden("Invalid username or password (#1)."))?;
        if !self.users.check_password(&login, str_param("pwd")).await? {
            return Err(forbidden("Invalid username or password (#2)."));
        }
        if user.perms.is_empty() {
            return Err(forbidden("Unauthorized to do anything."));
        }
        let check_perm = |required: &str, message: &str| -> Result<()> {
            if user.has_perms(required) {
                Ok(())
            } else {
                Err(forbidden(message))
            }
        };
        let home = self.home_dir(&user).await?;
        tracing::debug!("action {action} for {login}");

        match action.as_str() {
            "backup" => {
                check_perm("W", "No write access")?;
                self.do_backup(&user, &home, parts).await
            }
            "restore" => {
                check_perm("R", "No read access")?;
                let fname = object
                    .get("fname")
                    .and_then(Value::as_str)
                    .filter(|fname| !fname.is_empty())
                    .ok_or_else(|| bad_request("Bad request."))?;
                let local = safe_relpath(fname)?.to_local(&home);
                if local.is_dir() {
                    return Err(bad_request("Cannot restore data from a directory."));
                }
                if !local.is_file() {
                    return Err(AbortRequest::new(404, "Not found.").into());
                }
                Ok(ActionResponse::FileDownload(local))
            }
            "check_exists" => {
                check_perm("S", "File listing not allowed")?;
                let local = safe_relpath(str_param("fname"))?.to_local(&home);
                Ok(ActionResponse::Json(json!(local.exists())))
            }
            "file_exists" => {
                check_perm("S", "File listing not allowed")?;
                let local = safe_relpath(str_param("fname"))?.to_local(&home);
                Ok(ActionResponse::Json(json!(local.is_file())))
            }
            "directory_exists" => {
                check_perm("S", "File listing not allowed")?;
                let local = safe_relpath(str_param("fname"))?.to_local(&home);
                Ok(ActionResponse::Json(json!(local.is_dir())))
            }
            "mkdir" => {
                check_perm("W", "Unauthorized")?;
                let relpath = safe_relpath(str_param("relpath"))?;
                let local = relpath.to_local(&home);
                if !local.is_dir() {
                    tokio::fs::create_dir_all(&local)
                        .await
                        .with_context(|| format!("cannot create directory {local:?}"))?;
                    self.observers
                        .notify(&relpath.to_wire(), EventKind::Directory, "")
                        .await;
                }
                Ok(ActionResponse::Json(json!(0)))
            }
            "iscasesensitive" => {
                check_perm("S", "Unauthorized")?;
                let provider = LocalFsProvider::new(&home, false)?;
                Ok(ActionResponse::Json(json!(
                    provider.is_case_sensitive().await?
                )))
            }
            "listdir" => {
                check_perm("S", "Unauthorized")?;
                let components: Vec<String> =
                    serde_json::from_value(object.get("relpath").cloned().unwrap_or_default())
                        .map_err(|_| bad_request("Bad request"))?;
                let relpath = safe_components(&components)?;
                let provider = LocalFsProvider::new(&home, false)?;
                let (dirs, files) = provider.list_dir(&relpath).await?;
                Ok(ActionResponse::Json(json!([dirs, files])))
            }
            "getinfo" => {
                check_perm("S", "Unauthorized")?;
                let request: protocol::GetInfoParams = serde_json::from_value(params.clone())
                    .map_err(|_| bad_request("Bad request"))?;
                let root = safe_relpath(&request.root)?.to_local(&home);
                let provider = LocalFsProvider::new(&root, true)?;
                let items = request
                    .items
                    .iter()
                    .map(|item| safe_components(item))
                    .collect::<Result<Vec<_>>>()?;
                let infos = provider.get_info(&items, request.encrypted).await?;
                Ok(ActionResponse::Json(serde_json::to_value(infos)?))
            }
            "receivechanges" => {
                check_perm("DWS", "Unauthorized")?;
                let request: protocol::ReceiveChangesParams =
                    serde_json::from_value(params.clone())
                        .map_err(|_| bad_request("Bad request"))?;
                self.do_receive_changes(&home, &request, parts).await
            }
            "utcnow" => {
                check_perm("T", "Unauthorized")?;
                Ok(ActionResponse::Json(json!(now_unix())))
            }
            "listenchanges" => {
                check_perm("N", "Unauthorized")?;
                let root = str_param("root");
                // observers register server-relative roots; validate but
                // keep the wire form for prefix matching
                safe_relpath(root)?;
                let uid = self.observers.add_observer(root.to_string()).await;
                Ok(ActionResponse::Json(json!(uid)))
            }
            "pollchanges" => {
                check_perm("N", "Unauthorized")?;
                let events = self.observers.poll(str_param("uid")).await?;
                let encoded: Vec<Value> =
                    events.iter().map(protocol::WireEvent::encode).collect();
                Ok(ActionResponse::Json(Value::Array(encoded)))
            }
            "getusers" => {
                check_perm("A", "Unauthorized")?;
                let users = self.users.get_users().await?;
                let mut result = serde_json::Map::new();
                for user in users {
                    result.insert(
                        user.name.clone(),
                        json!({
                            "name": user.name,
                            "prefix": user.prefix,
                            "perms": user.perms,
                        }),
                    );
                }
                Ok(ActionResponse::Json(Value::Object(result)))
            }
            "saveuser" => {
                check_perm("A", "Unauthorized")?;
                let request: protocol::SaveUserParams = serde_json::from_value(params.clone())
                    .map_err(|_| bad_request("Bad request"))?;
                self.users
                    .save_user(
                        &request.save_login,
                        &request.save_prefix,
                        &request.save_perms,
                        request.save_password.as_deref(),
                        &login,
                    )
                    .await?;
                Ok(ActionResponse::Json(Value::Null))
            }
            "deleteuser" => {
                check_perm("A", "Unauthorized")?;
                let request: protocol::DeleteUserParams = serde_json::from_value(params.clone())
                    .map_err(|_| bad_request("Bad request"))?;
                self.users.delete_user(&request.delete_login, &login).await?;
                Ok(ActionResponse::Json(Value::Null))
            }
            _ => Err(bad_request("Invalid action.")),
        }
    }

    /// Store uploaded file parts under their wire relpaths. Failures are
    /// reported in-band per file; the request itself still succeeds.
    async fn do_backup(
        &self,
        user: &User,
        home: &std::path::Path,
        parts: &[UploadPart],
    ) -> Result<ActionResponse> {
        if parts.is_empty() {
            return Err(bad_request("Bad number of files posted."));
        }
        let mut response = serde_json::Map::new();
        for part in parts {
            let result = Self::backup_one(user, home, part).await;
            match result {
                Ok(()) => {
                    self.observers.notify(&part.name, EventKind::File, "").await;
                    response.insert(part.name.clone(), json!(""));
                }
                Err(err) => {
                    tracing::warn!("backup of {} failed: {err:#}", part.name);
                    response.insert(part.name.clone(), json!(err.to_string()));
                }
            }
        }
        Ok(ActionResponse::Json(Value::Object(response)))
    }

    async fn backup_one(user: &User, home: &std::path::Path, part: &UploadPart) -> Result<()> {
        let local = safe_relpath(&part.name)?.to_local(home);
        if local.is_file() {
            if !user.has_perms("D") {
                return Err(forbidden("Not authorized to overwrite."));
            }
            tokio::fs::remove_file(&local)
                .await
                .with_context(|| format!("failed removing {local:?}"))?;
        }
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create directory {parent:?}"))?;
        }
        // the staged part may live on another filesystem than the store
        if tokio::fs::rename(part.temp.path(), &local).await.is_err() {
            tokio::fs::copy(part.temp.path(), &local)
                .await
                .with_context(|| format!("failed storing {local:?}"))?;
        }
        Ok(())
    }

    /// Apply a change batch: deletions, then directories, then files, each
    /// group fanning notifications out to the observers.
    async fn do_receive_changes(
        &self,
        home: &std::path::Path,
        request: &protocol::ReceiveChangesParams,
        parts: &[UploadPart],
    ) -> Result<ActionResponse> {
        let root = safe_relpath(&request.root)?;
        let provider = LocalFsProvider::new(&root.to_local(home), true)?;

        let mut parts_by_name: HashMap<&str, Vec<&UploadPart>> = HashMap::new();
        for part in parts {
            parts_by_name.entry(&part.name).or_default().push(part);
        }
        let to_change = |record: WireChange| -> Result<Change> {
            match record {
                WireChange::Delete { path } => Ok(Change::Delete {
                    path: safe_relpath(&path)?,
                }),
                WireChange::Directory { path, atime, mtime } => Ok(Change::Directory {
                    path: safe_relpath(&path)?,
                    atime,
                    mtime,
                }),
                WireChange::File {
                    path,
                    atime,
                    mtime,
                    size,
                } => {
                    let matching = parts_by_name.get(path.as_str());
                    let part = match matching.map(Vec::as_slice) {
                        Some([part]) => part,
                        _ => return Err(bad_request("Bad number of files posted.")),
                    };
                    Ok(Change::File {
                        path: safe_relpath(&path)?,
                        atime,
                        mtime,
                        size,
                        // the staged part must survive this request for
                        // other actions, so the receiver copies it
                        body: FileBody::Sender(part.temp.path().to_path_buf()),
                    })
                }
            }
        };

        for group in [&request.delet, &request.dcopy, &request.fcopy] {
            let records = group
                .iter()
                .map(WireChange::decode)
                .collect::<Result<Vec<_>>>()?;
            let changes = records
                .iter()
                .cloned()
                .map(&to_change)
                .collect::<Result<Vec<_>>>()?;
            provider
                .receive_changes(KeyPolicy::none(), ChangeStream::from_changes(changes))
                .await?;
            for record in &records {
                let event_path = if request.root.is_empty() {
                    record.path().to_string()
                } else {
                    format!("{}/{}", request.root, record.path())
                };
                self.observers
                    .notify(&event_path, record.kind(), &request.uid)
                    .await;
            }
        }
        Ok(ActionResponse::Json(json!(0)))
    }
}
