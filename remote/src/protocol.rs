//! Wire representation of the action protocol.
//!
//! Every request is a multipart POST whose `params` part is a UTF-8 JSON
//! object `{"login": .., "pwd": .., "action": .., ..}`; extra parts carry
//! file bodies named by their wire relpath. Change records and listener
//! events travel as JSON arrays with a leading numeric tag (1 = directory,
//! 2 = file, 3 = delete); an unknown tag is a protocol error.

use anyhow::{Context, Result};
use common::error::SyncError;
use common::provider::EventKind;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A change record as it travels inside `receivechanges` parameters.
/// File records carry no body reference and no owner: the body arrives as a
/// multipart part named by `path`, and ownership is meaningless across the
/// wire.
#[derive(Clone, Debug, PartialEq)]
pub enum WireChange {
    Delete {
        path: String,
    },
    Directory {
        path: String,
        atime: f64,
        mtime: f64,
    },
    File {
        path: String,
        atime: f64,
        mtime: f64,
        size: u64,
    },
}

impl WireChange {
    pub fn path(&self) -> &str {
        match self {
            WireChange::Delete { path }
            | WireChange::Directory { path, .. }
            | WireChange::File { path, .. } => path,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            WireChange::Delete { .. } => EventKind::Delete,
            WireChange::Directory { .. } => EventKind::Directory,
            WireChange::File { .. } => EventKind::File,
        }
    }

    pub fn encode(&self) -> Value {
        match self {
            WireChange::Delete { path } => json!([EventKind::Delete.code(), path]),
            WireChange::Directory { path, atime, mtime } => {
                json!([EventKind::Directory.code(), path, atime, mtime])
            }
            WireChange::File {
                path,
                atime,
                mtime,
                size,
            } => json!([EventKind::File.code(), path, atime, mtime, size, ""]),
        }
    }

    pub fn decode(value: &Value) -> Result<Self> {
        let items = value
            .as_array()
            .ok_or_else(|| SyncError::Protocol(format!("change record is not an array: {value}")))?;
        let tag = items
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| SyncError::Protocol(format!("change record has no tag: {value}")))?;
        let path = items
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::Protocol(format!("change record has no path: {value}")))?
            .to_string();
        let number = |idx: usize| -> Result<f64> {
            items
                .get(idx)
                .and_then(Value::as_f64)
                .ok_or_else(|| SyncError::Protocol(format!("malformed change record: {value}")))
                .map_err(Into::into)
        };
        match EventKind::from_code(tag)? {
            EventKind::Delete => Ok(WireChange::Delete { path }),
            EventKind::Directory => Ok(WireChange::Directory {
                path,
                atime: number(2)?,
                mtime: number(3)?,
            }),
            EventKind::File => Ok(WireChange::File {
                path,
                atime: number(2)?,
                mtime: number(3)?,
                size: number(4)? as u64,
            }),
        }
    }
}

/// A change event delivered by `pollchanges`: `[path, kind, originator]`.
#[derive(Clone, Debug, PartialEq)]
pub struct WireEvent {
    pub path: String,
    pub kind: EventKind,
    pub origin_uid: String,
}

impl WireEvent {
    pub fn encode(&self) -> Value {
        json!([self.path, self.kind.code(), self.origin_uid])
    }

    pub fn decode(value: &Value) -> Result<Self> {
        let items = value
            .as_array()
            .filter(|items| items.len() == 3)
            .ok_or_else(|| SyncError::Protocol(format!("malformed change event: {value}")))?;
        let path = items[0]
            .as_str()
            .ok_or_else(|| SyncError::Protocol(format!("malformed change event: {value}")))?;
        let kind = items[1]
            .as_i64()
            .ok_or_else(|| SyncError::Protocol(format!("malformed change event: {value}")))?;
        let origin_uid = items[2]
            .as_str()
            .ok_or_else(|| SyncError::Protocol(format!("malformed change event: {value}")))?;
        Ok(Self {
            path: path.to_string(),
            kind: EventKind::from_code(kind)?,
            origin_uid: origin_uid.to_string(),
        })
    }
}

// typed parameter payloads; they flatten into the `params` JSON next to
// login, pwd and action

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListDirParams {
    pub relpath: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetInfoParams {
    pub root: String,
    pub items: Vec<Vec<String>>,
    pub encrypted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FnameParams {
    pub fname: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MkdirParams {
    pub relpath: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReceiveChangesParams {
    pub root: String,
    pub uid: String,
    pub delet: Vec<Value>,
    pub dcopy: Vec<Value>,
    pub fcopy: Vec<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListenChangesParams {
    pub root: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PollChangesParams {
    pub uid: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SaveUserParams {
    pub save_login: String,
    pub save_prefix: String,
    pub save_perms: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_password: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeleteUserParams {
    pub delete_login: String,
}

/// Merge typed action parameters with the credentials envelope.
pub fn request_params<T: Serialize>(
    login: &str,
    pwd: &str,
    action: &str,
    extra: &T,
) -> Result<Value> {
    let mut params = serde_json::to_value(extra).context("failed encoding request parameters")?;
    let object = params
        .as_object_mut()
        .context("request parameters must be a JSON object")?;
    object.insert("login".into(), json!(login));
    object.insert("pwd".into(), json!(pwd));
    object.insert("action".into(), json!(action));
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_record_roundtrip() {
        let records = vec![
            WireChange::Delete {
                path: "a/b".into(),
            },
            WireChange::Directory {
                path: "d".into(),
                atime: 1.5,
                mtime: 2.5,
            },
            WireChange::File {
                path: "f.txt".into(),
                atime: 3.0,
                mtime: 4.0,
                size: 42,
            },
        ];
        for record in records {
            assert_eq!(WireChange::decode(&record.encode()).unwrap(), record);
        }
    }

    #[test]
    fn unknown_tag_is_protocol_error() {
        let err = WireChange::decode(&json!([7, "x"])).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::Protocol(_))
        ));
    }

    #[test]
    fn event_roundtrip() {
        let event = WireEvent {
            path: "pre/fix".into(),
            kind: EventKind::File,
            origin_uid: "uid-1".into(),
        };
        assert_eq!(WireEvent::decode(&event.encode()).unwrap(), event);
        assert!(WireEvent::decode(&json!(["short", 2])).is_err());
    }

    #[test]
    fn params_envelope() {
        let params = request_params(
            "alice",
            "pw",
            "listdir",
            &ListDirParams {
                relpath: vec!["a".into()],
            },
        )
        .unwrap();
        assert_eq!(params["action"], "listdir");
        assert_eq!(params["login"], "alice");
        assert_eq!(params["relpath"], json!(["a"]));
    }
}
