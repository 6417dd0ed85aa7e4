//! Line-oriented user store: `login:prefix:perms:password`, one user per
//! line, `#` comments allowed. The file may be edited on disk while the
//! server runs; it is reloaded when its mtime changes, checked at most once
//! per second. All writes go through a `.part` file renamed into place.

use std::collections::HashMap;

use anyhow::{Context, Result};

use crate::actions::AbortRequest;

/// Permission codes: W=write, D=delete/overwrite, R=read/restore,
/// S=stat/list, T=time query, A=admin, N=notify.
pub const VALID_PERM_CODES: &str = "WDRSTAN";

const RELOAD_TTL: std::time::Duration = std::time::Duration::from_secs(1);
const MIN_PASSWORD_LEN: usize = 6;

static LOGIN_RE: std::sync::LazyLock<regex::Regex> =
    std::sync::LazyLock::new(|| regex::Regex::new("^[a-z][a-z0-9]*$").expect("valid regex"));
static PREFIX_RE: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
    regex::Regex::new("^[a-z][a-z0-9]*(/[a-z][a-z0-9]*)*$").expect("valid regex")
});

#[derive(Clone, Debug)]
pub struct User {
    pub name: String,
    /// Server directory prefix the user is confined to; may be empty.
    pub prefix: String,
    pub perms: String,
}

impl User {
    pub fn has_perms(&self, required: &str) -> bool {
        required.chars().all(|code| self.perms.contains(code))
    }
}

#[derive(Default)]
struct Store {
    users: HashMap<String, User>,
    passwords: HashMap<String, String>,
    last_loaded: Option<std::time::Instant>,
    last_mtime: Option<std::time::SystemTime>,
}

fn suffixed(path: &std::path::Path, suffix: &str) -> std::path::PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    std::path::PathBuf::from(name)
}

fn login_ok(login: &str) -> bool {
    LOGIN_RE.is_match(login)
}

fn prefix_ok(prefix: &str) -> bool {
    prefix.is_empty() || PREFIX_RE.is_match(prefix)
}

fn parse_line(line: &str, lineno: usize) -> Option<(User, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let mut fields = line.splitn(4, ':');
    let login = fields.next()?.trim().to_lowercase();
    let prefix = fields.next()?.trim().to_string();
    let perms = fields.next()?.to_string();
    // everything after the third colon is the password, colons included
    let password = fields.next().unwrap_or("").to_string();
    if !login_ok(&login) {
        tracing::warn!("invalid login name {login:?} at line {lineno}");
        return None;
    }
    if !prefix_ok(&prefix) {
        tracing::warn!("invalid prefix {prefix:?} at line {lineno}");
        return None;
    }
    Some((
        User {
            name: login,
            prefix,
            perms,
        },
        password,
    ))
}

/// Manages the users of one server instance.
pub struct SecurityManager {
    passwd_file: std::path::PathBuf,
    store: tokio::sync::Mutex<Store>,
}

impl SecurityManager {
    pub fn new(passwd_file: std::path::PathBuf) -> Self {
        Self {
            passwd_file,
            store: tokio::sync::Mutex::new(Store::default()),
        }
    }

    async fn load(&self, store: &mut Store) -> Result<()> {
        tracing::info!("reloading users from {:?}", self.passwd_file);
        let text = tokio::fs::read_to_string(&self.passwd_file)
            .await
            .with_context(|| format!("cannot read user store {:?}", self.passwd_file))?;
        store.users.clear();
        store.passwords.clear();
        for (idx, line) in text.lines().enumerate() {
            if let Some((user, password)) = parse_line(line, idx + 1) {
                store.passwords.insert(user.name.clone(), password);
                store.users.insert(user.name.clone(), user);
            }
        }
        Ok(())
    }

    async fn ensure_fresh(&self, store: &mut Store) -> Result<()> {
        let now = std::time::Instant::now();
        if let Some(last_loaded) = store.last_loaded {
            if now.duration_since(last_loaded) < RELOAD_TTL {
                return Ok(());
            }
        }
        let mtime = tokio::fs::metadata(&self.passwd_file)
            .await
            .with_context(|| format!("cannot stat user store {:?}", self.passwd_file))?
            .modified()?;
        if store.last_mtime != Some(mtime) {
            self.load(store).await?;
            store.last_mtime = Some(mtime);
        }
        store.last_loaded = Some(now);
        Ok(())
    }

    async fn dump(&self, store: &Store) -> Result<()> {
        tracing::info!("saving users to {:?}", self.passwd_file);
        let mut logins: Vec<&String> = store.users.keys().collect();
        logins.sort();
        let mut text = String::new();
        for login in logins {
            let user = &store.users[login];
            let empty = String::new();
            let password = store.passwords.get(login).unwrap_or(&empty);
            text.push_str(&format!(
                "{}:{}:{}:{}\n",
                user.name, user.prefix, user.perms, password
            ));
        }
        let part = suffixed(&self.passwd_file, ".part");
        tokio::fs::write(&part, text)
            .await
            .with_context(|| format!("cannot write {part:?}"))?;
        let backup = suffixed(&self.passwd_file, ".bak");
        if tokio::fs::try_exists(&backup).await.unwrap_or(false) {
            tokio::fs::remove_file(&backup).await?;
        }
        tokio::fs::rename(&self.passwd_file, &backup).await?;
        tokio::fs::rename(&part, &self.passwd_file).await?;
        Ok(())
    }

    pub async fn get_user(&self, login: &str) -> Result<Option<User>> {
        let mut store = self.store.lock().await;
        self.ensure_fresh(&mut store).await?;
        Ok(store.users.get(login).cloned())
    }

    pub async fn check_password(&self, login: &str, password: &str) -> Result<bool> {
        let mut store = self.store.lock().await;
        self.ensure_fresh(&mut store).await?;
        match store.passwords.get(login) {
            // an empty stored password disables the user
            Some(stored) if !stored.is_empty() => Ok(stored == password),
            _ => Ok(false),
        }
    }

    pub async fn get_users(&self) -> Result<Vec<User>> {
        let mut store = self.store.lock().await;
        self.ensure_fresh(&mut store).await?;
        let mut users: Vec<User> = store.users.values().cloned().collect();
        users.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(users)
    }

    /// Create or update a user. Admins may not modify themselves.
    pub async fn save_user(
        &self,
        login: &str,
        prefix: &str,
        perms: &str,
        password: Option<&str>,
        current_login: &str,
    ) -> Result<()> {
        let mut store = self.store.lock().await;
        self.ensure_fresh(&mut store).await?;

        let login = login.trim().to_lowercase();
        let prefix = prefix.trim();
        if !login_ok(&login) {
            return Err(AbortRequest::new(400, format!("Invalid login name '{login}'")).into());
        }
        if !prefix_ok(prefix) {
            return Err(AbortRequest::new(400, format!("Invalid prefix '{prefix}'")).into());
        }
        if login == current_login {
            return Err(AbortRequest::new(400, "You should not change yourself.").into());
        }
        let perms: String = VALID_PERM_CODES
            .chars()
            .filter(|code| perms.contains(*code))
            .collect();
        // keep the existing password unless a new one is supplied
        let password = match password {
            Some(password) if !password.is_empty() => password.to_string(),
            _ => store.passwords.get(&login).cloned().unwrap_or_default(),
        };
        if !password.is_empty() {
            if password.len() < MIN_PASSWORD_LEN {
                return Err(AbortRequest::new(
                    403,
                    format!("Minimum password length is {MIN_PASSWORD_LEN}."),
                )
                .into());
            }
            if password == login {
                return Err(
                    AbortRequest::new(403, "Password and login must not match.").into(),
                );
            }
        }
        tracing::info!("saving user {login}");
        store.users.insert(
            login.clone(),
            User {
                name: login.clone(),
                prefix: prefix.to_string(),
                perms,
            },
        );
        store.passwords.insert(login, password);
        self.dump(&store).await
    }

    pub async fn delete_user(&self, login: &str, current_login: &str) -> Result<()> {
        let mut store = self.store.lock().await;
        self.ensure_fresh(&mut store).await?;
        let login = login.trim().to_lowercase();
        if !login_ok(&login) {
            return Err(AbortRequest::new(400, format!("Invalid login name '{login}'")).into());
        }
        if login == current_login {
            return Err(AbortRequest::new(400, "You should not delete yourself.").into());
        }
        if store.users.remove(&login).is_none() {
            return Err(AbortRequest::new(404, "Cannot delete, user does not exist.").into());
        }
        store.passwords.remove(&login);
        tracing::info!("deleting user {login}");
        self.dump(&store).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager_with(lines: &str) -> (tempfile::TempDir, SecurityManager) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passwd");
        tokio::fs::write(&path, lines).await.unwrap();
        (dir, SecurityManager::new(path))
    }

    #[tokio::test]
    async fn parses_users_and_checks_passwords() {
        let (_dir, manager) = manager_with(
            "# comment\n\
             alice:alice:WDRSTAN:topsecret\n\
             bob::RS:with:colons:inside\n\
             disabled::RS:\n\
             Bad Login::RS:pw\n",
        )
        .await;
        let alice = manager.get_user("alice").await.unwrap().unwrap();
        assert_eq!(alice.prefix, "alice");
        assert!(alice.has_perms("WDR"));
        assert!(!manager
            .get_user("bob")
            .await
            .unwrap()
            .unwrap()
            .has_perms("W"));
        assert!(manager.check_password("alice", "topsecret").await.unwrap());
        assert!(!manager.check_password("alice", "wrong").await.unwrap());
        // the password keeps embedded colons
        assert!(manager
            .check_password("bob", "with:colons:inside")
            .await
            .unwrap());
        // empty password disables the account
        assert!(!manager.check_password("disabled", "").await.unwrap());
        // malformed login line was skipped
        assert!(manager.get_user("bad login").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_and_delete_rewrite_the_file() {
        let (dir, manager) = manager_with("admin::A:adminpw\n").await;
        manager
            .save_user("carol", "carol", "XWRS", Some("carolpw"), "admin")
            .await
            .unwrap();
        // unknown permission codes are filtered out
        let carol = manager.get_user("carol").await.unwrap().unwrap();
        assert_eq!(carol.perms, "WRS");
        let text = tokio::fs::read_to_string(dir.path().join("passwd"))
            .await
            .unwrap();
        assert!(text.contains("carol:carol:WRS:carolpw"));
        assert!(dir.path().join("passwd.bak").exists());

        manager.delete_user("carol", "admin").await.unwrap();
        let text = tokio::fs::read_to_string(dir.path().join("passwd"))
            .await
            .unwrap();
        assert!(!text.contains("carol"));
    }

    #[tokio::test]
    async fn save_user_validations() {
        let (_dir, manager) = manager_with("admin::A:adminpw\n").await;
        // self modification
        assert!(manager
            .save_user("admin", "", "A", None, "admin")
            .await
            .is_err());
        // short password
        assert!(manager
            .save_user("dave", "", "RS", Some("tiny"), "admin")
            .await
            .is_err());
        // password equals login
        assert!(manager
            .save_user("davedave", "", "RS", Some("davedave"), "admin")
            .await
            .is_err());
        // bad prefix
        assert!(manager
            .save_user("dave", "Bad/Prefix", "RS", Some("davepw"), "admin")
            .await
            .is_err());
        // deleting a missing user
        assert!(manager.delete_user("ghost", "admin").await.is_err());
    }
}
