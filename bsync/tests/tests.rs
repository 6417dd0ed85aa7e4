//! End-to-end tests driving a real server over HTTP.

use std::sync::Arc;

use anyhow::Result;

use bsync_tools_bsync::actions::{ActionServer, ServerConfig};
use bsync_tools_bsync::httpd;
use common::cryptfile::{self, hash_key};
use common::localfs::LocalFsProvider;
use common::provider::FsProvider;
use common::relpath::RelPath;
use common::syncdir::{self, SyncOptions};
use common::testutils;
use remote::blindfs::BlindFsProvider;
use remote::{Client, ClientConfig, RequestError};

const PASSWD: &str = "alice:alice:WDRSTAN:alicepw\nreader:alice:RS:readerpw\n";

struct TestServer {
    url: String,
    dir: tempfile::TempDir,
    shutdown: tokio_util::sync::CancellationToken,
    task: tokio::task::JoinHandle<Result<()>>,
}

impl TestServer {
    async fn start(poll_ttl: std::time::Duration) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let backup_root = dir.path().join("store");
        tokio::fs::create_dir(&backup_root).await.unwrap();
        let passwd_file = dir.path().join("passwd");
        tokio::fs::write(&passwd_file, PASSWD).await.unwrap();
        let server = Arc::new(ActionServer::new(ServerConfig {
            backup_root,
            passwd_file,
            tmp_dir: Some(dir.path().to_path_buf()),
            poll_ttl,
            poll_granularity: poll_ttl / 10,
        }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        let shutdown = tokio_util::sync::CancellationToken::new();
        let task = tokio::spawn(httpd::serve(server, listener, shutdown.clone()));
        Self {
            url,
            dir,
            shutdown,
            task,
        }
    }

    fn client(&self, login: &str, password: &str) -> Arc<Client> {
        Client::connect(ClientConfig {
            url: self.url.clone(),
            login: login.to_string(),
            password: password.to_string(),
            ca_cert: None,
        })
        .unwrap()
    }

    fn store_path(&self) -> std::path::PathBuf {
        self.dir.path().join("store/alice")
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.task.await.unwrap().unwrap();
    }
}

fn request_status(err: &anyhow::Error) -> Option<u16> {
    err.downcast_ref::<RequestError>().map(|err| err.status)
}

#[tokio::test]
async fn backup_restore_and_listing() {
    let server = TestServer::start(std::time::Duration::from_millis(500)).await;
    let client = server.client("alice", "alicepw");

    client.mkdir("docs").await.unwrap();
    assert!(client.directory_exists("docs").await.unwrap());
    assert!(!client.file_exists("docs/report.txt").await.unwrap());

    let staged = server.dir.path().join("upload");
    tokio::fs::write(&staged, b"quarterly numbers").await.unwrap();
    let outcome = client
        .backup(vec![("docs/report.txt".to_string(), staged)])
        .await
        .unwrap();
    assert_eq!(outcome["docs/report.txt"], "");

    assert!(client.file_exists("docs/report.txt").await.unwrap());
    assert!(client.check_exists("docs").await.unwrap());
    let (dirs, files) = client.list_dir(vec!["docs".to_string()]).await.unwrap();
    assert!(dirs.is_empty());
    assert_eq!(files, ["report.txt"]);

    let bytes = client.restore("docs/report.txt").await.unwrap();
    assert_eq!(&bytes[..], b"quarterly numbers");

    let infos = client
        .get_info("".to_string(), vec![vec!["docs".into(), "report.txt".into()]], false)
        .await
        .unwrap();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].size, 17);

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs_f64();
    let server_now = client.utcnow().await.unwrap();
    assert!((server_now - now).abs() < 60.0);

    server.stop().await;
}

#[tokio::test]
async fn push_then_pull_through_encrypted_server() {
    let server = TestServer::start(std::time::Duration::from_millis(500)).await;
    let client = server.client("alice", "alicepw");
    let key = hash_key("storage passphrase");

    let work = tempfile::tempdir().unwrap();
    let src = LocalFsProvider::new(&work.path().join("src"), true).unwrap();
    testutils::populate_tree(src.root()).await.unwrap();

    // push: the server ends up with ciphertext only
    let dst = BlindFsProvider::new(client.clone(), RelPath::root(), None);
    let options = SyncOptions {
        sync_deletes: true,
        ..Default::default()
    };
    syncdir::sync(&src, &dst, &options, None, Some(&key), None)
        .await
        .unwrap();

    // nothing on the server carries a plaintext name or plaintext bytes
    let mut entries = tokio::fs::read_dir(server.store_path()).await.unwrap();
    let mut found = 0;
    while let Some(entry) = entries.next_entry().await.unwrap() {
        let name = entry.file_name().into_string().unwrap();
        assert_ne!(name, "0.txt");
        assert_ne!(name, "bar");
        found += 1;
    }
    assert!(found >= 3, "expected encrypted entries on the server");
    let encrypted_name = cryptfile::encrypt_filename(&key, "0.txt");
    assert!(server.store_path().join(&encrypted_name).is_file());

    // the comparator agrees the push is complete
    let schedule = syncdir::compare(&src, &dst, &options, None, Some(&key))
        .await
        .unwrap();
    assert!(schedule.is_empty(), "{schedule:?}");

    // pull into a fresh directory, stripping the encryption again
    let restored = LocalFsProvider::new(&work.path().join("restored"), true).unwrap();
    syncdir::sync(&dst, &restored, &options, Some(&key), None, None)
        .await
        .unwrap();
    testutils::check_trees_identical(src.root(), restored.root())
        .await
        .unwrap();

    server.stop().await;
}

#[tokio::test]
async fn long_poll_delivers_changes_and_times_out_empty() {
    let poll_ttl = std::time::Duration::from_millis(500);
    let server = TestServer::start(poll_ttl).await;
    let client = server.client("alice", "alicepw");

    let observer = client.listen_changes("").await.unwrap();

    // no pending events: the poll comes back empty after roughly the TTL
    let started = std::time::Instant::now();
    let events = client.poll_changes(&observer).await.unwrap();
    assert!(events.is_empty());
    let elapsed = started.elapsed();
    assert!(
        elapsed >= poll_ttl / 2 && elapsed < poll_ttl * 4,
        "long poll returned after {elapsed:?}"
    );

    // a mutating action from another client shows up on the next poll
    let writer = server.client("alice", "alicepw");
    let work = tempfile::tempdir().unwrap();
    let src = LocalFsProvider::new(&work.path().join("src"), true).unwrap();
    tokio::fs::write(src.root().join("fresh.txt"), b"fresh")
        .await
        .unwrap();
    let dst = BlindFsProvider::new(writer, RelPath::root(), None);
    syncdir::sync(&src, &dst, &SyncOptions::default(), None, None, None)
        .await
        .unwrap();

    let events = client.poll_changes(&observer).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].path, "fresh.txt");
    assert_eq!(events[0].origin_uid, dst.uid());

    server.stop().await;
}

#[tokio::test]
async fn permissions_and_path_safety_surface_as_request_errors() {
    let server = TestServer::start(std::time::Duration::from_millis(300)).await;

    // reader lacks W
    let reader = server.client("reader", "readerpw");
    let err = reader.mkdir("newdir").await.unwrap_err();
    assert_eq!(request_status(&err), Some(403));

    // bad credentials
    let impostor = server.client("alice", "not-her-password");
    let err = impostor.utcnow().await.unwrap_err();
    assert_eq!(request_status(&err), Some(403));

    // unsafe paths are rejected before touching the filesystem
    let client = server.client("alice", "alicepw");
    for fname in ["../escape", "/abs/path", "glob*"] {
        let err = client.file_exists(fname).await.unwrap_err();
        assert_eq!(request_status(&err), Some(400), "{fname}");
    }
    let err = client.restore("../../etc/passwd").await.unwrap_err();
    assert_eq!(request_status(&err), Some(400));

    server.stop().await;
}

#[tokio::test]
async fn remote_to_remote_recryption() {
    // one server, two keys: push under key1, recode to key2 prefix
    let server = TestServer::start(std::time::Duration::from_millis(300)).await;
    let client = server.client("alice", "alicepw");
    let key1 = hash_key("first");
    let key2 = hash_key("second");

    let work = tempfile::tempdir().unwrap();
    let src_local = LocalFsProvider::new(&work.path().join("src"), true).unwrap();
    tokio::fs::write(src_local.root().join("doc"), b"the payload")
        .await
        .unwrap();

    client.mkdir("one").await.unwrap();
    client.mkdir("two").await.unwrap();
    let remote_one = BlindFsProvider::new(client.clone(), RelPath::parse("one").unwrap(), None);
    let remote_two = BlindFsProvider::new(client.clone(), RelPath::parse("two").unwrap(), None);

    let options = SyncOptions {
        sync_deletes: true,
        ..Default::default()
    };
    syncdir::sync(&src_local, &remote_one, &options, None, Some(&key1), None)
        .await
        .unwrap();
    // server-to-server: decrypt with key1, re-encrypt with key2 in transit
    syncdir::sync(&remote_one, &remote_two, &options, Some(&key1), Some(&key2), None)
        .await
        .unwrap();

    let name2 = cryptfile::encrypt_filename(&key2, "doc");
    let stored = server.store_path().join("two").join(&name2);
    assert!(stored.is_file(), "expected {name2} under two/");
    let decrypted = work.path().join("decrypted");
    cryptfile::decrypt_file(&key2, &stored, &decrypted)
        .await
        .unwrap();
    assert_eq!(tokio::fs::read(&decrypted).await.unwrap(), b"the payload");

    server.stop().await;
}
