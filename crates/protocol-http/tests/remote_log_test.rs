use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use common::{BlobId, NamespaceId, ObjectKey};
use protocol_http::{LogServer, LogView, RemoteLogClient};
use reqwest::Url;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use txlog::codec::HEADER_LEN;
use txlog::{LogOptions, LogRegistry, TransactionEvent};

struct Running {
    dir: TempDir,
    registry: Arc<LogRegistry>,
    client: RemoteLogClient,
    shutdown: CancellationToken,
    server: JoinHandle<anyhow::Result<()>>,
}

impl Running {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let options = LogOptions::builder(dir.path()).sync_appends(false).build();
        let registry = Arc::new(LogRegistry::open(options).unwrap());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(LogServer::serve(
            listener,
            Arc::new(LogView::new(registry.clone())),
            shutdown.clone(),
        ));

        let base = Url::parse(&format!("http://{addr}/")).unwrap();
        Self {
            dir,
            registry,
            client: RemoteLogClient::new(base).unwrap(),
            shutdown,
            server,
        }
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.server.await.unwrap().unwrap();
    }
}

fn add(name: &str) -> TransactionEvent {
    TransactionEvent::add(ObjectKey::new("bucket", name), vec![BlobId::of(name.as_bytes())])
}

#[tokio::test]
async fn remote_read_follows_local_cursor_semantics() {
    let running = Running::start().await;
    let ns = NamespaceId::new("photos");
    let log = running.registry.get_or_create(&ns).unwrap();
    let seen = log.site_mask(["eu"]).unwrap();
    log.append(&add("a").seen_at(seen)).unwrap();
    log.append(&add("b")).unwrap();
    log.append(&add("c").seen_at(seen)).unwrap();

    assert_eq!(running.client.namespaces().await.unwrap(), vec![ns.clone()]);

    let all = running.client.read(&ns, 0, 10, None).await.unwrap();
    assert_eq!(all, log.read(0, 10, None).unwrap());
    assert_eq!(all.entries.len(), 3);

    let for_eu = running.client.read(&ns, 0, 10, Some("eu")).await.unwrap();
    assert_eq!(for_eu.entries.len(), 1);
    assert_eq!(for_eu.entries[0].event, add("b"));
    assert_eq!(for_eu.next_offset, log.size_bytes().unwrap());

    let page = running.client.read(&ns, 0, 1, None).await.unwrap();
    assert_eq!(page.entries.len(), 1);
    let rest = running
        .client
        .read(&ns, page.next_offset, 10, None)
        .await
        .unwrap();
    assert_eq!(rest.entries.len(), 2);

    running.stop().await;
}

#[tokio::test]
async fn unknown_and_invalid_namespaces_are_rejected() {
    let running = Running::start().await;

    let missing = running
        .client
        .read(&NamespaceId::new("nobody"), 0, 10, None)
        .await
        .unwrap_err();
    assert!(missing.is_not_found());

    let invalid = running
        .client
        .read(&NamespaceId::new(".hidden"), 0, 10, None)
        .await
        .unwrap_err();
    assert_eq!(invalid.status().as_u16(), 400);

    running.stop().await;
}

#[tokio::test]
async fn corrupt_record_is_a_server_error() {
    let running = Running::start().await;
    let ns = NamespaceId::new("broken");
    let log = running.registry.get_or_create(&ns).unwrap();
    log.append(&add("a")).unwrap();

    let path = running.dir.path().join("broken").join("transactions.log");
    let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(HEADER_LEN as u64)).unwrap();
    file.read_exact(&mut byte).unwrap();
    file.seek(SeekFrom::Start(HEADER_LEN as u64)).unwrap();
    file.write_all(&[byte[0] ^ 0x01]).unwrap();
    drop(file);

    let err = running.client.read(&ns, 0, 10, None).await.unwrap_err();
    assert_eq!(err.status().as_u16(), 500);
    assert!(err.to_string().contains("Checksum mismatch"));

    running.stop().await;
}

#[tokio::test]
async fn health_endpoint_answers() {
    let running = Running::start().await;
    let url = running.client.base_url().join("health").unwrap();
    let body: serde_json::Value = reqwest::get(url).await.unwrap().json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    running.stop().await;
}
