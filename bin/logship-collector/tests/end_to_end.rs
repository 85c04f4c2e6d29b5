//! Shipping client against a collector writing to disk

use logship_client::{ClientBufferStore, SenderConfig, WireProtocolClient};
use logship_collector::{
    DedupStore, DiskSink, LoggingListener, ServerMetrics, ServerSettings, WireProtocolServer,
};
use logship_common::config::StorageConfig;
use logship_common::{Ack, AckCode, ClientId, Error, StreamKey};
use logship_proto::{RecordBlock, WireFrame, read_ack, write_handshake};
use logship_storage::{Sidecar, StreamWriterCache};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{TempDir, tempdir};
use tokio::net::TcpStream;

struct Collector {
    server: Arc<WireProtocolServer>,
    cache: Arc<StreamWriterCache>,
    addr: SocketAddr,
    root: PathBuf,
}

async fn start_collector(dir: &TempDir, min_free_bytes: u64) -> Collector {
    let root = dir.path().join("data");
    let cache = Arc::new(StreamWriterCache::new(StorageConfig {
        root_dir: root.clone(),
        min_free_bytes,
        ..StorageConfig::default()
    }));
    let metrics = Arc::new(ServerMetrics::default());
    let server = Arc::new(WireProtocolServer::new(
        ServerSettings {
            listen: "127.0.0.1:0".into(),
            max_buffer_size: 1024 * 1024,
            max_connections: 8,
            io_timeout: Duration::from_secs(5),
        },
        Arc::new(DiskSink::new(cache.clone())),
        Arc::new(DedupStore::open(dir.path().join("dedup.redb")).unwrap()),
        Arc::new(LoggingListener::new(metrics.clone())),
        metrics,
    ));
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    server.serve(listener);
    Collector {
        server,
        cache,
        addr,
        root,
    }
}

fn client_for(addr: SocketAddr, store: Arc<ClientBufferStore>) -> WireProtocolClient {
    WireProtocolClient::new(
        SenderConfig {
            server_addr: addr.to_string(),
            client_id: ClientId::new(7),
            send_interval: Duration::from_millis(20),
            io_timeout: Duration::from_secs(5),
            ready_queue_threshold: 100,
        },
        store,
    )
}

fn stream_key() -> StreamKey {
    StreamKey::new("web", "access", "host-a", 0, 1).unwrap()
}

fn lines(rows: &[&str]) -> Vec<u8> {
    let mut block = RecordBlock::new(vec!["line".into()], vec!["string".into()]).unwrap();
    for row in rows {
        block.push_row(vec![(*row).to_string()]).unwrap();
    }
    block.encode().unwrap()
}

fn data_files(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return found;
    };
    for entry in entries {
        let path = entry.unwrap().path();
        if path.is_dir() {
            found.extend(data_files(&path));
        } else if path.extension().is_some_and(|ext| ext == "tsv") {
            found.push(path);
        }
    }
    found.sort();
    found
}

#[tokio::test]
async fn test_shipped_rows_land_in_rotated_file() {
    let dir = tempdir().unwrap();
    let collector = start_collector(&dir, 0).await;

    let store = Arc::new(ClientBufferStore::in_memory(64 * 1024));
    store.put(&stream_key(), &lines(&["GET /", "GET /a"])).unwrap();
    let client = client_for(collector.addr, store.clone());
    assert_eq!(client.tick().await.unwrap(), 1);
    assert_eq!(store.ready_len(), 0);

    collector.cache.close_all();
    let files = data_files(&collector.root.join("access"));
    assert_eq!(files.len(), 1);
    let name = files[0].file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.ends_with("-host-a.v1.tsv"), "unexpected name {name}");
    assert_eq!(
        std::fs::read_to_string(&files[0]).unwrap(),
        "line\nGET /\nGET /a\n"
    );

    let sidecar = Sidecar::read(&files[0]).unwrap();
    assert_eq!(sidecar.log_type, "access");
    assert_eq!(sidecar.client_hostname, "host-a");
    assert_eq!(sidecar.properties.get("ROW_COUNT").map(String::as_str), Some("2"));

    client.close().await;
    collector.server.close();
}

#[tokio::test]
async fn test_replayed_sequence_is_not_written_twice() {
    let dir = tempdir().unwrap();
    let collector = start_collector(&dir, 0).await;

    let key = stream_key();
    let payload = lines(&["once"]);
    let store = Arc::new(ClientBufferStore::in_memory(64 * 1024));
    store.put(&key, &payload).unwrap();
    let client = client_for(collector.addr, store.clone());
    client.tick().await.unwrap();
    let shipped = store.next_sequence(&key) - 1;

    // Same client identity replays the acknowledged id, as after a lost ack
    let mut stream = TcpStream::connect(collector.addr).await.unwrap();
    write_handshake(&mut stream, ClientId::new(7)).await.unwrap();
    WireFrame::new(shipped, key.clone(), payload.clone())
        .write_to(&mut stream)
        .await
        .unwrap();
    let size = u32::try_from(payload.len()).unwrap();
    assert_eq!(read_ack(&mut stream).await.unwrap(), Ack::Accepted(size));
    let duplicates = collector.server.metrics().duplicates.load(std::sync::atomic::Ordering::Relaxed);
    assert_eq!(duplicates, 1);

    collector.cache.close_all();
    let files = data_files(&collector.root.join("access"));
    assert_eq!(std::fs::read_to_string(&files[0]).unwrap(), "line\nonce\n");

    client.close().await;
    collector.server.close();
}

#[tokio::test]
async fn test_unavailable_backend_keeps_client_data() {
    let dir = tempdir().unwrap();
    let collector = start_collector(&dir, u64::MAX).await;

    let store = Arc::new(ClientBufferStore::in_memory(64 * 1024));
    store.put(&stream_key(), &lines(&["kept"])).unwrap();
    let client = client_for(collector.addr, store.clone());

    // The collector may reset the connection before the ack is read
    match client.tick().await {
        Err(Error::Rejected(code)) => assert_eq!(code, AckCode::BackendUnavailable),
        Err(_) => {}
        Ok(n) => panic!("{n} payloads accepted by an unavailable collector"),
    }
    assert_eq!(store.ready_len(), 1);
    assert!(!client.availability().is_operational());
    assert!(data_files(&collector.root).is_empty());

    client.close().await;
    collector.server.close();
}

#[tokio::test]
async fn test_persisted_client_state_ships_after_restart() {
    let dir = tempdir().unwrap();
    let collector = start_collector(&dir, 0).await;
    let state = dir.path().join("client.state");

    {
        let store = ClientBufferStore::open(64 * 1024, &state);
        store.put(&stream_key(), &lines(&["before crash"])).unwrap();
        store.close().unwrap();
    }

    let store = Arc::new(ClientBufferStore::open(64 * 1024, &state));
    let client = client_for(collector.addr, store.clone());
    assert_eq!(client.tick().await.unwrap(), 1);

    collector.cache.close_all();
    let files = data_files(&collector.root.join("access"));
    assert_eq!(
        std::fs::read_to_string(&files[0]).unwrap(),
        "line\nbefore crash\n"
    );

    client.close().await;
    collector.server.close();
}
