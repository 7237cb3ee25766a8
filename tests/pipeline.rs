//! End-to-end tests: device sockets -> sessions -> hub -> writer -> store

use futures_util::SinkExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::FramedWrite;

use waypoint::server::Utf8FrameCodec;
use waypoint::{
    BatchedWriter, ConnectionServer, DeviceId, DeviceServer, DispatchHub, FlushOutcome,
    GpsListener, GpsRecord, ListenerError, MemoryStore, SqliteStore, WriterConfig,
};

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl GpsListener for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn on_update(&self, record: &GpsRecord) -> Result<(), ListenerError> {
        let id = record.device_id().map(|d| d.to_string()).unwrap_or_default();
        self.events
            .lock()
            .push(format!("update:{}:{}", id, record.sampled_at()));
        Ok(())
    }

    fn on_connect(&self, device: &DeviceId) -> Result<(), ListenerError> {
        self.events.lock().push(format!("connect:{}", device));
        Ok(())
    }

    fn on_disconnect(&self, device: &DeviceId) -> Result<(), ListenerError> {
        self.events.lock().push(format!("disconnect:{}", device));
        Ok(())
    }
}

struct Pipeline {
    server: ConnectionServer<DeviceServer>,
    writer: Arc<BatchedWriter>,
    recorder: Arc<Recorder>,
}

async fn pipeline(store: Arc<dyn waypoint::BackingStore>) -> Pipeline {
    let writer = Arc::new(BatchedWriter::new(store, WriterConfig::default()));
    writer.connect().await.unwrap();

    let recorder = Arc::new(Recorder::default());
    let hub = Arc::new(DispatchHub::new());
    hub.register(writer.clone());
    hub.register(recorder.clone());

    let server = ConnectionServer::bind("127.0.0.1:0", Arc::new(DeviceServer::new(hub)))
        .await
        .unwrap();
    assert!(server.start());

    Pipeline {
        server,
        writer,
        recorder,
    }
}

async fn device(server: &ConnectionServer<DeviceServer>) -> FramedWrite<TcpStream, Utf8FrameCodec> {
    let stream = TcpStream::connect(server.local_addr()).await.unwrap();
    FramedWrite::new(stream, Utf8FrameCodec)
}

fn update(ts: i64) -> String {
    format!(
        r#"{{"timestamp":{},"lat":49.2,"lon":-123.1,"altitude":10.0,"speed":0.0}}"#,
        ts
    )
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5s");
}

#[tokio::test]
async fn identified_device_flows_to_listeners_and_store() {
    let store = Arc::new(MemoryStore::new());
    let p = pipeline(store.clone()).await;

    let mut dev = device(&p.server).await;
    dev.send(r#"{"id":"AA:BB:CC"}"#).await.unwrap();
    dev.send(update(1000)).await.unwrap();

    wait_for(|| p.recorder.events().len() == 2).await;
    assert_eq!(
        p.recorder.events(),
        vec!["connect:AA:BB:CC", "update:AA:BB:CC:1000"]
    );

    assert_eq!(p.writer.flush().await.unwrap(), FlushOutcome::Written(1));
    let stored = store.records();
    assert_eq!(stored[0].device_id().unwrap().as_str(), "AA:BB:CC");
    assert_eq!(stored[0].lat(), 49.2);

    drop(dev);
    wait_for(|| p.recorder.events().len() == 3).await;
    assert_eq!(p.recorder.events()[2], "disconnect:AA:BB:CC");
    wait_for(|| p.server.connection_count() == 0).await;

    p.server.stop().await;
}

#[tokio::test]
async fn anonymous_device_updates_without_presence_events() {
    let store = Arc::new(MemoryStore::new());
    let p = pipeline(store.clone()).await;

    let mut dev = device(&p.server).await;
    dev.send(update(7)).await.unwrap();
    wait_for(|| p.recorder.events().len() == 1).await;

    drop(dev);
    wait_for(|| p.server.connection_count() == 0).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(p.recorder.events(), vec!["update::7"]);

    p.server.stop().await;
}

#[tokio::test]
async fn malformed_messages_do_not_close_the_connection() {
    let store = Arc::new(MemoryStore::new());
    let p = pipeline(store.clone()).await;

    let mut dev = device(&p.server).await;
    dev.send("definitely not json").await.unwrap();
    dev.send(r#"{"timestamp":1}"#).await.unwrap();
    dev.send(r#"{"id":"dev"}"#).await.unwrap();
    dev.send(update(2)).await.unwrap();

    wait_for(|| p.recorder.events().len() == 2).await;
    assert_eq!(p.recorder.events(), vec!["connect:dev", "update:dev:2"]);
    assert_eq!(p.server.connection_count(), 1);
    assert_eq!(p.server.handler().stats().malformed_messages, 2);

    p.server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_devices_keep_their_own_order() {
    let store = Arc::new(MemoryStore::new());
    let p = pipeline(store.clone()).await;

    let mut tasks = Vec::new();
    for name in ["dev-a", "dev-b"] {
        let mut dev = device(&p.server).await;
        tasks.push(tokio::spawn(async move {
            dev.send(format!(r#"{{"id":"{}"}}"#, name)).await.unwrap();
            for ts in 0..1000 {
                dev.send(update(ts)).await.unwrap();
            }
            dev
        }));
    }

    let mut devices = Vec::new();
    for task in tasks {
        devices.push(task.await.unwrap());
    }

    wait_for(|| p.writer.stats().appended == 2000).await;
    p.writer.flush().await.unwrap();

    let mut per_device: HashMap<String, Vec<i64>> = HashMap::new();
    for record in store.records() {
        per_device
            .entry(record.device_id().unwrap().to_string())
            .or_default()
            .push(record.sampled_at());
    }
    assert_eq!(per_device.len(), 2);
    for timestamps in per_device.values() {
        assert_eq!(*timestamps, (0..1000).collect::<Vec<i64>>());
    }

    drop(devices);
    p.server.stop().await;
}

#[tokio::test]
async fn stop_closes_devices_and_announces_disconnects() {
    let store = Arc::new(MemoryStore::new());
    let p = pipeline(store.clone()).await;

    let mut dev = device(&p.server).await;
    dev.send(r#"{"id":"tracker"}"#).await.unwrap();
    wait_for(|| p.recorder.events().len() == 1).await;

    p.server.stop().await;
    assert!(!p.server.is_running());

    wait_for(|| p.recorder.events().len() == 2).await;
    assert_eq!(p.recorder.events()[1], "disconnect:tracker");
    assert!(TcpStream::connect(p.server.local_addr()).await.is_err());
}

#[tokio::test]
async fn records_buffered_during_outage_reach_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let sqlite = Arc::new(SqliteStore::new(dir.path().join("waypoint.db")));
    let p = pipeline(sqlite.clone()).await;

    p.writer.disconnect().await;

    let mut dev = device(&p.server).await;
    dev.send(r#"{"id":"dev"}"#).await.unwrap();
    for ts in 0..50 {
        dev.send(update(ts)).await.unwrap();
    }
    wait_for(|| p.writer.stats().appended == 50).await;

    assert_eq!(
        p.writer.flush().await.unwrap(),
        FlushOutcome::Disconnected { pending: 50 }
    );

    p.writer.connect().await.unwrap();
    assert_eq!(p.writer.flush().await.unwrap(), FlushOutcome::Written(50));
    assert_eq!(sqlite.count().await.unwrap(), 50);

    p.server.stop().await;
}
