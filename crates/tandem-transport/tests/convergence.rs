//! Several clients editing one document over loopback connections

use std::sync::Arc;
use std::time::Duration;
use tandem_client::{ChannelTransport, ClientConfig, ClientHandle, Snapshot, SyncClient};
use tandem_core::{DocumentName, Step};
use tandem_protocol::Codec;
use tandem_storage::{MemoryStorage, Storage};
use tandem_transport::{LoopbackServer, SessionOrchestrator};

struct Fixture {
    storage: Arc<MemoryStorage>,
    server: LoopbackServer,
    doc: DocumentName,
}

impl Fixture {
    fn new() -> Self {
        let storage = Arc::new(MemoryStorage::new());
        let session = Arc::new(SessionOrchestrator::new(storage.clone()));
        Self {
            storage,
            server: LoopbackServer::new(session),
            doc: DocumentName::new("shared").unwrap(),
        }
    }

    fn connect(&self, codec: Codec) -> ClientHandle {
        let connection = self.server.connect();
        let transport = ChannelTransport::new(connection.sender, connection.receiver);
        let config = ClientConfig::new(self.doc.clone()).with_codec(codec);
        let (handle, _events, _task) = SyncClient::spawn(transport, config);
        handle
    }

    /// Wait until every client confirmed the whole server history
    async fn settle(&self, clients: &[&ClientHandle]) -> Vec<Snapshot> {
        let wait = async {
            loop {
                let length = self.server.session().coordinator().history_length(&self.doc);
                let mut snapshots = Vec::new();
                for client in clients {
                    snapshots.push(client.snapshot().await.unwrap());
                }
                if snapshots
                    .iter()
                    .all(|s| s.is_settled() && s.history.end() == length && s.text == snapshots[0].text)
                {
                    return snapshots;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("clients did not converge")
    }
}

#[tokio::test]
async fn test_concurrent_inserts_converge() {
    let fixture = Fixture::new();
    let a = fixture.connect(Codec::Json);
    let b = fixture.connect(Codec::MessagePack);
    let c = fixture.connect(Codec::Json);
    fixture.settle(&[&a, &b, &c]).await;

    a.insert(0, "alpha ").unwrap();
    b.insert(0, "beta ").unwrap();
    c.insert(0, "gamma ").unwrap();
    let snapshots = fixture.settle(&[&a, &b, &c]).await;

    let text = &snapshots[0].text;
    assert_eq!(text.len(), "alpha beta gamma ".len());
    for word in ["alpha ", "beta ", "gamma "] {
        assert!(text.contains(word), "{:?} missing from {:?}", word, text);
    }

    let stored = fixture.storage.load(&fixture.doc).await.unwrap();
    assert_eq!(stored.end(), snapshots[0].history.end());
}

#[tokio::test]
async fn test_interleaved_edits_converge() {
    let fixture = Fixture::new();
    let a = fixture.connect(Codec::Json);
    let b = fixture.connect(Codec::Json);
    fixture.settle(&[&a, &b]).await;

    a.insert(0, "hello world").unwrap();
    fixture.settle(&[&a, &b]).await;

    for i in 0..5 {
        a.insert(0, format!("{}", i)).unwrap();
        b.insert(0, "!").unwrap();
        tokio::time::sleep(Duration::from_millis(7)).await;
    }
    let snapshots = fixture.settle(&[&a, &b]).await;

    let text = &snapshots[0].text;
    assert_eq!(text.chars().filter(|c| *c == '!').count(), 5);
    assert_eq!(text.chars().filter(char::is_ascii_digit).count(), 5);
    assert!(text.ends_with("hello world"), "{:?}", text);
    assert_eq!(snapshots[0].history.transactions(), snapshots[1].history.transactions());
}

#[tokio::test]
async fn test_conflicting_edits_converge() {
    let fixture = Fixture::new();
    let a = fixture.connect(Codec::Json);
    let b = fixture.connect(Codec::Json);
    fixture.settle(&[&a, &b]).await;

    a.insert(0, "hello world").unwrap();
    fixture.settle(&[&a, &b]).await;

    // B types inside the range A deletes; whichever lands second adapts
    a.edit(vec![Step::delete(3, "lo wo")]).unwrap();
    b.insert(5, "X").unwrap();
    let snapshots = fixture.settle(&[&a, &b]).await;

    let text = &snapshots[0].text;
    assert!(text.starts_with("hel"), "{:?}", text);
    assert!(text.ends_with("rld"), "{:?}", text);
    assert!(!text.contains("lo wo"), "{:?}", text);
}

#[tokio::test]
async fn test_late_joiner_receives_history() {
    let fixture = Fixture::new();
    let a = fixture.connect(Codec::Json);
    fixture.settle(&[&a]).await;

    a.insert(0, "first").unwrap();
    a.insert(5, " second").unwrap();
    fixture.settle(&[&a]).await;

    let b = fixture.connect(Codec::MessagePack);
    let snapshots = fixture.settle(&[&a, &b]).await;
    assert_eq!(snapshots[1].text, "first second");
    assert_ne!(snapshots[0].author_id, snapshots[1].author_id);
}
