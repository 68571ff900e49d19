//! Two in-process clients editing one document
//!
//! Run with: cargo run -p tandem-transport --example loopback

use std::sync::Arc;
use std::time::Duration;
use tandem_client::{ChannelTransport, ClientConfig, ClientHandle, SyncClient};
use tandem_core::{AuthorPatch, DocumentName, Selection};
use tandem_storage::MemoryStorage;
use tandem_transport::{LoopbackServer, SessionOrchestrator};

fn connect(server: &LoopbackServer, doc: &DocumentName) -> ClientHandle {
    let connection = server.connect();
    let transport = ChannelTransport::new(connection.sender, connection.receiver);
    let (handle, _events, _task) = SyncClient::spawn(transport, ClientConfig::new(doc.clone()));
    handle
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("Tandem Loopback Example\n");

    let session = Arc::new(SessionOrchestrator::new(Arc::new(MemoryStorage::new())));
    let server = LoopbackServer::new(session.clone());
    let doc = DocumentName::new("demo:notes")?;

    let alice = connect(&server, &doc);
    let bob = connect(&server, &doc);
    alice.change_author(AuthorPatch {
        name: Some("Alice".into()),
        color: None,
    })?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    alice.insert(0, "Hello from Alice. ")?;
    bob.insert(0, "Bob was here. ")?;
    bob.select(Selection::caret(3))?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let a = alice.snapshot().await?;
    let b = bob.snapshot().await?;
    println!("Alice sees: {:?}", a.text);
    println!("Bob sees:   {:?}", b.text);
    println!(
        "Server history: {} transactions",
        session.coordinator().history_length(&doc)
    );

    for (id, author) in session.coordinator().authors(&doc) {
        println!("  - author {} ({}, {})", id, author.name, author.color);
    }

    alice.shutdown()?;
    bob.shutdown()?;
    Ok(())
}
