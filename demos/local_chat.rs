//! Two nodes chatting over loopback with an in-process directory.
//!
//! This example shows how to:
//! - Start nodes against a shared directory
//! - Resolve a friend and send a message directly
//! - Fall back to the offline queue when the recipient is down

use p2pchat::{
    network::MemoryDirectory,
    utils::StorageConfig,
    ChatConfig, DirectoryClient, Node, NodeKeys,
};
use std::sync::Arc;
use tokio::time::{timeout, Duration};

fn config(username: &str, data_dir: &std::path::Path) -> ChatConfig {
    let mut config = ChatConfig::default();
    config.node.username = username.to_string();
    config.node.listen_host = "127.0.0.1".to_string();
    config.node.listen_port = 0;
    config.storage = StorageConfig::under(data_dir.join(username));
    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("p2pchat - local chat example");
    println!("============================");

    let data_dir = tempfile::tempdir()?;
    let directory = Arc::new(MemoryDirectory::new());
    let shared: Arc<dyn DirectoryClient> = directory.clone();

    let (alice, _) = Node::start(config("alice", data_dir.path()), NodeKeys::generate()?, shared.clone()).await?;
    let (bob, mut bob_inbox) = Node::start(config("bob", data_dir.path()), NodeKeys::generate()?, shared).await?;
    alice.register().await?;
    bob.register().await?;
    println!("alice listening on {}", alice.local_addr());
    println!("bob listening on {}", bob.local_addr());

    let friend = alice.add_friend("bob").await?;
    println!("alice added bob (fingerprint {})", friend.fingerprint());

    let report = alice.send_message("bob", "hello").await?;
    println!("alice -> bob: {report}");
    if let Some(message) = timeout(Duration::from_secs(5), bob_inbox.recv()).await? {
        println!("bob received from {}: {}", message.from, message.text);
    }

    // Take bob down and point his record at a dead port.
    bob.shutdown().await;
    directory.set_address("bob", "127.0.0.1:1").await;
    alice.add_friend("bob").await?;

    let report = alice.send_message("bob", "are you there?").await?;
    println!("alice -> bob: {report}");
    println!("messages waiting for bob: {}", directory.pending_offline("bob").await);

    println!("Shutting down...");
    alice.shutdown().await;
    Ok(())
}
