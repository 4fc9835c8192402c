//! Registry, manager, and channel lifecycle tests.

use anyhow::Result;
use chanmux::{ConnectionRegistry, Error, Message};
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn manager_requires_a_started_registry() {
    let registry = ConnectionRegistry::new();
    let err = registry.manager("127.0.0.1:9000").await.unwrap_err();
    assert!(matches!(err, Error::NotStarted));
}

#[tokio::test]
async fn double_start_and_bind_conflicts_are_rejected() -> Result<()> {
    let registry = ConnectionRegistry::new();
    registry.start(0).await?;

    let err = registry.start(0).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyStarted));

    // a second registry on the same port surfaces the underlying bind error
    let port = registry.local_addr().await.expect("started").port();
    let other = ConnectionRegistry::new();
    let err = other.start(port).await.unwrap_err();
    assert!(matches!(err, Error::Io(_)));

    registry.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn duplicate_and_missing_channel_names_are_errors() -> Result<()> {
    let peer = TcpListener::bind("127.0.0.1:0").await?;
    let registry = ConnectionRegistry::new();
    registry.start(0).await?;
    let manager = registry.manager(&peer.local_addr()?.to_string()).await?;

    manager.new_channel("x", 10).await?;
    let err = manager.new_channel("x", 10).await.unwrap_err();
    assert!(matches!(err, Error::ChannelAlreadyExists { name } if name == "x"));

    let err = manager.get_channel("missing").await.unwrap_err();
    assert!(matches!(err, Error::NoSuchChannel { name } if name == "missing"));

    let err = manager.close_channel("missing").await.unwrap_err();
    assert!(matches!(err, Error::NoSuchChannel { .. }));

    registry.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn closed_channel_name_becomes_available_again() -> Result<()> {
    let peer = TcpListener::bind("127.0.0.1:0").await?;
    let registry = ConnectionRegistry::new();
    registry.start(0).await?;
    let manager = registry.manager(&peer.local_addr()?.to_string()).await?;

    let channel = manager.new_channel("x", 10).await?;
    manager.close_channel("x").await?;

    // the old handle observes closure on both directions
    assert!(channel.recv().await.is_none());
    assert!(channel.send(Message::text("late")).await.is_err());

    // the name can be reused
    manager.new_channel("x", 10).await?;

    registry.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn managers_are_matched_by_host_ignoring_port() -> Result<()> {
    let peer_one = TcpListener::bind("127.0.0.1:0").await?;
    let peer_two = TcpListener::bind("127.0.0.1:0").await?;

    let registry = ConnectionRegistry::new();
    registry.start(0).await?;

    let first = registry.manager(&peer_one.local_addr()?.to_string()).await?;
    first.new_channel("shared", 4).await?;

    // different port, same host: the existing manager is returned
    let second = registry.manager(&peer_two.local_addr()?.to_string()).await?;
    assert!(second.get_channel("shared").await.is_ok());

    registry.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn closing_a_manager_releases_its_host_entry() -> Result<()> {
    let peer = TcpListener::bind("127.0.0.1:0").await?;
    let addr = peer.local_addr()?.to_string();

    let registry = ConnectionRegistry::new();
    registry.start(0).await?;

    let manager = registry.manager(&addr).await?;
    manager.new_channel("x", 4).await?;
    manager.close().await;

    // a fresh manager comes back with an empty registry
    let reopened = registry.manager(&addr).await?;
    let err = reopened.get_channel("x").await.unwrap_err();
    assert!(matches!(err, Error::NoSuchChannel { .. }));

    registry.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn concurrent_channel_creation_loses_no_updates() -> Result<()> {
    let peer = TcpListener::bind("127.0.0.1:0").await?;
    let registry = ConnectionRegistry::new();
    registry.start(0).await?;
    let manager = registry.manager(&peer.local_addr()?.to_string()).await?;

    let mut tasks = Vec::new();
    for i in 0..8 {
        let manager = manager.clone();
        tasks.push(tokio::spawn(async move {
            manager.new_channel(&format!("chan-{i}"), 4).await
        }));
    }
    for task in tasks {
        task.await?.expect("distinct names all succeed");
    }

    for i in 0..8 {
        assert!(manager.get_channel(&format!("chan-{i}")).await.is_ok());
    }
    let err = manager.new_channel("chan-0", 4).await.unwrap_err();
    assert!(matches!(err, Error::ChannelAlreadyExists { .. }));

    registry.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn remote_channel_list_times_out_without_a_peer() -> Result<()> {
    let registry = ConnectionRegistry::new();
    registry.start(0).await?;

    // nothing listens on the far side, so no reply ever arrives
    let manager = registry.manager("127.0.0.1:1").await?;
    let err = timeout(Duration::from_secs(60), manager.remote_channels())
        .await?
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));

    registry.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn close_is_idempotent() -> Result<()> {
    let peer = TcpListener::bind("127.0.0.1:0").await?;
    let registry = ConnectionRegistry::new();
    registry.start(0).await?;

    let manager = registry.manager(&peer.local_addr()?.to_string()).await?;
    manager.close().await;
    manager.close().await;

    registry.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn early_inbound_data_waits_for_its_manager() -> Result<()> {
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    let peer = TcpListener::bind("127.0.0.1:0").await?;
    let registry = ConnectionRegistry::new();
    registry.start(0).await?;
    let port = registry.local_addr().await.expect("started").port();

    // a peer connects and sends before any manager exists for it
    let mut early = TcpStream::connect(("127.0.0.1", port)).await?;
    let line = serde_json::json!({"channelName": "x", "type": 1, "content": "kept"});
    early.write_all(format!("{line}\n").as_bytes()).await?;
    early.flush().await?;

    // give the listener a moment to park the unattached transport
    tokio::time::sleep(Duration::from_millis(100)).await;

    let manager = registry.manager(&peer.local_addr()?.to_string()).await?;
    let channel = manager.new_channel("x", 10).await?;

    let received = timeout(WAIT, channel.recv()).await?.expect("buffered message");
    assert_eq!(received.content, "kept");

    registry.shutdown().await;
    Ok(())
}
