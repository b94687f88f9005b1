//! Handshake negotiation against a scripted server.

use std::time::Duration;

use ouro_net::{handshake, Connection, ConnectionConfig, Mode, ProtocolError};
use ouro_protocol::handshake::{RefuseReason, VersionData};

use crate::harness::{ChannelObserver, ScriptedPeer};

const MAINNET_MAGIC: u32 = 764824073;

#[tokio::test]
async fn test_node_to_client_accept() -> anyhow::Result<()> {
    let (client_io, server_io) = tokio::io::duplex(16384);
    let mode = Mode::NodeToClient;
    let mut config = ConnectionConfig::new(mode, MAINNET_MAGIC);
    config.handshake = config.handshake.with_protocol_versions(vec![1]);
    let (observer, _events) = ChannelObserver::new();

    let server = tokio::spawn(async move {
        let mut peer = ScriptedPeer::new(server_io, mode);
        let propose = peer.expect_handshake().await;
        match propose {
            handshake::Message::ProposeVersions { version_map } => {
                assert_eq!(version_map.keys().copied().collect::<Vec<_>>(), vec![1]);
                assert_eq!(
                    version_map[&1],
                    VersionData::NodeToClient {
                        network_magic: MAINNET_MAGIC
                    }
                );
            }
            other => panic!("expected ProposeVersions, got {other:?}"),
        }
        peer.send_handshake(&handshake::Message::AcceptVersion {
            version: 1,
            version_data: VersionData::NodeToClient {
                network_magic: MAINNET_MAGIC,
            },
        })
        .await;
        peer
    });

    let conn = Connection::connect(client_io, config, observer).await?;
    assert_eq!(conn.version(), 1);
    assert!(!conn.full_duplex());

    let _peer = server.await?;
    Ok(())
}

#[tokio::test]
async fn test_node_to_node_full_duplex_accept() -> anyhow::Result<()> {
    let (client_io, server_io) = tokio::io::duplex(16384);
    let mode = Mode::NodeToNode;
    let mut config = ConnectionConfig::new(mode, 2);
    config.handshake = config
        .handshake
        .with_protocol_versions(vec![7])
        .with_full_duplex(true);
    let (observer, _events) = ChannelObserver::new();

    let server = tokio::spawn(async move {
        let mut peer = ScriptedPeer::new(server_io, mode);
        let propose = peer.expect_handshake().await;
        match propose {
            handshake::Message::ProposeVersions { version_map } => {
                assert_eq!(
                    version_map[&7],
                    VersionData::NodeToNode {
                        network_magic: 2,
                        initiator_and_responder: true
                    }
                );
            }
            other => panic!("expected ProposeVersions, got {other:?}"),
        }
        peer.send_handshake(&handshake::Message::AcceptVersion {
            version: 7,
            version_data: VersionData::NodeToNode {
                network_magic: 2,
                initiator_and_responder: true,
            },
        })
        .await;
        peer
    });

    let conn = Connection::connect(client_io, config, observer).await?;
    assert_eq!(conn.version(), 7);
    assert!(conn.full_duplex());

    let _peer = server.await?;
    Ok(())
}

#[tokio::test]
async fn test_refuse_version_mismatch() {
    let (client_io, server_io) = tokio::io::duplex(16384);
    let mode = Mode::NodeToNode;
    let mut config = ConnectionConfig::new(mode, 2);
    config.handshake = config.handshake.with_protocol_versions(vec![3]);
    let (observer, _events) = ChannelObserver::new();

    let server = tokio::spawn(async move {
        let mut peer = ScriptedPeer::new(server_io, mode);
        let _propose = peer.expect_handshake().await;
        peer.send_handshake(&handshake::Message::Refuse(
            RefuseReason::VersionMismatch {
                supported: vec![4, 5, 6],
            },
        ))
        .await;
        peer
    });

    let err = Connection::connect(client_io, config, observer)
        .await
        .unwrap_err();
    match err {
        ProtocolError::HandshakeRefused(RefuseReason::VersionMismatch { supported }) => {
            assert_eq!(supported, vec![4, 5, 6]);
        }
        other => panic!("expected HandshakeRefused, got {other:?}"),
    }

    let _peer = server.await.unwrap();
}

#[tokio::test]
async fn test_confirm_timeout() {
    let (client_io, server_io) = tokio::io::duplex(16384);
    let mode = Mode::NodeToClient;
    let mut config = ConnectionConfig::new(mode, 42);
    config.handshake = config.handshake.with_timeout(Duration::from_millis(100));
    let (observer, _events) = ChannelObserver::new();

    let server = tokio::spawn(async move {
        let mut peer = ScriptedPeer::new(server_io, mode);
        let _propose = peer.expect_handshake().await;
        // Say nothing; the Confirm deadline must fire on the client.
        tokio::time::sleep(Duration::from_secs(1)).await;
        peer
    });

    let err = Connection::connect(client_io, config, observer)
        .await
        .unwrap_err();
    assert!(
        matches!(err, ProtocolError::StateTimeout { state: "Confirm", .. }),
        "expected Confirm timeout, got {err:?}"
    );

    let _peer = server.await.unwrap();
}
