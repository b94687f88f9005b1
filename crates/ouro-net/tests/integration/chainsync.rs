//! ChainSync flows against a scripted server: intersect, await semantics,
//! pipelining, and timeout isolation.

use std::time::Duration;

use ouro_net::{
    chainsync, Connection, ConnectionConfig, IntersectOutcome, Mode, Point, ProtocolError,
};
use ouro_protocol::chainsync::WrappedHeader;

use crate::harness::{next_event, tip, wait_until, ChannelObserver, Event, ScriptedPeer};

const MAGIC: u32 = 2;

fn config(mode: Mode) -> ConnectionConfig {
    let mut config = ConnectionConfig::new(mode, MAGIC);
    config.handshake = config.handshake.with_protocol_versions(vec![7]);
    config
}

#[tokio::test]
async fn test_find_intersect_found() -> anyhow::Result<()> {
    let mode = Mode::NodeToNode;
    let (client_io, server_io) = tokio::io::duplex(16384);
    let (observer, mut events) = ChannelObserver::new();

    let server = tokio::spawn(async move {
        let mut peer = ScriptedPeer::new(server_io, mode);
        peer.accept_handshake(7, MAGIC, false).await;

        let msg = peer.expect_chainsync().await;
        match msg {
            chainsync::Message::FindIntersect { points } => {
                assert_eq!(points, vec![Point::Origin, Point::specific(100, vec![0xAB; 32])]);
            }
            other => panic!("expected FindIntersect, got {other:?}"),
        }
        peer.send_chainsync(&chainsync::Message::IntersectFound {
            point: Point::specific(100, vec![0xAB; 32]),
            tip: tip(200, 0xCD, 200),
        })
        .await;
        peer
    });

    let conn = Connection::connect(client_io, config(mode), observer).await?;
    let outcome = conn
        .chainsync()
        .find_intersect(vec![Point::Origin, Point::specific(100, vec![0xAB; 32])])
        .await?;
    assert_eq!(
        outcome,
        IntersectOutcome::Found {
            point: Point::specific(100, vec![0xAB; 32]),
            tip: tip(200, 0xCD, 200),
        }
    );
    // Back to Idle, and no callback fired for the intersect itself.
    assert_eq!(conn.chainsync().state(), chainsync::STATE_IDLE);
    assert!(events.try_recv().is_err());

    let _peer = server.await?;
    Ok(())
}

#[tokio::test]
async fn test_intersect_not_found_keeps_protocol_usable() -> anyhow::Result<()> {
    let mode = Mode::NodeToNode;
    let (client_io, server_io) = tokio::io::duplex(16384);
    let (observer, mut events) = ChannelObserver::new();

    let server = tokio::spawn(async move {
        let mut peer = ScriptedPeer::new(server_io, mode);
        peer.accept_handshake(7, MAGIC, false).await;

        let _find = peer.expect_chainsync().await;
        peer.send_chainsync(&chainsync::Message::IntersectNotFound {
            tip: tip(200, 0xCD, 200),
        })
        .await;

        let _next = peer.expect_chainsync().await;
        peer.send_chainsync(&chainsync::Message::RollForward {
            header: WrappedHeader {
                era: 4,
                payload: vec![1, 2, 3],
            },
            tip: tip(201, 0xCE, 201),
        })
        .await;
        peer
    });

    let conn = Connection::connect(client_io, config(mode), observer).await?;
    let outcome = conn
        .chainsync()
        .find_intersect(vec![Point::specific(100, vec![0xAB; 32])])
        .await?;
    assert_eq!(
        outcome,
        IntersectOutcome::NotFound {
            tip: tip(200, 0xCD, 200)
        }
    );

    conn.chainsync().request_next().await?;
    let event = next_event(&mut events).await;
    assert_eq!(
        event,
        Event::Forward {
            era: 4,
            header: vec![1, 2, 3],
            tip: tip(201, 0xCE, 201),
        }
    );

    let _peer = server.await?;
    Ok(())
}

#[tokio::test]
async fn test_await_reply_then_roll_forward() -> anyhow::Result<()> {
    let mode = Mode::NodeToNode;
    let (client_io, server_io) = tokio::io::duplex(16384);
    let (observer, mut events) = ChannelObserver::new();

    let server = tokio::spawn(async move {
        let mut peer = ScriptedPeer::new(server_io, mode);
        peer.accept_handshake(7, MAGIC, false).await;

        let _next = peer.expect_chainsync().await;
        peer.send_chainsync(&chainsync::Message::AwaitReply).await;
        // Nothing new at the tip yet; reply arrives later, well inside the
        // block timeout.
        tokio::time::sleep(Duration::from_millis(200)).await;
        peer.send_chainsync(&chainsync::Message::RollForward {
            header: WrappedHeader {
                era: 5,
                payload: vec![0xFE; 16],
            },
            tip: tip(300, 0x11, 300),
        })
        .await;
        peer
    });

    let conn = Connection::connect(client_io, config(mode), observer).await?;
    conn.chainsync().request_next().await?;
    assert_eq!(conn.chainsync().in_flight(), 1);

    let event = next_event(&mut events).await;
    assert_eq!(
        event,
        Event::Forward {
            era: 5,
            header: vec![0xFE; 16],
            tip: tip(300, 0x11, 300),
        }
    );
    wait_until("in-flight to drain", Duration::from_secs(1), || {
        conn.chainsync().in_flight() == 0
    })
    .await;
    assert_eq!(conn.chainsync().state(), chainsync::STATE_IDLE);

    let _peer = server.await?;
    Ok(())
}

#[tokio::test]
async fn test_pipelined_replies_in_request_order() -> anyhow::Result<()> {
    let mode = Mode::NodeToNode;
    let (client_io, server_io) = tokio::io::duplex(16384);
    let (observer, mut events) = ChannelObserver::new();
    let mut config = config(mode);
    config.chainsync = config.chainsync.with_pipeline_limit(3);

    let server = tokio::spawn(async move {
        let mut peer = ScriptedPeer::new(server_io, mode);
        peer.accept_handshake(7, MAGIC, false).await;

        for _ in 0..3 {
            let msg = peer.expect_chainsync().await;
            assert_eq!(msg, chainsync::Message::RequestNext);
        }
        peer.send_chainsync(&chainsync::Message::RollForward {
            header: WrappedHeader {
                era: 4,
                payload: vec![1],
            },
            tip: tip(101, 0x01, 101),
        })
        .await;
        peer.send_chainsync(&chainsync::Message::AwaitReply).await;
        peer.send_chainsync(&chainsync::Message::RollBackward {
            point: Point::specific(90, vec![0x90; 32]),
            tip: tip(101, 0x01, 101),
        })
        .await;
        peer.send_chainsync(&chainsync::Message::RollForward {
            header: WrappedHeader {
                era: 4,
                payload: vec![3],
            },
            tip: tip(102, 0x02, 102),
        })
        .await;
        peer
    });

    let conn = Connection::connect(client_io, config, observer).await?;
    for _ in 0..3 {
        conn.chainsync().request_next().await?;
    }
    assert!(conn.chainsync().in_flight() <= 3);

    // Replies land in request order: h1, rollback, h3.
    match next_event(&mut events).await {
        Event::Forward { header, .. } => assert_eq!(header, vec![1]),
        other => panic!("expected roll forward first, got {other:?}"),
    }
    match next_event(&mut events).await {
        Event::Backward { point, .. } => {
            assert_eq!(point, Point::specific(90, vec![0x90; 32]));
        }
        other => panic!("expected roll backward second, got {other:?}"),
    }
    match next_event(&mut events).await {
        Event::Forward { header, .. } => assert_eq!(header, vec![3]),
        other => panic!("expected roll forward third, got {other:?}"),
    }

    wait_until("in-flight to drain", Duration::from_secs(1), || {
        conn.chainsync().in_flight() == 0
    })
    .await;
    assert_eq!(conn.chainsync().state(), chainsync::STATE_IDLE);

    let _peer = server.await?;
    Ok(())
}

#[tokio::test]
async fn test_pipeline_limit_enforced() -> anyhow::Result<()> {
    let mode = Mode::NodeToNode;
    let (client_io, server_io) = tokio::io::duplex(16384);
    let (observer, mut events) = ChannelObserver::new();

    let server = tokio::spawn(async move {
        let mut peer = ScriptedPeer::new(server_io, mode);
        peer.accept_handshake(7, MAGIC, false).await;

        let _next = peer.expect_chainsync().await;
        // Hold the reply back so the client's second request attempt is
        // guaranteed to see the first still outstanding.
        tokio::time::sleep(Duration::from_millis(100)).await;
        peer.send_chainsync(&chainsync::Message::RollForward {
            header: WrappedHeader {
                era: 4,
                payload: vec![7],
            },
            tip: tip(100, 0x01, 100),
        })
        .await;
        peer
    });

    // Default pipeline limit 0: exactly one request may be outstanding.
    let conn = Connection::connect(client_io, config(mode), observer).await?;
    conn.chainsync().request_next().await?;
    let err = conn.chainsync().request_next().await.unwrap_err();
    assert!(matches!(err, ProtocolError::AgencyViolation { .. }));

    let _ = next_event(&mut events).await;
    wait_until("in-flight to drain", Duration::from_secs(1), || {
        conn.chainsync().in_flight() == 0
    })
    .await;

    let _peer = server.await?;
    Ok(())
}

#[tokio::test]
async fn test_done_only_with_no_outstanding_replies() -> anyhow::Result<()> {
    let mode = Mode::NodeToNode;
    let (client_io, server_io) = tokio::io::duplex(16384);
    let (observer, mut events) = ChannelObserver::new();

    let server = tokio::spawn(async move {
        let mut peer = ScriptedPeer::new(server_io, mode);
        peer.accept_handshake(7, MAGIC, false).await;

        let _next = peer.expect_chainsync().await;
        // Hold the reply back so the client's early `done` attempt is
        // guaranteed to see the request still outstanding.
        tokio::time::sleep(Duration::from_millis(100)).await;
        peer.send_chainsync(&chainsync::Message::RollForward {
            header: WrappedHeader {
                era: 4,
                payload: vec![9],
            },
            tip: tip(100, 0x01, 100),
        })
        .await;
        let done = peer.expect_chainsync().await;
        assert_eq!(done, chainsync::Message::Done);
        peer
    });

    let conn = Connection::connect(client_io, config(mode), observer).await?;
    conn.chainsync().request_next().await?;
    let err = conn.chainsync().done().await.unwrap_err();
    assert!(matches!(err, ProtocolError::AgencyViolation { .. }));

    let _ = next_event(&mut events).await;
    wait_until("in-flight to drain", Duration::from_secs(1), || {
        conn.chainsync().in_flight() == 0
    })
    .await;

    conn.chainsync().done().await?;
    assert_eq!(conn.chainsync().state(), chainsync::STATE_DONE);

    let _peer = server.await?;
    Ok(())
}

#[tokio::test]
async fn test_intersect_timeout_stops_callbacks() -> anyhow::Result<()> {
    let mode = Mode::NodeToNode;
    let (client_io, server_io) = tokio::io::duplex(16384);
    let (observer, mut events) = ChannelObserver::new();
    let mut config = config(mode);
    config.chainsync = config
        .chainsync
        .with_intersect_timeout(Duration::from_millis(80));

    let server = tokio::spawn(async move {
        let mut peer = ScriptedPeer::new(server_io, mode);
        peer.accept_handshake(7, MAGIC, false).await;

        let _find = peer.expect_chainsync().await;
        // Sit on the request past the intersect deadline, then answer with
        // a roll forward the client must no longer deliver.
        tokio::time::sleep(Duration::from_millis(300)).await;
        peer.send_chainsync(&chainsync::Message::RollForward {
            header: WrappedHeader {
                era: 4,
                payload: vec![1],
            },
            tip: tip(100, 0x01, 100),
        })
        .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        peer
    });

    let mut conn = Connection::connect(client_io, config, observer).await?;
    let result = conn
        .chainsync()
        .find_intersect(vec![Point::Origin])
        .await;
    assert!(result.is_err(), "intersect must fail after the timeout");

    let err = conn.next_error().await.expect("error channel closed");
    assert!(
        matches!(err, ProtocolError::StateTimeout { state: "Intersect", .. }),
        "expected Intersect timeout, got {err:?}"
    );

    // No callbacks after the protocol failed.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(events.try_recv().is_err());

    let _peer = server.await?;
    Ok(())
}
