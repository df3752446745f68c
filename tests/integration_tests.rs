//! Integration tests for the AI RPC protocol
//!
//! These tests drive whole exchanges through the public API: orders and their
//! retry ceiling, two-phase run validation, and real TCP sessions.

use server::demo::{self, Skirmish, UNIT_HP};
use server::network::{read_packet, write_packet, Server, ServerConfig};
use server::{AiEvent, AiManager, OrderError, RecordingClient};
use shared::{GameObjectId, Packet, PlayerId, Value, MAX_ORDER_ERRORS, PROTOCOL_VERSION};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;

fn player_zero() -> PlayerId {
    PlayerId::new("0")
}

fn manager_for(
    game: Skirmish,
) -> (
    AiManager<Skirmish, RecordingClient>,
    mpsc::UnboundedReceiver<AiEvent>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let manager = AiManager::builder(
        RecordingClient::playing(player_zero()),
        Arc::new(demo::namespace()),
    )
    .events(tx)
    .game(Arc::new(RwLock::new(game)));
    (manager, rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<AiEvent>) -> Vec<AiEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// ORDER PIPELINE TESTS
mod order_tests {
    use super::*;
    use tokio_test::task;
    use tokio_test::{assert_pending, assert_ready_eq};

    /// A bad reply is reported and the same order is sent again
    #[tokio::test]
    async fn test_invalid_reply_resends_order() {
        let (mut manager, _events) = manager_for(Skirmish::new());
        let mut pending = task::spawn(manager.execute_order("runTurn", &[]).await);

        manager
            .finished_order(0, Value::String("not-a-number".to_string()))
            .await;

        let sent = &manager.client().sent;
        assert!(matches!(
            &sent[1],
            Packet::Invalid { message } if message.starts_with("Order 'runTurn' #0 returned \"not-a-number\"")
        ));
        assert_eq!(
            sent[2],
            Packet::Order {
                index: 0,
                name: "runTurn".to_string(),
                args: Vec::new(),
            }
        );
        assert_eq!(manager.order_errors(0), Some(1));
        assert!(manager.client().ticking);
        assert_pending!(pending.poll());

        manager.finished_order(0, Value::Bool(false)).await;
        assert!(pending.is_woken());
        assert_ready_eq!(pending.poll(), Ok(Value::Bool(false)));
    }

    /// Replies may arrive in any order
    #[tokio::test]
    async fn test_out_of_order_replies() {
        let (mut manager, _events) = manager_for(Skirmish::new());
        let first = manager.execute_order("runTurn", &[]).await;
        let second = manager.execute_order("runTurn", &[]).await;

        manager.finished_order(1, Value::Bool(false)).await;
        assert!(manager.client().ticking);
        manager.finished_order(0, Value::Bool(true)).await;
        assert!(!manager.client().ticking);

        assert_eq!(first.await, Ok(Value::Bool(true)));
        assert_eq!(second.await, Ok(Value::Bool(false)));
    }

    /// The order collecting its tenth error evicts the client exactly once
    #[tokio::test]
    async fn test_retry_ceiling_disconnects_once() {
        let (mut manager, mut events) = manager_for(Skirmish::new());
        let pending = manager.execute_order("runTurn", &[]).await;

        for _ in 0..=MAX_ORDER_ERRORS {
            manager
                .finished_order(0, Value::String("maybe".to_string()))
                .await;
        }

        let client = manager.client();
        assert_eq!(client.disconnects.len(), 1);
        assert!(client.disconnects[0].contains("'runTurn' #0"));
        assert!(client.disconnects[0].contains(&MAX_ORDER_ERRORS.to_string()));

        let invalids = client
            .sent
            .iter()
            .filter(|p| matches!(p, Packet::Invalid { .. }))
            .count();
        assert_eq!(invalids as u32, MAX_ORDER_ERRORS);

        match pending.await {
            Err(OrderError::Disconnected(reason)) => assert_eq!(reason, client.disconnects[0]),
            other => panic!("expected a disconnect, got {:?}", other),
        }

        let ordered = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, AiEvent::Ordered { .. }))
            .count();
        assert_eq!(ordered as u32, MAX_ORDER_ERRORS);
    }

    /// Replying to an order that was never sent is a protocol violation
    #[tokio::test]
    async fn test_unknown_index_disconnects() {
        let (mut manager, _events) = manager_for(Skirmish::new());

        manager.finished_order(42, Value::Bool(true)).await;

        assert_eq!(
            manager.disconnect_reason(),
            Some("Finished order #42 which was never sent")
        );
    }

    /// A client that has not played yet cannot answer orders
    #[tokio::test]
    async fn test_finish_before_play_disconnects() {
        let mut manager = AiManager::builder(RecordingClient::default(), Arc::new(demo::namespace()))
            .game(Arc::new(RwLock::new(Skirmish::new())));
        let pending = manager.execute_order("runTurn", &[]).await;

        manager.finished_order(0, Value::Bool(true)).await;

        assert_eq!(
            manager.disconnect_reason(),
            Some("Cannot finish an order before playing")
        );
        assert!(pending.await.is_err());
    }

    /// Server code ordering something undeclared fails without reaching the client
    #[tokio::test]
    async fn test_undeclared_order_is_server_error() {
        let (mut manager, _events) = manager_for(Skirmish::new());

        let pending = manager.execute_order("dance", &[]).await;

        assert!(matches!(pending.await, Err(OrderError::Malformed(_))));
        assert!(manager.client().sent.iter().all(|p| !matches!(p, Packet::Order { .. })));
        assert!(manager
            .disconnect_reason()
            .unwrap()
            .starts_with("Server error: could not send order 'dance'"));
    }
}

/// RUN PIPELINE TESTS
mod run_tests {
    use super::*;

    fn attack(caller: &GameObjectId, args: BTreeMap<String, Value>) -> Packet {
        Packet::Run {
            caller: caller.clone(),
            function_name: "attack".to_string(),
            args,
        }
    }

    /// Skirmish with player 0's unit at x=4 and player 1's at x=5
    fn facing_units() -> (Skirmish, GameObjectId, GameObjectId) {
        let mut game = Skirmish::new();
        let mine = game.spawn_unit(0, 4);
        let theirs = game.spawn_unit(1, 5);
        (game, mine, theirs)
    }

    /// Structurally malformed args disconnect before any game rule runs
    #[tokio::test]
    async fn test_null_reference_disconnects() {
        let (game, mine, theirs) = facing_units();
        let (mut manager, mut events) = manager_for(game);

        let packet = attack(&mine, BTreeMap::from([("tile".to_string(), Value::Null)]));
        manager.handle_packet(packet).await.unwrap();

        let reason = manager.disconnect_reason().unwrap();
        assert!(reason.contains("attack()"));
        assert!(reason.contains("'tile'"));
        assert!(drain(&mut events).is_empty());
        assert_eq!(
            manager.game().read().await.unit(&theirs).unwrap().hp,
            UNIT_HP
        );
    }

    /// Game-rule rejection is recoverable and never reaches the function body
    #[tokio::test]
    async fn test_rule_rejection_is_invalid() {
        let (mut game, mine, _) = facing_units();
        game.spawn_unit(1, 8);
        let far_tile = game.tile(8).cloned().unwrap();
        let (mut manager, mut events) = manager_for(game);

        let args = BTreeMap::from([("tile".to_string(), Value::GameObject(far_tile))]);
        let returned = manager.requested_run(&mine, "attack", &args).await;
        assert_eq!(returned, Ok(None));

        assert!(!manager.is_disconnected());
        assert_eq!(
            manager.client().last_sent(),
            Some(&Packet::Invalid {
                message: "not adjacent".to_string()
            })
        );
        assert!(!manager.game().read().await.unit(&mine).unwrap().acted);
        assert!(matches!(
            drain(&mut events).as_slice(),
            [AiEvent::Ran { invalid: Some(reason), .. }] if reason == "not adjacent"
        ));
    }

    /// Out-of-range numbers are invalid rather than fatal
    #[tokio::test]
    async fn test_out_of_range_is_invalid() {
        let (game, mine, _) = facing_units();
        let tile = game.tile(5).cloned().unwrap();
        let (mut manager, _events) = manager_for(game);

        let packet = attack(
            &mine,
            BTreeMap::from([
                ("tile".to_string(), Value::GameObject(tile)),
                ("damage".to_string(), Value::Int(9)),
            ]),
        );
        manager.handle_packet(packet).await.unwrap();

        assert!(!manager.is_disconnected());
        match manager.client().last_sent() {
            Some(Packet::Invalid { message }) => assert!(message.ends_with("must be at most 3")),
            other => panic!("expected invalid, got {:?}", other),
        }
    }

    /// A valid attack runs with coerced args
    #[tokio::test]
    async fn test_attack_runs() {
        let (game, mine, theirs) = facing_units();
        let tile = game.tile(5).cloned().unwrap();
        let (mut manager, mut events) = manager_for(game);

        let args = BTreeMap::from([
            ("tile".to_string(), Value::GameObject(tile)),
            ("damage".to_string(), Value::String("2".to_string())),
        ]);
        let returned = manager.requested_run(&mine, "attack", &args).await;

        assert_eq!(returned, Ok(Some(Value::Int(UNIT_HP - 2))));
        assert_eq!(
            manager.client().last_sent(),
            Some(&Packet::Ran {
                returned: Value::Int(UNIT_HP - 2)
            })
        );
        assert!(matches!(
            drain(&mut events).as_slice(),
            [AiEvent::Ran { invalid: None, .. }]
        ));

        let game = manager.game().read().await;
        assert_eq!(game.unit(&theirs).unwrap().hp, UNIT_HP - 2);
        assert!(game.unit(&mine).unwrap().acted);
    }

    /// The hook clamps overkill to what the target has left
    #[tokio::test]
    async fn test_overkill_is_amended() {
        let (game, mine, theirs) = facing_units();
        let tile = game.tile(5).cloned().unwrap();
        let (mut manager, _events) = manager_for(game);

        let hit = |damage: i64| {
            BTreeMap::from([
                ("tile".to_string(), Value::GameObject(tile.clone())),
                ("damage".to_string(), Value::Int(damage)),
            ])
        };

        let first = manager.requested_run(&mine, "attack", &hit(2)).await;
        assert_eq!(first, Ok(Some(Value::Int(1))));

        {
            // Back to player 0 with fresh units
            let mut game = manager.game().write().await;
            game.end_turn();
            game.end_turn();
        }

        let second = manager.requested_run(&mine, "attack", &hit(3)).await;
        assert_eq!(second, Ok(Some(Value::Int(0))));
        assert!(manager.game().read().await.unit(&theirs).is_none());
    }

    /// Runs pause the clock while the server works, then resume it
    #[tokio::test]
    async fn test_run_pauses_then_resumes_tick() {
        let (game, _, _) = facing_units();
        let (mut manager, _events) = manager_for(game);
        let me = player_zero().object_id().clone();

        let args = BTreeMap::from([("message".to_string(), Value::from("hello"))]);
        let returned = manager.requested_run(&me, "log", &args).await;

        assert_eq!(returned, Ok(Some(Value::Null)));
        let client = manager.client();
        assert_eq!(client.tick_pauses, 1);
        assert_eq!(client.tick_starts, 1);
        assert!(client.ticking);
        assert_eq!(
            manager.game().read().await.log,
            vec![(player_zero(), "hello".to_string())]
        );
    }

    /// Unknown objects and undeclared functions are protocol violations
    #[tokio::test]
    async fn test_unknown_targets_disconnect() {
        let (game, mine, _) = facing_units();
        let (mut manager, _events) = manager_for(game);
        manager
            .requested_run(&GameObjectId::new("999"), "attack", &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(
            manager.disconnect_reason(),
            Some("No game object with id '999' exists")
        );

        let (game, _, _) = facing_units();
        let (mut manager, _events) = manager_for(game);
        manager
            .requested_run(&mine, "teleport", &BTreeMap::new())
            .await
            .unwrap();
        assert!(manager.disconnect_reason().unwrap().contains("teleport"));
    }
}

/// TCP SESSION TESTS
mod network_tests {
    use super::*;
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

    async fn connect(addr: std::net::SocketAddr, name: &str) -> (OwnedReadHalf, OwnedWriteHalf) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        write_packet(
            &mut writer,
            &Packet::Play {
                client_version: PROTOCOL_VERSION,
                player_name: name.to_string(),
            },
        )
        .await
        .unwrap();
        (reader, writer)
    }

    async fn next(reader: &mut OwnedReadHalf) -> Packet {
        timeout(Duration::from_secs(2), read_packet(reader))
            .await
            .expect("timed out waiting for a packet")
            .unwrap()
            .expect("connection closed")
    }

    async fn start_server() -> Server<Skirmish> {
        let game = Skirmish::new();
        let players = vec![PlayerId::new("0"), PlayerId::new("1")];
        Server::bind(
            "127.0.0.1:0",
            Arc::new(demo::namespace()),
            Arc::new(RwLock::new(game)),
            players,
            ServerConfig::default(),
        )
        .await
        .unwrap()
    }

    /// Two clients take seats in join order; the first is ordered and
    /// answers over the wire
    #[tokio::test]
    async fn test_order_roundtrip_over_tcp() {
        let mut server = start_server().await;
        let addr = server.local_addr().unwrap();
        let waiter = tokio::spawn(async move {
            let sessions = server.wait_for_players().await;
            (server, sessions)
        });

        let (mut alpha_rx, mut alpha_tx) = connect(addr, "alpha").await;
        assert_eq!(
            next(&mut alpha_rx).await,
            Packet::Started {
                player: PlayerId::new("0")
            }
        );
        let (mut beta_rx, _beta_tx) = connect(addr, "beta").await;
        assert_eq!(
            next(&mut beta_rx).await,
            Packet::Started {
                player: PlayerId::new("1")
            }
        );

        let (_server, sessions) = timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        let sessions = sessions.unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].player, PlayerId::new("0"));

        let session = sessions[0].clone();
        let ordered = tokio::spawn(async move { session.order("runTurn", Vec::new()).await });

        assert_eq!(
            next(&mut alpha_rx).await,
            Packet::Order {
                index: 0,
                name: "runTurn".to_string(),
                args: Vec::new(),
            }
        );

        write_packet(
            &mut alpha_tx,
            &Packet::Run {
                caller: GameObjectId::new("0"),
                function_name: "log".to_string(),
                args: BTreeMap::from([("message".to_string(), Value::from("thinking"))]),
            },
        )
        .await
        .unwrap();
        assert_eq!(
            next(&mut alpha_rx).await,
            Packet::Ran {
                returned: Value::Null
            }
        );

        write_packet(
            &mut alpha_tx,
            &Packet::Finished {
                order_index: 0,
                returned: Value::Bool(true),
            },
        )
        .await
        .unwrap();

        let returned = timeout(Duration::from_secs(2), ordered).await.unwrap().unwrap();
        assert_eq!(returned, Ok(Value::Bool(true)));
    }

    /// A near-frame-sized bad reply is answered with a short `invalid` and
    /// the session keeps going
    #[tokio::test]
    async fn test_huge_reply_gets_a_short_invalid() {
        let mut server = start_server().await;
        let addr = server.local_addr().unwrap();
        let waiter = tokio::spawn(async move {
            let sessions = server.wait_for_players().await;
            (server, sessions)
        });

        let (mut alpha_rx, mut alpha_tx) = connect(addr, "alpha").await;
        next(&mut alpha_rx).await;
        let (mut beta_rx, _beta_tx) = connect(addr, "beta").await;
        next(&mut beta_rx).await;

        let (_server, sessions) = timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        let session = sessions.unwrap()[0].clone();
        let ordered = tokio::spawn(async move { session.order("runTurn", Vec::new()).await });
        assert!(matches!(next(&mut alpha_rx).await, Packet::Order { index: 0, .. }));

        write_packet(
            &mut alpha_tx,
            &Packet::Finished {
                order_index: 0,
                returned: Value::String("x".repeat(60_000)),
            },
        )
        .await
        .unwrap();

        match next(&mut alpha_rx).await {
            Packet::Invalid { message } => assert!(message.len() < 300),
            other => panic!("expected invalid, got {:?}", other),
        }
        assert!(matches!(next(&mut alpha_rx).await, Packet::Order { index: 0, .. }));

        write_packet(
            &mut alpha_tx,
            &Packet::Finished {
                order_index: 0,
                returned: Value::Bool(true),
            },
        )
        .await
        .unwrap();

        let returned = timeout(Duration::from_secs(2), ordered).await.unwrap().unwrap();
        assert_eq!(returned, Ok(Value::Bool(true)));
    }

    /// A client that opens with anything but `play` is turned away
    #[tokio::test]
    async fn test_must_play_first() {
        let mut server = start_server().await;
        let addr = server.local_addr().unwrap();
        let waiting = tokio::spawn(async move {
            let _ = timeout(Duration::from_millis(500), server.wait_for_players()).await;
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        write_packet(
            &mut writer,
            &Packet::Finished {
                order_index: 0,
                returned: Value::Null,
            },
        )
        .await
        .unwrap();

        assert_eq!(
            next(&mut reader).await,
            Packet::Fatal {
                message: "Expected 'play' but got 'finished'".to_string()
            }
        );
        waiting.abort();
    }
}
