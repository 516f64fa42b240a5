//! End-to-end sync: authoritative `state` frames travel through the
//! session and dispatcher into the reconcilers, and rendered state
//! converges per frame exactly as the presentation layer would see it.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use marble_client::{EntityId, Reconciler, Session, TokenStore};
use marble_shared::math::Vec3;
use marble_shared::net::{MarbleRecord, PlayerRecord, StateUpdate};
use marble_tests::{test_config, ScriptedServer};
use serde_json::json;
use tokio::time::Instant;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

async fn pump(session: &mut Session, window: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + window;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        session.poll().await;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    done()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn state_frames_drive_the_reconcilers() -> anyhow::Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let mut server = ScriptedServer::bind().await?;
    let cfg = test_config(&server.url);
    let mut session = Session::new(cfg.clone(), TokenStore::at(dir.path().join("token")));

    let players = Rc::new(RefCell::new(Reconciler::<PlayerRecord>::new(cfg.interp)));
    let marbles = Rc::new(RefCell::new(Reconciler::<MarbleRecord>::new(cfg.interp)));
    let removed: Rc<RefCell<Vec<EntityId>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let players = players.clone();
        let marbles = marbles.clone();
        let removed = removed.clone();
        session.on("state", move |v| {
            let update = StateUpdate::from_value(v);
            players.borrow_mut().apply(update.players);
            let summary = marbles.borrow_mut().apply(update.marbles);
            removed.borrow_mut().extend(summary.removed);
        });
    }

    session.connect().await;
    let mut conn = server
        .accept_within(Duration::from_secs(2))
        .await
        .expect("connection");
    let join = tokio::time::timeout(Duration::from_secs(1), conn.recv_json())
        .await?
        .expect("join frame");
    assert_eq!(join["type"], "join");

    conn.send_text(
        json!({
            "type": "welcome",
            "token": "tok",
            "player": { "id": 7, "x": 1.0, "z": 2.0 }
        })
        .to_string(),
    );
    // First snapshot: one player, one marble, plus an unusable record
    // that must be skipped rather than break the list.
    conn.send_text(
        json!({
            "type": "state",
            "players": [ { "id": 7, "x": 1.0, "z": 2.0, "yaw": 0.0,
                           "loaded_color": "red", "next_color": "blue" } ],
            "marbles": [ { "id": 10, "x": 3.0, "z": 1.0, "color": "green" },
                         { "x": 9.0, "color": "blue" } ]
        })
        .to_string(),
    );

    assert!(
        pump(&mut session, Duration::from_secs(2), || {
            players.borrow().len() == 1 && marbles.borrow().len() == 1
        })
        .await
    );
    assert_eq!(session.player_id(), Some(7));

    {
        let players = players.borrow();
        let me = players.get(7).unwrap();
        // First appearance renders at the target: no pop-in.
        assert_eq!(me.current_pos, Vec3::new(1.0, 0.0, 2.0));
        assert_eq!(me.current_pos, me.target_pos);
        assert_eq!(me.record.loaded_color, "red");

        let marbles = marbles.borrow();
        let m = marbles.get(10).unwrap();
        // `y` was omitted on the wire; marbles default to rest height.
        assert_eq!(m.current_pos, Vec3::new(3.0, 0.5, 1.0));
        assert_eq!(m.record.color, "green");
    }

    // A frame's worth of interpolation with nothing to chase stays put.
    players.borrow_mut().advance(0.1);
    assert_eq!(
        players.borrow().get(7).unwrap().current_pos,
        Vec3::new(1.0, 0.0, 2.0)
    );

    // Second snapshot: the player moved, the marble is gone.
    conn.send_text(
        json!({
            "type": "state",
            "players": [ { "id": 7, "x": 5.0, "z": 2.0, "yaw": 0.0,
                           "loaded_color": "red", "next_color": "blue" } ],
            "marbles": []
        })
        .to_string(),
    );

    assert!(
        pump(&mut session, Duration::from_secs(2), || {
            marbles.borrow().is_empty()
        })
        .await
    );
    assert_eq!(*removed.borrow(), vec![10]);

    {
        let players = players.borrow();
        let me = players.get(7).unwrap();
        // apply() moved only the target.
        assert_eq!(me.target_pos, Vec3::new(5.0, 0.0, 2.0));
        assert_eq!(me.current_pos, Vec3::new(1.0, 0.0, 2.0));
    }

    // Half-step: alpha = min(1, 10 × 0.05) = 0.5 lands halfway.
    players.borrow_mut().advance(0.05);
    let x = players.borrow().get(7).unwrap().current_pos.x;
    assert!((x - 3.0).abs() < 1e-5);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_message_types_reach_generic_and_named_listeners() -> anyhow::Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let mut server = ScriptedServer::bind().await?;
    let mut session = Session::new(test_config(&server.url), TokenStore::at(dir.path().join("t")));

    let chats = Rc::new(RefCell::new(Vec::new()));
    let generics = Rc::new(RefCell::new(0));
    {
        let chats = chats.clone();
        session.on("chat", move |v| {
            let text = v["text"].as_str().unwrap_or_default().to_string();
            chats.borrow_mut().push(text);
        });
        let generics = generics.clone();
        session.on("message", move |_| *generics.borrow_mut() += 1);
    }

    session.connect().await;
    let conn = server
        .accept_within(Duration::from_secs(2))
        .await
        .expect("connection");

    conn.send_text(json!({ "type": "chat", "text": "glhf" }).to_string());
    assert!(
        pump(&mut session, Duration::from_secs(2), || {
            !chats.borrow().is_empty()
        })
        .await
    );
    assert_eq!(*chats.borrow(), vec!["glhf".to_string()]);
    assert_eq!(*generics.borrow(), 1);
    Ok(())
}
