//! Headless console client.
//!
//! Usage:
//!   cargo run -p marble_client -- [--url ws://127.0.0.1:8080/ws] [--token-file path]
//!
//! The client keeps a resilient session to the game server and mirrors
//! the authoritative world into smoothly interpolated local state, which
//! it reports on demand instead of rendering.
//!
//! Console commands:
//!   status          - session and sync status
//!   rooms           - request the public room list
//!   create <name>   - create a room
//!   join <roomId>   - join a room
//!   aim <degrees>   - aim the shooter
//!   shoot           - fire the loaded marble
//!   retry           - reset a gave-up session
//!   quit            - exit

use std::cell::RefCell;
use std::env;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use marble_client::{FrameClock, Reconciler, Session, TokenStore};
use marble_shared::config::ClientConfig;
use marble_shared::net::{ClientMsg, MarbleRecord, PlayerRecord, StateUpdate};
use tokio::sync::mpsc;
use tracing::info;

type Shared<T> = Rc<RefCell<T>>;

fn parse_args() -> (ClientConfig, Option<PathBuf>) {
    let mut cfg = ClientConfig::default();
    let mut token_file = None;
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--url" if i + 1 < args.len() => {
                cfg.server_url = args[i + 1].clone();
                i += 2;
            }
            "--token-file" if i + 1 < args.len() => {
                token_file = Some(PathBuf::from(&args[i + 1]));
                i += 2;
            }
            _ => i += 1,
        }
    }
    (cfg, token_file)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let (cfg, token_file) = parse_args();
    info!(url = %cfg.server_url, "starting client");

    let store = token_file
        .map(TokenStore::at)
        .unwrap_or_else(TokenStore::open_default);
    let mut session = Session::new(cfg.clone(), store);

    let players: Shared<Reconciler<PlayerRecord>> =
        Rc::new(RefCell::new(Reconciler::new(cfg.interp)));
    let marbles: Shared<Reconciler<MarbleRecord>> =
        Rc::new(RefCell::new(Reconciler::new(cfg.interp)));

    {
        let players = players.clone();
        let marbles = marbles.clone();
        session.on("state", move |v| {
            let update = StateUpdate::from_value(v);
            players.borrow_mut().apply(update.players);
            marbles.borrow_mut().apply(update.marbles);
        });
    }
    session.on("welcome", |v| {
        println!("joined: {v}");
    });
    session.on("error", |v| {
        println!("server error: {}", v["message"]);
    });
    session.on("rooms_list", |v| {
        println!("rooms: {}", v["rooms"]);
    });
    session.on("room_created", |v| {
        println!("room created: {}", v["roomId"]);
    });
    session.on_transport("open", |_| println!("connected"));
    session.on_transport("close", |v| println!("connection lost: {v}"));
    session.on_transport("reconnect_exhausted", |_| {
        println!("gave up reconnecting; type 'retry' to try again");
    });

    session.connect().await;

    // Console input channel fed by a stdin reader thread.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            if stdin.lock().read_line(&mut line).is_err() {
                break;
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Type 'status' for info, 'quit' to exit.");

    let mut clock = FrameClock::new();
    let frame = Duration::from_millis(16);
    let mut frames: u64 = 0;

    loop {
        while let Ok(line) = console_rx.try_recv() {
            if !exec_command(&mut session, &players, &marbles, &line).await {
                return Ok(());
            }
        }

        session.poll().await;

        let dt = clock.tick();
        players.borrow_mut().advance(dt);
        marbles.borrow_mut().advance(dt);

        frames += 1;
        if frames % 512 == 0 {
            info!(
                status = ?session.status(),
                players = players.borrow().len(),
                marbles = marbles.borrow().len(),
                "sync"
            );
        }

        tokio::time::sleep(frame).await;
    }
}

/// Runs one console command; returns false to quit.
async fn exec_command(
    session: &mut Session,
    players: &Shared<Reconciler<PlayerRecord>>,
    marbles: &Shared<Reconciler<MarbleRecord>>,
    line: &str,
) -> bool {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.first().copied() {
        Some("status") => {
            println!("Status: {:?}", session.status());
            println!("Player ID: {:?}", session.player_id());
            println!("Queued messages: {}", session.queued());
            println!("Players tracked: {}", players.borrow().len());
            println!("Marbles tracked: {}", marbles.borrow().len());
            if let Some(id) = session.player_id() {
                if let Some(me) = players.borrow().get(id) {
                    println!(
                        "Position: ({:.2}, {:.2}, {:.2}) yaw {:.1}°",
                        me.current_pos.x,
                        me.current_pos.y,
                        me.current_pos.z,
                        me.current_yaw.to_degrees()
                    );
                }
            }
        }
        Some("rooms") => session.send(&ClientMsg::ListRooms).await,
        Some("create") => {
            if tokens.len() < 2 {
                println!("Usage: create <name>");
            } else {
                session
                    .send(&ClientMsg::CreateRoom {
                        name: tokens[1..].join(" "),
                        max_players: 2,
                    })
                    .await;
            }
        }
        Some("join") => {
            if tokens.len() < 2 {
                println!("Usage: join <roomId>");
            } else {
                let token = session.token().map(str::to_string);
                session
                    .send(&ClientMsg::JoinRoom {
                        room_id: tokens[1].to_string(),
                        token,
                    })
                    .await;
            }
        }
        Some("aim") => match tokens.get(1).and_then(|t| t.parse::<f32>().ok()) {
            Some(degrees) => {
                session
                    .send(&ClientMsg::Aim {
                        yaw: degrees.to_radians(),
                    })
                    .await;
            }
            None => println!("Usage: aim <degrees>"),
        },
        Some("shoot") => session.send(&ClientMsg::Shoot).await,
        Some("retry") => session.reset(),
        Some("quit") | Some("exit") => return false,
        Some(other) => println!("Unknown command: {other}"),
        None => {}
    }
    true
}
