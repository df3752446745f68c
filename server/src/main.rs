use clap::Parser;
use log::{error, info, warn};
use server::demo::{self, Skirmish};
use server::network::{Server, ServerConfig};
use server::peer::AiEvent;
use shared::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "8080")]
    port: u16,
    /// Maximum simultaneous connections, seated or not
    #[clap(short, long, default_value = "4")]
    max_clients: usize,
    /// Turns to play before calling the game a draw
    #[clap(short, long, default_value = "100")]
    turns: u32,
    /// Thinking time each AI gets for the whole game, in milliseconds
    #[clap(long, default_value = "10000")]
    time_budget_ms: u64,
    /// Seed for unit placement
    #[clap(short, long, default_value = "0")]
    seed: u64,
}

/// Parses command-line arguments, seats two AIs and plays one skirmish.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let game = Skirmish::with_random_units(args.seed);
    let players: Vec<_> = (0..2).filter_map(|i| game.player(i).cloned()).collect();
    let game = Arc::new(RwLock::new(game));
    let namespace = Arc::new(demo::namespace());

    for (type_name, function) in namespace.missing_functions() {
        warn!("{}.{} is declared but not implemented", type_name, function);
    }

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            log_event(&event);
        }
    });

    let config = ServerConfig {
        max_clients: args.max_clients,
        time_budget: Duration::from_millis(args.time_budget_ms),
        ..ServerConfig::default()
    };
    let address = format!("{}:{}", args.host, args.port);
    let mut server = Server::bind(&address, namespace, Arc::clone(&game), players, config)
        .await?
        .with_events(events_tx);

    let sessions = server.wait_for_players().await?;
    server.spawn_rejector();
    info!("All players seated, starting the game");

    for _ in 0..args.turns {
        let current = game.read().await.current_index();
        let Some(session) = sessions.get(current) else {
            error!("No session for player index {}", current);
            break;
        };

        match session.order("runTurn", Vec::new()).await {
            Ok(Value::Bool(false)) => info!("{} yielded its turn", session.player),
            Ok(_) => {}
            Err(e) => {
                warn!("{} forfeits: {}", session.player, e);
                break;
            }
        }

        let mut game = game.write().await;
        if let Some(winner) = game.winner() {
            info!("{} wins on turn {}", winner, game.turn);
            return Ok(());
        }
        game.end_turn();
    }

    info!("Game over after {} turns", game.read().await.turn);
    Ok(())
}

fn log_event(event: &AiEvent) {
    match event {
        AiEvent::Ordered {
            player, index, name, ..
        } => match player {
            Some(player) => info!("{} ordered {} #{}", player, name, index),
            None => info!("Ordered {} #{}", name, index),
        },
        AiEvent::Finished {
            player,
            index,
            name,
            invalid: Some(reason),
            ..
        } => warn!("{} answered {} #{} invalidly: {}", player, name, index, reason),
        AiEvent::Finished {
            player,
            index,
            name,
            returned,
            ..
        } => info!("{} finished {} #{} -> {}", player, name, index, returned),
        AiEvent::Ran {
            player,
            caller,
            function,
            invalid: Some(reason),
            ..
        } => warn!("{} #{}.{}() invalid: {}", player, caller, function, reason),
        AiEvent::Ran {
            player,
            caller,
            function,
            returned,
            ..
        } => info!("{} ran #{}.{}() -> {}", player, caller, function, returned),
    }
}
