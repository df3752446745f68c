use clap::Parser;
use server::network::{read_packet, write_packet};
use shared::{GameObjectId, Packet, Value, PROTOCOL_VERSION};
use std::collections::BTreeMap;
use tokio::net::TcpStream;

/// Minimal AI: logs a line on every turn, then ends it
#[derive(Parser, Debug)]
#[clap(about)]
struct Args {
    /// Server address to connect to
    #[clap(default_value = "127.0.0.1:8080")]
    addr: String,
    /// Answer every order with garbage and get evicted after repeated
    /// invalid replies
    #[clap(long)]
    misbehave: bool,
    /// Name announced in `play`
    #[clap(short, long, default_value = "test-client")]
    name: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let misbehave = args.misbehave;

    println!("Connecting to {}", args.addr);
    let stream = TcpStream::connect(&args.addr).await?;
    let (mut reader, mut writer) = stream.into_split();

    let play = Packet::Play {
        client_version: PROTOCOL_VERSION,
        player_name: args.name.clone(),
    };
    write_packet(&mut writer, &play).await?;

    let mut me: Option<GameObjectId> = None;
    let mut turn = 0u32;

    while let Some(packet) = read_packet(&mut reader).await? {
        match packet {
            Packet::Started { player } => {
                println!("Playing as {}", player);
                me = Some(player.object_id().clone());
            }
            Packet::Order { index, name, args } => {
                println!("Ordered {} #{} with {:?}", name, index, args);

                if misbehave {
                    let reply = Packet::Finished {
                        order_index: index,
                        returned: Value::String("not-a-boolean".to_string()),
                    };
                    write_packet(&mut writer, &reply).await?;
                    continue;
                }

                if let Some(me) = &me {
                    turn += 1;
                    let log = Packet::Run {
                        caller: me.clone(),
                        function_name: "log".to_string(),
                        args: BTreeMap::from([(
                            "message".to_string(),
                            Value::String(format!("turn {}", turn)),
                        )]),
                    };
                    write_packet(&mut writer, &log).await?;
                }

                let done = Packet::Finished {
                    order_index: index,
                    returned: Value::Bool(true),
                };
                write_packet(&mut writer, &done).await?;
            }
            Packet::Ran { returned } => println!("Ran -> {}", returned),
            Packet::Invalid { message } => println!("Invalid: {}", message),
            Packet::Fatal { message } => {
                println!("Disconnected: {}", message);
                break;
            }
            other => println!("Unexpected packet: {:?}", other),
        }
    }

    println!("Test client finished");
    Ok(())
}
