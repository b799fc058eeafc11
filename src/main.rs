//! parley - voice calls with strangers, one match at a time

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use parley::audio::{
    list_capture_devices, CpalMicDriver, CuePlayer, NullCuePlayer, SynthCuePlayer,
};
use parley::auth::StaticTokenProvider;
use parley::call::{
    CallConfig, CallOrchestrator, CtrlCGuard, Drivers, LoopbackPeerDriver, Notification,
};
use parley::network::{SignalingConfig, SignalingTransport};

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Voice calls with strangers, one match at a time")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List available audio devices
    Devices {
        #[command(subcommand)]
        action: DevicesAction,
    },

    /// Connect to a matching server and get talking
    Join {
        /// Signaling server URL (e.g., ws://localhost:8080)
        server: String,

        /// Bearer token for login
        #[arg(short, long, env = "PARLEY_TOKEN")]
        token: String,

        /// Skip the audible call cues
        #[arg(long)]
        silent: bool,

        /// Cue volume, 0.0 to 1.0
        #[arg(long, default_value = "0.4")]
        volume: f32,
    },
}

#[derive(Subcommand)]
enum DevicesAction {
    /// List all capture devices
    List,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

fn list_devices() {
    let devices = list_capture_devices();
    if devices.is_empty() {
        println!("No capture devices found.");
        return;
    }
    println!("Capture devices:");
    for device in devices {
        let default_marker = if device.is_default { " (default)" } else { "" };
        println!("  - {}{}", device.name, default_marker);
    }
}

fn print_notification(notification: &Notification) {
    match notification {
        Notification::WaitTimedOut => {
            println!("Still connecting... the server may be busy.");
        }
        Notification::ReadyToMatch => {
            println!("Ready. Type 'match' to find a partner.");
        }
        Notification::CallEstablished { match_id } => {
            println!("Connected (match #{}). Say hi!", match_id);
            println!("Type 'hangup' to end the call.");
        }
        Notification::CallEnded { duration } => {
            println!("Call ended after {}s.", duration.as_secs());
        }
    }
}

async fn run_join(server: String, token: String, silent: bool, volume: f32) -> Result<()> {
    info!("Joining {}", server);

    let cues: Arc<dyn CuePlayer> = if silent {
        Arc::new(NullCuePlayer)
    } else {
        Arc::new(SynthCuePlayer::new(volume))
    };
    let drivers = Drivers {
        transport: Arc::new(SignalingTransport::new(SignalingConfig::new(server))),
        tokens: Arc::new(StaticTokenProvider::new(token)),
        mic: Arc::new(CpalMicDriver),
        peer: Arc::new(LoopbackPeerDriver),
        cues,
        guard: Arc::new(CtrlCGuard::default()),
    };

    let (orchestrator, controller, mut notifications) =
        CallOrchestrator::new(CallConfig::default(), drivers);
    let mut flow = tokio::spawn(orchestrator.run());

    println!("Connecting...");
    println!("Commands: match, hangup, quit\n");

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    loop {
        tokio::select! {
            result = &mut flow => {
                match result {
                    Ok(Ok(summary)) => {
                        info!("Flow finished; talked for {:?}", summary.duration);
                    }
                    Ok(Err(e)) => {
                        anyhow::bail!("Call flow failed: {}", e);
                    }
                    Err(e) => {
                        anyhow::bail!("Call flow panicked: {}", e);
                    }
                }
                break;
            }
            note = notifications.recv() => {
                if let Some(note) = note {
                    print_notification(&note);
                }
            }
            line = lines.next_line() => {
                let Ok(Some(line)) = line else {
                    info!("stdin closed");
                    continue;
                };
                // Any keystroke counts as presence
                controller.activity();
                match line.trim() {
                    "" => {}
                    "match" | "m" => controller.start_matching(),
                    "hangup" | "h" => controller.hang_up(),
                    "quit" | "q" => {
                        flow.abort();
                        break;
                    }
                    other => println!("Unknown command: {}", other),
                }
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Devices { action } => match action {
            DevicesAction::List => list_devices(),
        },
        Commands::Join {
            server,
            token,
            silent,
            volume,
        } => {
            run_join(server, token, silent, volume).await?;
        }
    }

    Ok(())
}
