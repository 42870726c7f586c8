//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p dungeon_client -- [--addr 127.0.0.1:40000] [--config client.json]
//!                                  [--name Player] [--script R30,D30,L30,U30]
//!
//! There is no window: movement comes from a looping script of
//! `<direction><frames>` steps (`U`, `D`, `L`, `R`, combinations such as
//! `UR`, or `-` to stand still).
//!
//! Console commands:
//!   status - Show predicted position, pending commands and remote players
//!   quit   - Disconnect and exit

use std::env;
use std::io::{BufRead, Write};

use anyhow::Context;
use dungeon_client::client::{ClientState, GameClient};
use dungeon_client::input::InputState;
use dungeon_shared::config::GameConfig;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{info, warn};

struct Args {
    cfg: GameConfig,
    script: String,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = env::args().collect();
    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => GameConfig::load(&args[i + 1])?,
        _ => GameConfig::default(),
    };
    let mut script = "R30,D30,L30,U30".to_string();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--name" if i + 1 < args.len() => {
                cfg.player_name = args[i + 1].clone();
                i += 2;
            }
            "--script" if i + 1 < args.len() => {
                script = args[i + 1].clone();
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(Args { cfg, script })
}

/// Parses `R30,UL10,-5` into per-step inputs and frame counts.
fn parse_script(script: &str) -> anyhow::Result<Vec<(InputState, u32)>> {
    let mut steps = Vec::new();
    for part in script.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let split = part
            .find(|c: char| c.is_ascii_digit())
            .with_context(|| format!("script step '{part}' has no frame count"))?;
        let (keys, frames) = part.split_at(split);
        let frames: u32 = frames
            .parse()
            .with_context(|| format!("bad frame count in '{part}'"))?;
        let mut input = InputState::default();
        for c in keys.chars() {
            match c.to_ascii_uppercase() {
                'U' => input.up = true,
                'D' => input.down = true,
                'L' => input.left = true,
                'R' => input.right = true,
                '-' => {}
                other => anyhow::bail!("unknown direction '{other}' in '{part}'"),
            }
        }
        steps.push((input, frames));
    }
    if steps.is_empty() {
        anyhow::bail!("empty movement script");
    }
    Ok(steps)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let Args { cfg, script } = parse_args()?;
    let script = parse_script(&script)?;
    info!(server = %cfg.server_addr, name = %cfg.player_name, "Starting client");

    let mut client = GameClient::connect(&cfg).await.context("connect")?;

    // Set up console input channel.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);

    // Spawn stdin reader thread.
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

    println!("Client connected. Type 'status' for info, 'quit' to exit.");
    println!();

    let mut frame_timer = interval(cfg.frame_interval());
    frame_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut send_timer = interval(cfg.send_interval());
    send_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut step = 0usize;
    let mut frames_in_step = 0u32;
    let mut frame_count = 0u64;

    loop {
        tokio::select! {
            _ = frame_timer.tick() => {
                let now = Instant::now();
                client.poll_network(now)?;

                let (input, frames) = script[step];
                client.frame(input, now)?;
                frames_in_step += 1;
                if frames_in_step >= frames {
                    frames_in_step = 0;
                    step = (step + 1) % script.len();
                }

                frame_count += 1;
                if frame_count % u64::from(cfg.frame_hz.max(1)) == 0 {
                    let pos = client.position()?;
                    info!(
                        x = pos.x,
                        y = pos.y,
                        pending = client.pipeline.outbox().len(),
                        corrections = client.pipeline.reconciler().corrections(),
                        remotes = client.remotes.len(),
                        "Client status"
                    );
                }
            }
            _ = send_timer.tick() => {
                if let Err(e) = client.network_tick(Instant::now()).await {
                    warn!(error = %e, "Network tick failed");
                }
            }
            Some(line) = console_rx.recv() => {
                match line.as_str() {
                    "status" => {
                        println!("State: {:?}", client.state);
                        println!("Client ID: {:?} entity {}", client.client_id, client.entity_id);
                        if let Ok(pos) = client.position() {
                            println!("Position: ({:.1}, {:.1})", pos.x, pos.y);
                        }
                        println!("Pending commands: {}", client.pipeline.outbox().len());
                        for remote in client.remotes.iter() {
                            println!("  {} at ({:.1}, {:.1})", remote.id, remote.current.x, remote.current.y);
                        }
                    }
                    "quit" | "exit" => {
                        client.disconnect().await?;
                        break;
                    }
                    other => println!("Unknown command: {other}"),
                }
            }
        }

        if client.state == ClientState::Disconnected {
            println!("Disconnected from server.");
            break;
        }
    }

    Ok(())
}
