use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::EnvFilter;

use companion_session::config::CliOverrides;
use companion_session::voice::AudioCapture;
use companion_session::{Catalog, ClientConfig, Session, StateStore, UserIntent, ViewState};

/// Companion - terminal client for a voice and text companion
#[derive(Parser)]
#[command(name = "companion", version, about)]
struct Cli {
    /// Companion server base URL
    #[arg(long, env = "COMPANION_SERVER_URL")]
    server: Option<String>,

    /// Character pack to request
    #[arg(short, long, env = "COMPANION_PACK_ID")]
    pack: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Connect and chat (default)
    Run,
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Start a fresh session on the next connect
    ForgetSession,
}

/// A parsed line of terminal input
#[derive(Debug, PartialEq)]
enum Input {
    Intent(UserIntent),
    Quit,
    Ignore,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info",
        1 => "info,companion_session=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = ClientConfig::load(CliOverrides {
        server_url: cli.server,
        pack_id: cli.pack,
    })?;
    tracing::debug!(?config, "loaded configuration");

    let store = StateStore::open(&config.data_dir);
    if let Some(pack) = &config.pack_id {
        store.set_pack_id(pack);
    }

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => chat(&config, store).await,
        Command::TestMic { duration } => test_mic(duration).await,
        Command::ForgetSession => {
            store.forget_session();
            println!("Session forgotten; the next connect starts a new one.");
            Ok(())
        }
    }
}

/// Interactive session on stdin/stdout
async fn chat(config: &ClientConfig, store: StateStore) -> anyhow::Result<()> {
    tracing::info!(
        server = %config.server_url,
        pack = %store.pack_id(),
        "starting companion session"
    );

    let (session, mut handle) = Session::connect(config, store)?;
    let session_task = tokio::spawn(session.run());

    println!("Type to chat. Commands: /mic, /outfits, /outfit <id>, /pack <id>, /quit");

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut last_text = String::new();
    let mut last_catalog = Catalog::default();

    loop {
        tokio::select! {
            changed = handle.view.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = handle.view.borrow_and_update().clone();
                if view.text != last_text && !view.text.is_empty() {
                    println!("{}", render_text(&view));
                }
                last_text.clone_from(&view.text);
                if view.catalog.packs != last_catalog.packs && !view.catalog.packs.is_empty() {
                    println!("Packs: {}", render_packs(&view.catalog));
                }
                if view.catalog.outfits != last_catalog.outfits && !view.catalog.outfits.is_empty() {
                    println!("Outfits: {}", render_outfits(&view.catalog));
                }
                last_catalog = view.catalog.clone();
                tracing::debug!(
                    turn = ?view.turn,
                    indicator = view.indicator.label(),
                    image = ?view.image_url,
                    "view updated"
                );
            }
            Some(alert) = handle.alerts.recv() => {
                println!("! {alert}");
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match parse_input(&line) {
                    Input::Intent(intent) => {
                        if !handle.send(intent) {
                            break;
                        }
                    }
                    Input::Quit => break,
                    Input::Ignore => {}
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    drop(handle);
    session_task.await?;
    Ok(())
}

fn render_text(view: &ViewState) -> String {
    let speaker = view
        .catalog
        .character_name
        .as_deref()
        .unwrap_or("companion");
    format!("[{}] {speaker}: {}", view.indicator.label(), view.text)
}

fn render_packs(catalog: &Catalog) -> String {
    catalog
        .packs
        .iter()
        .map(|pack| {
            let marker = if catalog.active_pack.as_deref() == Some(pack.id.as_str()) {
                "*"
            } else {
                ""
            };
            format!("{}{marker} ({})", pack.label(), pack.id)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn render_outfits(catalog: &Catalog) -> String {
    catalog
        .outfits
        .iter()
        .map(|outfit| {
            let marker = if catalog.current_outfit.as_deref() == Some(outfit.id.as_str()) {
                "*"
            } else {
                ""
            };
            format!("{}{marker} ({})", outfit.label(), outfit.id)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Ignore;
    }

    let Some(command) = line.strip_prefix('/') else {
        return Input::Intent(UserIntent::SubmitText(line.to_string()));
    };

    let (name, arg) = command
        .split_once(char::is_whitespace)
        .map_or((command, ""), |(name, arg)| (name, arg.trim()));

    match (name, arg) {
        ("quit" | "exit", _) => Input::Quit,
        ("mic", _) => Input::Intent(UserIntent::ToggleMic),
        ("outfits", _) => Input::Intent(UserIntent::RequestOutfits),
        ("outfit", id) if !id.is_empty() => Input::Intent(UserIntent::SelectOutfit(id.to_string())),
        ("pack", id) if !id.is_empty() => Input::Intent(UserIntent::SelectPack(id.to_string())),
        _ => {
            println!("Unknown command: /{command}");
            Input::Ignore
        }
    }
}

/// Test microphone input
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut capture = AudioCapture::new()?;
    capture.start()?;

    let sample_rate = capture.sample_rate();
    println!("Sample rate: {sample_rate} Hz");
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples = capture.take_buffer();
        let energy = companion_session::capture::rms_energy(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );
    }

    capture.stop();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed below 0.01, silence detection will end every capture at once.");

    Ok(())
}
