//! Readmark: live reading presence
//!
//! `serve` runs the presence gateway; `watch` joins a room, reads scroll
//! offsets from stdin and prints the reading timeline.

use clap::Parser;
use readmark::config::{self, Config};
use readmark::presence::FormFactor;
use readmark::timeline::{Scheme, Timeline, Viewport, read_percent};
use readmark::transport::link::{Endpoint, normalize_url};
use readmark::{MarkerFrame, PresenceClient, server};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

/// Redraw cadence between table changes
const FRAME_INTERVAL: Duration = Duration::from_millis(50);
/// How long `watch` waits for the gateway before joining anyway
const CONNECT_WAIT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "readmark", about = "Live reading presence")]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Run the presence gateway
    Serve {
        /// `host:port`, `tcp://host:port` or `unix:/path` (default: configured gateway)
        #[arg(long)]
        listen: Option<String>,
    },
    /// Join a room and print the reading timeline (reads scroll offsets from stdin)
    Watch {
        #[arg(long)]
        room: String,
        /// Gateway endpoint (default: configured gateway)
        #[arg(long)]
        url: Option<String>,
        /// Behave like a compact device: presence is disabled
        #[arg(long)]
        compact: bool,
        #[arg(long, default_value_t = 0.0)]
        viewport_top: f64,
        #[arg(long, default_value_t = 1000.0)]
        viewport_height: f64,
        /// Use dark-scheme marker colors
        #[arg(long)]
        dark: bool,
    },
    /// Persist the gateway endpoint
    SetGateway { url: String },
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_env("READMARK_LOG").unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli.command).await {
        eprintln!("readmark: {e}");
        std::process::exit(1);
    }
}

async fn run(command: Command) -> readmark::Result<()> {
    match command {
        Command::SetGateway { url } => {
            let config = config::save_gateway_url(&url)?;
            println!("Gateway set to: {}", config.gateway_url);
            Ok(())
        }
        Command::Serve { listen } => {
            let config = config::load_config();
            let endpoint = Endpoint::parse(listen.as_deref().unwrap_or(&config.gateway_url))?;
            server::start(&endpoint).await
        }
        Command::Watch {
            room,
            url,
            compact,
            viewport_top,
            viewport_height,
            dark,
        } => {
            let mut config = config::load_config();
            if let Some(url) = url {
                config.gateway_url = normalize_url(&url);
            }
            let form_factor = if compact {
                FormFactor::Compact
            } else {
                FormFactor::Desktop
            };
            let scheme = if dark { Scheme::Dark } else { Scheme::Light };
            watch(
                &config,
                &room,
                form_factor,
                Viewport::new(viewport_top, viewport_height),
                scheme,
            )
            .await
        }
    }
}

async fn watch(
    config: &Config,
    room: &str,
    form_factor: FormFactor,
    viewport: Viewport,
    scheme: Scheme,
) -> readmark::Result<()> {
    // Validate before dialing so a typo fails fast.
    Endpoint::parse(&config.gateway_url)?;

    let (_shared, client) = PresenceClient::connect(config);
    match client.wait_connected(CONNECT_WAIT).await {
        Some(sid) => info!(%sid, gateway = %config.gateway_url, "connected"),
        None => warn!(gateway = %config.gateway_url, "gateway not reachable yet, retrying in background"),
    }

    let Some(handle) = client.join(room, form_factor) else {
        println!("Presence is disabled on compact devices.");
        return Ok(());
    };

    let mut timeline = Timeline::new(viewport, config.animation());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(FRAME_INTERVAL);
    let mut stdin_open = true;
    let mut last_output = String::new();

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match line.trim().parse::<f64>() {
                    Ok(offset) => {
                        let percent = read_percent(offset, viewport);
                        handle.sample(f64::from(percent));
                        timeline.set_local_percent(percent);
                    }
                    Err(_) => warn!(input = %line, "expected a scroll offset in pixels"),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "stdin closed");
                    stdin_open = false;
                }
            },
            // Redraw as soon as the table changes; the ticker keeps
            // transitions and reading durations moving in between.
            _ = client.store().changed() => {}
            _ = ticker.tick() => {}
        }

        let now = Instant::now();
        if client.store().take_dirty() {
            let sid = client.session_id();
            timeline.sync(&client.snapshot(room), sid.as_deref(), handle.position(), now);
        }
        let output = render(&timeline.frames(now, scheme));
        if output != last_output {
            print!("{output}");
            last_output = output;
        }
    }

    handle.deactivate().await;
    Ok(())
}

/// One line per marker, followed by a blank separator line.
fn render(frames: &[MarkerFrame]) -> String {
    let mut out = String::new();
    for frame in frames {
        let color = frame.color.as_deref().unwrap_or("accent");
        out.push_str(&format!(
            "{marker} {top:>8.1}px {pos:>3}% blur={blur:.1} {label} ({reading}) [{color}]\n",
            marker = if frame.is_local { '>' } else { '|' },
            top = frame.top,
            pos = frame.position,
            blur = frame.blur,
            label = frame.label,
            reading = frame.reading_duration,
        ));
    }
    if !out.is_empty() {
        out.push('\n');
    }
    out
}
