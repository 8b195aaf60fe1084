use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use deckhand_terminal::{
    BridgeClient, EventBus, LifecycleState, MemoryHost, TerminalAdapter, TerminalWidget,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

mod cli;
mod echo_host;

use cli::Cli;
use echo_host::EchoHost;

const DEFAULT_SIZE: (u16, u16) = (80, 24);

/// Renders session output straight to stdout
struct StdoutWidget {
    cols: u16,
    rows: u16,
}

impl TerminalWidget for StdoutWidget {
    fn write(&mut self, data: &[u8]) {
        let mut stdout = std::io::stdout().lock();
        if let Err(err) = stdout.write_all(data).and_then(|_| stdout.flush()) {
            log::warn!("failed to write session output: {}", err);
        }
    }

    fn size(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }
}

fn widget_size(cli: &Cli) -> (u16, u16) {
    let (cols, rows) = crossterm::terminal::size().unwrap_or(DEFAULT_SIZE);
    (cli.cols.unwrap_or(cols), cli.rows.unwrap_or(rows))
}

fn session_over(adapter: &TerminalAdapter<StdoutWidget>) -> bool {
    matches!(
        adapter.controller().state(),
        LifecycleState::Closed | LifecycleState::StartFailed
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    let bridge = cli.bridge_config()?;
    let session_id = cli
        .session_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let config = cli.session_config(session_id.clone())?;
    log::info!("starting {} session {}", config.launch.name(), session_id);

    let bus = EventBus::new();
    let handler = Arc::new(EchoHost::new(bus.clone(), cli.exit_code));
    let host = Arc::new(MemoryHost::with_handler(bus, handler));
    let client = BridgeClient::new(host);

    let adapter = TerminalAdapter::mount(client, config, Arc::new(bridge));
    let (cols, rows) = widget_size(&cli);
    adapter.attach(|| StdoutWidget { cols, rows });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(Duration::from_millis(50));
    let mut failure = None;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("failed to read stdin")? {
                    Some(line) => adapter.on_data(&format!("{}\n", line)),
                    None => break,
                }
            }
            _ = ticker.tick() => {}
        }

        if let Some(err) = adapter.take_error() {
            eprintln!("error: {}", err);
            failure = Some(err);
        }
        if session_over(&adapter) {
            break;
        }
    }

    let state = adapter.controller().state();
    let exit_code = adapter.view().exit_code();
    adapter.close().await;
    println!();

    if state == LifecycleState::StartFailed {
        bail!(
            "session failed to start: {}",
            failure.unwrap_or_else(|| "unknown error".to_string())
        );
    }
    if let Some(code) = exit_code.filter(|code| *code != 0) {
        std::process::exit(i32::try_from(code).unwrap_or(1));
    }
    Ok(())
}
