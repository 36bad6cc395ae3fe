mod app;
mod bridge;
mod config;

use std::{
    io::{self, BufRead, Write},
    sync::mpsc,
};

use anyhow::Context;
use app::{Action, Input, TetherApp};
use bridge::{spawn_matrix_task, EventSink};
use config::AppConfig;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tether=debug,tether_core=debug".into()),
        )
        .with_writer(io::stderr)
        .init();

    let config = AppConfig::from_env().context("reading configuration from the environment")?;
    tracing::info!("connecting to {} as {}", config.homeserver, config.username);

    let (input_tx, input_rx) = mpsc::channel();
    let (cmd_tx, cmd_rx) = tokio::sync::mpsc::unbounded_channel();

    let matrix_tx = input_tx.clone();
    let sink = EventSink::new(move |event| {
        let _ = matrix_tx.send(Input::Matrix(event));
    });
    // The Matrix thread is not joined: quitting ends the process mid long-poll.
    let _matrix = spawn_matrix_task(config, sink, cmd_rx);

    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if input_tx.send(Input::Line(line)).is_err() {
                return;
            }
        }
        let _ = input_tx.send(Input::Eof);
    });

    let mut app = TetherApp::new(cmd_tx);
    let stdout = io::stdout();

    while let Ok(input) = input_rx.recv() {
        let (action, lines) = app.update(input);
        let mut out = stdout.lock();
        for line in lines {
            writeln!(out, "{line}")?;
        }
        out.flush()?;

        if action == Action::Quit {
            break;
        }
    }
    Ok(())
}
