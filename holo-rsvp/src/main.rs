//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use clap::{App, Arg};
use holo_rsvp::config::{Config, InstanceCfg};
use holo_rsvp::instance::{Instance, ProtocolInputChannelsTx, channels};
use holo_rsvp::logging::init_tracing;
use holo_rsvp::task::Task;
use holo_rsvp::tasks::messages::{ProtocolInputMsg, ProtocolOutputMsg};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

// Parses one line of input and hands it over to the instance.
fn relay_input(input_tx: &ProtocolInputChannelsTx, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    match serde_json::from_str::<ProtocolInputMsg>(line) {
        Ok(msg) => {
            if let Err(error) = input_tx.send(msg) {
                error.log();
            }
        }
        Err(error) => warn!(%error, "failed to decode input message"),
    }
}

async fn write_output<W>(
    writer: &mut W,
    msg: &ProtocolOutputMsg,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

fn signal_listener() -> mpsc::Receiver<()> {
    let (signal_tx, signal_rx) = mpsc::channel(1);

    tokio::task::spawn(async move {
        let (mut sigint, mut sigterm) = match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
            (Err(error), _) | (_, Err(error)) => {
                error!(%error, "failed to install signal handlers");
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => {
                info!("received SIGINT");
                let _ = signal_tx.send(()).await;
            },
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                let _ = signal_tx.send(()).await;
            }
        }
    });

    signal_rx
}

// Runs the instance, reading input messages from stdin and writing output
// messages to stdout, one JSON document per line.
async fn serve(config: InstanceCfg, mut signal_rx: mpsc::Receiver<()>) {
    let (tx, rx, mut output_rx) = channels();
    let input_tx = tx.protocol_input.clone();
    let instance = Instance::new(config, tx);
    let _instance = Task::spawn(instance.run(rx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => relay_input(&input_tx, &line),
                Ok(None) => {
                    info!("end of input");
                    break;
                }
                Err(error) => {
                    error!(%error, "failed to read input");
                    break;
                }
            },
            Some(msg) = output_rx.recv() => {
                if let Err(error) = write_output(&mut stdout, &msg).await {
                    error!(%error, "failed to write output");
                    break;
                }
            }
            _ = signal_rx.recv() => break,
        }
    }
}

// ===== main =====

fn main() {
    // Parse command-line parameters.
    let matches = App::new("Holo RSVP-TE head-end")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("file")
                .help("Specify an alternative configuration file."),
        )
        .get_matches();

    // Read configuration file.
    let config_file = matches.value_of("config");
    let config = Config::load(config_file);

    // Initialize tracing.
    if let Err(error) = init_tracing(&config.logging) {
        eprintln!("failed to initialize tracing: {error}");
        std::process::exit(1);
    }

    // We're ready to go!
    info!("starting up");

    // Main loop.
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            error!(%error, "failed to create async runtime");
            std::process::exit(1);
        }
    };
    runtime.block_on(async {
        let signal_rx = signal_listener();
        serve(config.instance, signal_rx).await;
    });

    info!("exiting");
}
