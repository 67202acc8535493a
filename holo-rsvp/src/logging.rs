//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use tracing::level_filters::LevelFilter;
use tracing_appender::rolling;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::{Logging, LoggingFileRotation, LoggingFmt, LoggingFmtStyle};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

// Installs the global tracing subscriber.
//
// The `RUST_LOG` environment variable overrides the default debug level.
// Console output goes to stderr, stdout being reserved for protocol output.
pub fn init_tracing(config: &Logging) -> Result<(), TryInitError> {
    let mut layers = Vec::new();

    // Enable logging to a file.
    if config.file.enabled {
        let file_appender = match config.file.rotation {
            LoggingFileRotation::Never => {
                rolling::never(&config.file.dir, &config.file.name)
            }
            LoggingFileRotation::Hourly => {
                rolling::hourly(&config.file.dir, &config.file.name)
            }
            LoggingFileRotation::Daily => {
                rolling::daily(&config.file.dir, &config.file.name)
            }
        };
        layers.push(fmt_layer(file_appender, &config.file.fmt));
    }

    // Enable logging to the console.
    if config.console.enabled {
        layers.push(fmt_layer(std::io::stderr, &config.console.fmt));
    }

    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::DEBUG.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
}

fn fmt_layer<W>(writer: W, fmt: &LoggingFmt) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_target(false)
        .with_thread_ids(fmt.show_thread_id)
        .with_file(fmt.show_source)
        .with_line_number(fmt.show_source)
        .with_ansi(fmt.colors);
    match fmt.style {
        LoggingFmtStyle::Compact => layer.compact().boxed(),
        LoggingFmtStyle::Full => layer.boxed(),
        LoggingFmtStyle::Json => layer.json().boxed(),
        LoggingFmtStyle::Pretty => layer.pretty().boxed(),
    }
}

// ===== unit tests =====
