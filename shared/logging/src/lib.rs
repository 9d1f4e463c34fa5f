use std::{
    fs::{File, OpenOptions},
    path::PathBuf,
    sync::Arc,
};

use anyhow::Context;
use clap::ValueEnum;
use tracing::Level;
use tracing_subscriber::{
    filter::{Directive, FromEnvError},
    fmt,
    layer::SubscriberExt,
    EnvFilter, Layer,
};

#[derive(Clone, Debug, Copy, ValueEnum, PartialEq)]
pub enum LogOutput {
    Console,
    Json,
}

pub struct ShutdownHandler {
    log_file: Option<Arc<File>>,
}

impl ShutdownHandler {
    /// Flush the log file, if there is one, to disk.
    pub fn shutdown(self) -> anyhow::Result<()> {
        if let Some(file) = self.log_file {
            file.sync_all().context("flushing log file")?;
        }
        Ok(())
    }
}

pub struct LoggingBuilder {
    output: LogOutput,
    level: Level,
    write_logs_file: Option<PathBuf>,
}

impl Default for LoggingBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingBuilder {
    /// Create a new logging builder with default settings
    pub fn new() -> Self {
        Self {
            output: LogOutput::Console,
            level: Level::INFO,
            write_logs_file: None,
        }
    }

    /// Set the log output format
    pub fn with_output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    /// Set the log level
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Set the log file path (optional)
    pub fn with_log_file<P: Into<Option<PathBuf>>>(mut self, path: P) -> Self {
        self.write_logs_file = path.into();
        self
    }

    pub fn init(self) -> anyhow::Result<ShutdownHandler> {
        init_logging_core(self.output, self.level, self.write_logs_file)
    }
}

/// Create a new logging builder
pub fn logging() -> LoggingBuilder {
    LoggingBuilder::new()
}

fn quiet_directives() -> anyhow::Result<[Directive; 2]> {
    Ok(["tokio=off".parse()?, "runtime=off".parse()?])
}

fn init_logging_core(
    output: LogOutput,
    level: Level,
    write_logs_file: Option<PathBuf>,
) -> anyhow::Result<ShutdownHandler> {
    // exclude tokio traces from regular output
    let mut output_logs_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env()?;
    for directive in quiet_directives()? {
        output_logs_filter = output_logs_filter.add_directive(directive);
    }

    let make_detailed_logs_filter = || -> anyhow::Result<EnvFilter> {
        let filter: Result<EnvFilter, FromEnvError> = if std::env::var("WRITE_RUST_LOG").is_ok()
        {
            EnvFilter::builder()
                .with_env_var("WRITE_RUST_LOG")
                .from_env()
        } else {
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env()
        };
        let mut filter = filter?;
        for directive in quiet_directives()? {
            filter = filter.add_directive(directive);
        }
        Ok(filter)
    };

    let subscriber = tracing_subscriber::registry();
    let subscriber = match output {
        LogOutput::Console => subscriber.with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(output_logs_filter)
                .boxed(),
        ),
        LogOutput::Json => subscriber.with(
            fmt::layer()
                .json()
                .with_writer(std::io::stdout)
                .flatten_event(true)
                .with_current_span(true)
                .with_filter(output_logs_filter)
                .boxed(),
        ),
    };

    let log_file = match write_logs_file {
        Some(path) => {
            let file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(&path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            let file = Arc::new(file);
            tracing::subscriber::set_global_default(
                subscriber.with(
                    fmt::layer()
                        .with_ansi(false)
                        .with_writer(file.clone())
                        .with_filter(make_detailed_logs_filter()?),
                ),
            )?;
            Some(file)
        }
        None => {
            tracing::subscriber::set_global_default(subscriber)?;
            None
        }
    };

    Ok(ShutdownHandler { log_file })
}
