// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::sync::Arc;
use std::time::Duration;

use zhandle::ds::mock::EmulatorEngine;
#[cfg(feature = "libzfs")]
use zhandle::ds::zfs::LibZfsEngine;
use zhandle::ds::{DatasetName, DatasetStats, Engine, Error, HandleRef, Registry, validation};

#[cfg(feature = "libzfs")]
const DEFAULT_ENGINE: &str = "libzfs";
#[cfg(not(feature = "libzfs"))]
const DEFAULT_ENGINE: &str = "mock";

#[derive(Parser)]
#[command(version, about = "Inspect ZFS datasets through the handle cache")]
struct Cli {
    /// Verbose output
    #[arg(short = 'v', global = true, help_heading = "Global options")]
    verbose: bool,

    /// Engine implementation
    #[arg(
        long = "engine",
        global = true,
        help_heading = "Global options",
        default_value = DEFAULT_ENGINE
    )]
    engine: EngineType,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check dataset and snapshot names without touching the engine.
    Validate {
        /// Names to check (in the form 'pool/dataset' or 'pool/dataset@snapshot').
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Open a dataset and print its statistics.
    Stat {
        /// The dataset or snapshot.
        name: String,

        /// Omit headers and formatting, separate fields by a single tab.
        #[arg(short = 'H')]
        parseable: bool,

        /// Print statistics as JSON.
        #[cfg(feature = "json")]
        #[arg(long, conflicts_with = "parseable")]
        json: bool,

        /// Give up on the statistics fetch after this many seconds.
        #[arg(long, value_name = "SECS")]
        timeout: Option<f64>,
    },
    /// Print the mount options of a dataset.
    Mntopts {
        /// The dataset.
        name: String,
    },
}

/// Engine selection.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum EngineType {
    /// Use LibZFS directly.
    #[cfg(feature = "libzfs")]
    #[value(name = "libzfs")]
    LibZfs,
    /// Use an in-memory emulator (for testing).
    #[value(name = "mock")]
    Mock,
}

/// Output format for `zhandle stat`.
#[derive(Copy, Clone, PartialEq, Eq)]
enum StatFormat {
    Table,
    Parseable,
    #[cfg(feature = "json")]
    Json,
}

#[cfg(feature = "json")]
#[derive(serde::Serialize)]
struct StatRecord<'a> {
    name: &'a str,
    kind: zhandle::ds::DatasetKind,
    head_kind: zhandle::ds::DatasetKind,
    #[serde(flatten)]
    stats: &'a DatasetStats,
}

/// Prints a handle's kind and statistics.
fn print_stats(
    handle: &HandleRef,
    stats: &DatasetStats,
    mut writer: impl std::io::Write,
    format: StatFormat,
) -> Result<()> {
    let origin = stats.origin.as_deref();
    match format {
        #[cfg(feature = "json")]
        StatFormat::Json => {
            let record = StatRecord {
                name: handle.name().as_str(),
                kind: handle.kind(),
                head_kind: handle.head_kind(),
                stats,
            };
            serde_json::to_writer_pretty(&mut writer, &record)?;
            writeln!(writer)?;
        }
        // Same convention as zfs get -H: no headers, tab-separated fields.
        StatFormat::Parseable => {
            writeln!(
                writer,
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                handle.name(),
                handle.kind(),
                stats.creation_txg,
                stats.guid,
                stats.num_clones,
                stats.is_snapshot,
                stats.inconsistent,
                origin.unwrap_or("")
            )?;
        }
        StatFormat::Table => {
            let rows: [(&str, String); 9] = [
                ("NAME", handle.name().to_string()),
                ("KIND", handle.kind().to_string()),
                ("OBJSET", stats.objset_type.to_string()),
                ("TXG", stats.creation_txg.to_string()),
                ("GUID", stats.guid.to_string()),
                ("CLONES", stats.num_clones.to_string()),
                ("INCONSISTENT", yes_no(stats.inconsistent).to_string()),
                ("REDACTED", yes_no(stats.redacted).to_string()),
                ("ORIGIN", origin.unwrap_or("-").to_string()),
            ];
            let width = rows.iter().map(|(label, _)| label.len()).max().unwrap_or(0);
            for (label, value) in rows {
                writeln!(writer, "{:<width$}  {}", label, value, width = width)?;
            }
        }
    }
    Ok(())
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

/// Check each name, printing one line per name. Returns the number of
/// invalid names.
fn validate_names(names: &[String], mut writer: impl std::io::Write) -> Result<usize> {
    let mut invalid = 0;
    for name in names {
        match validation::validate_name(name) {
            Ok(()) => writeln!(writer, "{}\tok", name)?,
            Err(Error::InvalidName { reason, .. }) => {
                invalid += 1;
                writeln!(writer, "{}\t{}", name, reason)?;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(invalid)
}

fn execute_command<E: Engine + 'static>(
    command: &Commands,
    engine: Arc<E>,
    mut writer: impl std::io::Write,
) -> Result<()> {
    let registry = Registry::new();
    match command {
        Commands::Validate { names } => {
            let invalid = validate_names(names, &mut writer)?;
            if invalid > 0 {
                anyhow::bail!("{} of {} names are invalid", invalid, names.len());
            }
            Ok(())
        }
        #[cfg(feature = "json")]
        Commands::Stat {
            name,
            parseable,
            json,
            timeout,
        } => {
            let format = if *json {
                StatFormat::Json
            } else if *parseable {
                StatFormat::Parseable
            } else {
                StatFormat::Table
            };
            stat(&registry, engine, name, *timeout, format, writer)
        }
        #[cfg(not(feature = "json"))]
        Commands::Stat {
            name,
            parseable,
            timeout,
        } => {
            let format = if *parseable {
                StatFormat::Parseable
            } else {
                StatFormat::Table
            };
            stat(&registry, engine, name, *timeout, format, writer)
        }
        Commands::Mntopts { name } => {
            let name = DatasetName::new(name)?;
            let handle = registry
                .open(&*engine, &name)
                .context("Failed to open dataset")?;
            let options = handle
                .refresh_mount_options(&*engine)
                .context("Failed to read mount options")?;
            writeln!(writer, "{}", options.as_deref().unwrap_or("-"))?;
            registry.close(handle);
            Ok(())
        }
    }
}

fn stat<E: Engine + 'static>(
    registry: &Registry,
    engine: Arc<E>,
    name: &str,
    timeout: Option<f64>,
    format: StatFormat,
    writer: impl std::io::Write,
) -> Result<()> {
    let name = DatasetName::new(name)?;
    let handle = registry
        .open(&*engine, &name)
        .context("Failed to open dataset")?;

    // A fresh fetch, so that the printed values are current rather than
    // whatever the handle was primed with.
    handle.invalidate();
    let stats = match timeout {
        Some(secs) => {
            let timeout = Duration::try_from_secs_f64(secs)
                .with_context(|| format!("Invalid timeout '{}'", secs))?;
            handle.stats_timeout(Arc::clone(&engine), timeout)
        }
        None => handle.stats(&*engine),
    }
    .context("Failed to read dataset statistics")?;

    print_stats(&handle, &stats, writer, format)?;
    registry.close(handle);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over -v.
    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .event_format(tracing_subscriber::fmt::format().with_ansi(false).compact())
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let stdout = std::io::stdout();
    match cli.engine {
        EngineType::Mock => {
            let engine = Arc::new(EmulatorEngine::sampled());
            execute_command(&cli.command, engine, stdout.lock())?;
        }
        #[cfg(feature = "libzfs")]
        EngineType::LibZfs => {
            let engine = Arc::new(LibZfsEngine::new().context("Failed to initialize libzfs")?);
            execute_command(&cli.command, engine, stdout.lock())?;
        }
    }

    Ok(())
}
