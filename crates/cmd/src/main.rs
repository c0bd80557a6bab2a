// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chronoq_common_telemetry::{LoggingOptions, init_global_logging, set_panic_hook};
use chronoq_queue::{QueueBuilder, QueueReader, RollCycle};
use clap::{Args, Parser, Subcommand};
use snafu::{ResultExt, Whatever};

mod build_info;

#[derive(Debug, Parser)]
#[clap(
name = "chronoq",
about = "Inspect and append to chronoq queues",
author = build_info::AUTHOR,
version = build_info::FULL_VERSION)]
struct Cli {
    /// Log filter, e.g. `debug` or `chronoq_queue=trace`.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Write logs to hourly files in this directory instead of stdout.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Read(ReadArgs),
    Append(AppendArgs),
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Print the records of a queue, one `0x<index>: <payload>` line each.
Examples:

chronoq read /var/data/queue
chronoq read /var/data/queue -i order -e cancelled
chronoq read /var/data/queue -n 0x4a0500000000 --follow
chronoq read /var/data/queue --history 10

")]
struct ReadArgs {
    /// Queue directory.
    dir: PathBuf,

    /// Only print records matching this regex. May be repeated; all must
    /// match.
    #[arg(short = 'i', long = "include")]
    include: Vec<String>,

    /// Skip records matching this regex. May be repeated.
    #[arg(short = 'e', long = "exclude")]
    exclude: Vec<String>,

    /// Start at this index (decimal or `0x` hex).
    #[arg(short = 'n', long = "start", value_parser = parse_index)]
    start: Option<u64>,

    /// Print only the last N records present at startup.
    #[arg(long, conflicts_with = "start")]
    history: Option<u64>,

    /// Keep waiting for new records until interrupted.
    #[arg(short = 'f', long)]
    follow: bool,

    /// Roll cycle name, e.g. `DAILY`. Adopted from the files when omitted.
    #[arg(long)]
    roll_cycle: Option<RollCycle>,

    /// Poll interval in milliseconds while following.
    #[arg(long, default_value_t = 50)]
    poll_ms: u64,
}

impl ReadArgs {
    fn run(self) -> Result<(), Whatever> {
        let stop = Arc::new(AtomicBool::new(false));
        let handler_stop = Arc::clone(&stop);
        ctrlc::set_handler(move || handler_stop.store(true, Ordering::Release))
            .whatever_context("failed to install Ctrl-C handler")?;

        let mut reader = QueueReader::new()
            .with_base_path(&self.dir)
            .tail(self.follow)
            .with_poll_interval(Duration::from_millis(self.poll_ms))
            .with_stop_flag(stop);
        if let Some(roll_cycle) = self.roll_cycle {
            reader = reader.with_roll_cycle(roll_cycle);
        }
        for pattern in &self.include {
            reader = reader
                .with_inclusion_regex(pattern)
                .whatever_context("invalid --include pattern")?;
        }
        for pattern in &self.exclude {
            reader = reader
                .with_exclusion_regex(pattern)
                .whatever_context("invalid --exclude pattern")?;
        }
        if let Some(start) = self.start {
            reader = reader.with_start_index(start);
        }
        if let Some(count) = self.history {
            reader = reader.history_records(count);
        }

        reader
            .execute()
            .with_whatever_context(|_| format!("failed to read queue {}", self.dir.display()))
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Append each argument as one text record and print its index.
Examples:

chronoq append /var/data/queue hello world

")]
struct AppendArgs {
    /// Queue directory, created if missing.
    dir: PathBuf,

    /// Records to write.
    #[arg(required = true)]
    records: Vec<String>,

    /// Roll cycle for a new queue. Adopted from the files when omitted.
    #[arg(long)]
    roll_cycle: Option<RollCycle>,
}

impl AppendArgs {
    fn run(self) -> Result<(), Whatever> {
        let mut builder = QueueBuilder::new(&self.dir);
        if let Some(roll_cycle) = self.roll_cycle {
            builder = builder.roll_cycle(roll_cycle);
        }
        let queue = builder
            .build()
            .with_whatever_context(|_| format!("failed to open queue {}", self.dir.display()))?;
        let mut appender = queue
            .acquire_appender()
            .whatever_context("failed to acquire appender")?;

        for record in &self.records {
            let index = appender
                .write_text(record)
                .whatever_context("failed to append record")?;
            println!("{index:#x}");
        }
        Ok(())
    }
}

/// Accepts `0x`-prefixed hex or plain decimal.
fn parse_index(raw: &str) -> Result<u64, String> {
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.map_err(|e| format!("invalid index {raw:?}: {e}"))
}

fn main() -> Result<(), Whatever> {
    human_panic::setup_panic!();
    let cli = Cli::parse();

    let opts = LoggingOptions {
        dir: cli
            .log_dir
            .as_ref()
            .map(|dir| dir.display().to_string())
            .unwrap_or_default(),
        level: Some(cli.log_level.clone()),
        append_stdout: cli.log_dir.is_none(),
        ..Default::default()
    };
    let _guards =
        init_global_logging("chronoq", &opts).whatever_context("failed to initialise logging")?;
    set_panic_hook();

    match cli.commands {
        Commands::Read(args) => args.run(),
        Commands::Append(args) => args.run(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_index_accepts_hex_and_decimal() {
        assert_eq!(parse_index("0x10"), Ok(16));
        assert_eq!(parse_index("0X1f"), Ok(31));
        assert_eq!(parse_index("42"), Ok(42));
        assert!(parse_index("0xzz").is_err());
        assert!(parse_index("").is_err());
    }

    #[test]
    fn test_cli_parses_read_arguments() {
        let cli = Cli::parse_from([
            "chronoq", "read", "/tmp/q", "-i", "a", "-i", "b", "-e", "c", "-n", "0x2", "-f",
            "--roll-cycle", "MINUTELY",
        ]);
        let Commands::Read(args) = cli.commands else {
            panic!("expected read");
        };
        assert_eq!(args.include, vec!["a", "b"]);
        assert_eq!(args.exclude, vec!["c"]);
        assert_eq!(args.start, Some(2));
        assert!(args.follow);
        assert_eq!(args.roll_cycle, Some(RollCycle::Minutely));
    }

    #[test]
    fn test_cli_requires_records_to_append() {
        assert!(Cli::try_parse_from(["chronoq", "append", "/tmp/q"]).is_err());
    }
}
