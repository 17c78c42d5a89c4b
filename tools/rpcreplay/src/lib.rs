pub mod config;
pub mod dump;
pub mod entry;
pub mod errors;
pub mod framing;
pub mod header;
pub mod logging;
pub mod message;
pub mod recorder;
pub mod replayer;
pub mod status;
pub mod transport;

pub use entry::{Entry, EntryKind, Payload};
pub use errors::ReplayError;
pub use message::{invoke, Message, TypedStream};
pub use recorder::{Recorder, RecorderOptions};
pub use replayer::{PendingCall, Replayer, ReplayerOptions};
pub use status::{Code, Status};
pub use transport::{CallContext, Channel, ChannelOptions, ClientStream, Interceptor};

use clap::{error::ErrorKind, Parser};
use config::{load_config, CliOverrides, DumpFormat};
use dump::{fprint, fprint_json, fprint_summary, summarize};
use logging::{append_run_log, init_run_logger};
use serde_json::json;
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "rpcreplay")]
#[command(about = "Inspect an rpcreplay log")]
pub struct Cli {
    /// Log file written by a recorder.
    pub log: PathBuf,
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Print one JSON object per entry.
    #[arg(long, default_value_t = false, conflicts_with = "summary")]
    pub json: bool,
    /// Print per-method call counts instead of entries.
    #[arg(long, default_value_t = false)]
    pub summary: bool,
    #[arg(long)]
    pub max_payload_bytes: Option<usize>,
    #[arg(long)]
    pub run_log: Option<PathBuf>,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        let format = if self.json {
            Some(DumpFormat::Json)
        } else if self.summary {
            Some(DumpFormat::Summary)
        } else {
            None
        };
        CliOverrides {
            config_path: self.config.clone(),
            format,
            max_payload_bytes: self.max_payload_bytes,
            run_log: self.run_log.clone(),
        }
    }
}

pub fn run() -> Result<i32, ReplayError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    run_with_args(&args, &mut out)
}

pub fn run_with_args(args: &[std::ffi::OsString], out: &mut dyn Write) -> Result<i32, ReplayError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                write!(out, "{error}")?;
                return Ok(0);
            }
            _ => return Err(ReplayError::Cli(error.to_string())),
        },
    };

    let cfg = load_config(&cli.overrides())?;
    if let Some(path) = &cfg.logging.run_log {
        init_run_logger(path, cfg.logging.max_payload_bytes)?;
    }
    append_run_log(
        "info",
        "inspect.started",
        json!({
            "log": cli.log.display().to_string(),
            "format": cfg.dump.format,
        }),
    );

    let file = File::open(&cli.log)
        .map_err(|e| ReplayError::Io(format!("open {}: {e}", cli.log.display())))?;
    let mut reader = BufReader::new(file);
    let options = cfg.dump.options();
    match cfg.dump.format {
        DumpFormat::Text => fprint(out, &mut reader, &options)?,
        DumpFormat::Json => fprint_json(out, &mut reader, &options)?,
        DumpFormat::Summary => {
            let summary = summarize(&mut reader)?;
            fprint_summary(out, &summary)?;
        }
    }
    out.flush()?;

    append_run_log("info", "inspect.finished", json!({ "log": cli.log.display().to_string() }));
    Ok(0)
}
