//! CLI arguments and configuration file handling.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::server::ServerOptions;
use crate::Result;

#[derive(Debug, Parser)]
#[command(name = "methq")]
#[command(version, about = "methylome query engine")]
pub struct Cli {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Clone, Args)]
pub struct CommonArgs {
    /// Log level
    #[arg(short = 'v', long, global = true, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Append log output to this file instead of stderr
    #[arg(short = 'l', long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Configuration file (default: ~/.config/methq/config.json)
    #[arg(short = 'c', long, global = true, value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    /// Write a configuration template to PATH and exit
    #[arg(long, global = true, value_name = "PATH")]
    pub make_config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Build a CpG index from a reference genome
    Index(IndexArgs),
    /// Build a methylome from an external per-CpG counts file
    Format(FormatArgs),
    /// Verify index and methylome integrity
    Check(CheckArgs),
    /// Sum methylomes into one
    Merge(MergeArgs),
    /// Re-encode a methylome payload
    Compress(CompressArgs),
    /// Aggregate a methylome over uniform genomic bins
    Bins(BinsArgs),
    /// Aggregate a methylome over intervals from a BED file
    Intervals(IntervalsArgs),
    /// Run the query server
    Server(ServerArgs),
    /// Write a configuration template
    Config(ConfigArgs),
}

#[derive(Debug, Args)]
pub struct IndexArgs {
    /// Reference genome FASTA file
    #[arg(short = 'g', long)]
    pub genome: PathBuf,

    /// Output index payload path (metadata sidecar is derived)
    #[arg(short = 'o', long)]
    pub output: PathBuf,

    /// Assembly name (default: output file stem)
    #[arg(short = 'a', long)]
    pub assembly: Option<String>,
}

#[derive(Debug, Args)]
pub struct FormatArgs {
    /// Per-CpG counts input file (plain or gzipped)
    #[arg(short = 'm', long)]
    pub meth: PathBuf,

    /// CpG index payload for the target assembly
    #[arg(short = 'x', long)]
    pub index: PathBuf,

    /// Output methylome payload path
    #[arg(short = 'o', long)]
    pub output: PathBuf,

    /// Deflate the output payload
    #[arg(short = 'z', long)]
    pub zip: bool,
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    /// CpG index payload to verify, and to cross-check methylomes against
    #[arg(short = 'x', long)]
    pub index: Option<PathBuf>,

    /// Methylome payloads to verify
    #[arg(short = 'm', long = "methylome")]
    pub methylomes: Vec<PathBuf>,
}

#[derive(Debug, Args)]
pub struct MergeArgs {
    /// Output methylome payload path
    #[arg(short = 'o', long)]
    pub output: PathBuf,

    /// Deflate the output payload
    #[arg(short = 'z', long)]
    pub zip: bool,

    /// Input methylome payloads
    #[arg(required = true, num_args = 2..)]
    pub inputs: Vec<PathBuf>,
}

#[derive(Debug, Args)]
pub struct CompressArgs {
    /// Input methylome payload
    #[arg(short = 'i', long)]
    pub input: PathBuf,

    /// Output methylome payload
    #[arg(short = 'o', long)]
    pub output: PathBuf,

    /// Write the output plain instead of deflated
    #[arg(short = 'u', long)]
    pub decompress: bool,
}

#[derive(Debug, Args)]
pub struct BinsArgs {
    /// CpG index payload
    #[arg(short = 'x', long)]
    pub index: PathBuf,

    /// Methylome payload
    #[arg(short = 'm', long)]
    pub methylome: PathBuf,

    /// Bin size in bases
    #[arg(short = 'b', long)]
    pub bin_size: u32,

    /// Emit a covered-sites column
    #[arg(long)]
    pub coverage: bool,

    /// Output file (default: stdout)
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct IntervalsArgs {
    /// CpG index payload
    #[arg(short = 'x', long)]
    pub index: PathBuf,

    /// Methylome payload
    #[arg(short = 'm', long)]
    pub methylome: PathBuf,

    /// BED-style intervals file
    #[arg(short = 'i', long)]
    pub intervals: PathBuf,

    /// Emit a covered-sites column
    #[arg(long)]
    pub coverage: bool,

    /// Output file (default: stdout)
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ServerArgs {
    /// Host address to bind
    #[arg(short = 's', long, env = "METHQ_HOST")]
    pub hostname: Option<String>,

    /// Port to listen on
    #[arg(short = 'p', long, env = "METHQ_PORT")]
    pub port: Option<u16>,

    /// Directory of methylome payloads
    #[arg(short = 'm', long, env = "METHQ_METHYLOME_DIR")]
    pub methylome_dir: Option<PathBuf>,

    /// Directory of CpG index payloads
    #[arg(short = 'x', long, env = "METHQ_INDEX_DIR")]
    pub index_dir: Option<PathBuf>,

    /// Maximum resident methylomes
    #[arg(short = 'r', long)]
    pub max_resident: Option<usize>,

    /// Executor threads
    #[arg(short = 't', long)]
    pub n_threads: Option<usize>,

    /// Detach from the terminal and run in the background
    #[arg(short = 'd', long)]
    pub daemonize: bool,

    /// PID file written when daemonized
    #[arg(long, value_name = "PATH")]
    pub pid_file: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    /// Where to write the template (default: the per-user config path)
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,
}

/// Settings persisted in the JSON configuration file. CLI flags win over
/// file values; file values win over the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub host: String,
    pub port: u16,
    pub methylome_dir: PathBuf,
    pub index_dir: PathBuf,
    pub max_resident: usize,
    pub n_threads: usize,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub request_deadline_secs: u64,
    pub admission_timeout_secs: u64,
    pub grace_period_secs: u64,
}

impl Default for FileConfig {
    fn default() -> Self {
        FileConfig {
            host: "127.0.0.1".to_string(),
            port: 5000,
            methylome_dir: PathBuf::from("."),
            index_dir: PathBuf::from("."),
            max_resident: 32,
            n_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            read_timeout_secs: 10,
            write_timeout_secs: 10,
            request_deadline_secs: 60,
            admission_timeout_secs: 10,
            grace_period_secs: 5,
        }
    }
}

impl FileConfig {
    /// Load from an explicit path (which must exist) or from the per-user
    /// default path (which may be absent).
    pub fn load(explicit: Option<&Path>) -> Result<FileConfig> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => match default_config_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(FileConfig::default()),
            },
        };
        let text = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            request_deadline: Duration::from_secs(self.request_deadline_secs),
            grace_period: Duration::from_secs(self.grace_period_secs),
        }
    }

    pub fn admission_timeout(&self) -> Duration {
        Duration::from_secs(self.admission_timeout_secs)
    }
}

/// Per-user configuration file location.
pub fn default_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| {
        PathBuf::from(home)
            .join(".config")
            .join("methq")
            .join("config.json")
    })
}

/// Write a config template with the documented defaults.
pub fn write_template(path: &Path) -> Result<()> {
    FileConfig::default().write(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf/config.json");
        write_template(&path).unwrap();
        let loaded = FileConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.port, FileConfig::default().port);
        assert_eq!(loaded.max_resident, 32);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"port": 9999}"#).unwrap();
        let loaded = FileConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.port, 9999);
        assert_eq!(loaded.host, "127.0.0.1");
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        assert!(FileConfig::load(Some(Path::new("/nonexistent/methq.json"))).is_err());
    }
}
