use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use lineage_merge::MergeStrategy;
use lineage_types::{CheckpointRef, LineId, LineStatus, StateValue};

#[derive(Parser)]
#[command(
    name = "lineage",
    about = "Checkpointed execution lineage: snapshot, fork and merge execution lines",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Lineage data file
    #[arg(long, global = true, default_value = "lineage.wal")]
    pub data: PathBuf,

    /// Engine configuration (TOML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create a root line
    Create(CreateArgs),
    /// List every line
    Lines,
    /// Show a line
    Show(LineArgs),
    /// Record a step on a line
    Append(AppendArgs),
    /// List a line's snapshots
    Snapshots(LineArgs),
    /// Branch a line at a snapshot
    Fork(ForkArgs),
    /// Merge a source line into a target line
    Merge(MergeArgs),
    /// Show the merges into a line
    History(LineArgs),
    /// Change a line's status
    Status(StatusArgs),
    /// Replay a line and check its stored history
    Verify(LineArgs),
    /// Compare two snapshots of a line
    Diff(DiffArgs),
    /// Rewrite the data file to hold only current records
    Compact,
}

#[derive(Args)]
pub struct CreateArgs {
    #[arg(long)]
    pub name: Option<String>,
    /// Initial field, as key=json (repeatable)
    #[arg(long = "set", value_parser = parse_assignment)]
    pub set: Vec<(String, StateValue)>,
    /// Metadata entry, as key=value (repeatable)
    #[arg(long = "meta", value_parser = parse_metadata)]
    pub metadata: Vec<(String, String)>,
}

#[derive(Args)]
pub struct LineArgs {
    pub line: LineId,
}

#[derive(Args)]
pub struct AppendArgs {
    pub line: LineId,
    #[arg(long, default_value = "step")]
    pub kind: String,
    /// Field to set on top of the current state, as key=json (repeatable)
    #[arg(long = "set", value_parser = parse_assignment)]
    pub set: Vec<(String, StateValue)>,
    /// Field to remove (repeatable)
    #[arg(long)]
    pub unset: Vec<String>,
}

#[derive(Args)]
pub struct ForkArgs {
    pub line: LineId,
    /// Snapshot to branch at: `latest` or a sequence number
    #[arg(long, default_value = "latest")]
    pub at: CheckpointRef,
    #[arg(long)]
    pub name: String,
    /// Metadata entry, as key=value (repeatable)
    #[arg(long = "meta", value_parser = parse_metadata)]
    pub metadata: Vec<(String, String)>,
    /// Idempotency key for safe retries
    #[arg(long)]
    pub key: Option<String>,
}

#[derive(Args)]
pub struct MergeArgs {
    pub target: LineId,
    pub source: LineId,
    #[arg(long)]
    pub strategy: Option<MergeStrategy>,
    /// Conflict resolver: source or target
    #[arg(long, default_value = "source")]
    pub resolver: String,
    /// Merge a line that is not a direct branch of the target
    #[arg(long)]
    pub allow_unrelated: bool,
    /// Idempotency key for safe retries
    #[arg(long)]
    pub key: Option<String>,
}

#[derive(Args)]
pub struct DiffArgs {
    pub line: LineId,
    /// Older checkpoint: `latest` or a sequence number
    pub from: CheckpointRef,
    /// Newer checkpoint
    #[arg(default_value = "latest")]
    pub to: CheckpointRef,
}

#[derive(Args)]
pub struct StatusArgs {
    pub line: LineId,
    pub status: LineStatus,
    #[arg(long)]
    pub reason: Option<String>,
}

/// `key=json`; a value that is not valid JSON is taken as a string.
fn parse_assignment(raw: &str) -> Result<(String, StateValue), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    let value = serde_json::from_str::<serde_json::Value>(value)
        .map(StateValue::from)
        .unwrap_or_else(|_| StateValue::from(value));
    Ok((key.to_string(), value))
}

fn parse_metadata(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    Ok((key.trim().to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn assignments_parse_json_or_fall_back_to_string() {
        assert_eq!(
            parse_assignment("x=3").unwrap(),
            ("x".to_string(), StateValue::Int(3))
        );
        assert_eq!(
            parse_assignment("name=alice").unwrap(),
            ("name".to_string(), StateValue::from("alice"))
        );
        assert_eq!(
            parse_assignment("flags=[true,false]").unwrap().1,
            StateValue::from(serde_json::json!([true, false]))
        );
        assert!(parse_assignment("novalue").is_err());
        assert!(parse_assignment("=1").is_err());
    }

    #[test]
    fn merge_flags_parse() {
        let target = LineId::new();
        let source = LineId::new();
        let cli = Cli::try_parse_from([
            "lineage",
            "--data",
            "/tmp/x.wal",
            "merge",
            &target.to_string(),
            &source.to_string(),
            "--strategy",
            "overwrite",
            "--allow-unrelated",
        ])
        .unwrap();
        match cli.command {
            Command::Merge(args) => {
                assert_eq!(args.target, target);
                assert_eq!(args.strategy, Some(MergeStrategy::Overwrite));
                assert!(args.allow_unrelated);
                assert_eq!(args.resolver, "source");
            }
            _ => panic!("expected merge"),
        }
    }

    #[test]
    fn fork_checkpoint_parses() {
        let line = LineId::new();
        let cli = Cli::try_parse_from(["lineage", "fork", &line.to_string(), "--at", "2", "--name", "b"])
            .unwrap();
        match cli.command {
            Command::Fork(args) => {
                assert_eq!(args.at, CheckpointRef::Snapshot(lineage_types::SnapshotId::new(2)))
            }
            _ => panic!("expected fork"),
        }
    }

    #[test]
    fn diff_defaults_to_latest() {
        let line = LineId::new();
        let cli = Cli::try_parse_from(["lineage", "diff", &line.to_string(), "1"]).unwrap();
        match cli.command {
            Command::Diff(args) => {
                assert_eq!(args.from, CheckpointRef::Snapshot(lineage_types::SnapshotId::FIRST));
                assert_eq!(args.to, CheckpointRef::Latest);
            }
            _ => panic!("expected diff"),
        }
        assert!(matches!(
            Cli::try_parse_from(["lineage", "compact"]).unwrap().command,
            Command::Compact
        ));
    }
}
