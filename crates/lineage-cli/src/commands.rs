use std::sync::Arc;

use anyhow::{anyhow, Context};
use colored::Colorize;
use lineage_engine::{
    Engine, EngineConfig, ForkRequest, MergeRequest, OpContext, TracingHistory,
};
use lineage_merge::{builtin, ConflictResolver, FieldChange, SourceWins};
use lineage_registry::{Line, NewLine};
use lineage_store::FileKvStore;
use lineage_types::{FieldKey, IdempotencyKey, LineStatus, State};
use serde_json::json;
use tracing::debug;

use crate::cli::*;

type FileEngine = Engine<FileKvStore>;

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let resolver: Arc<dyn ConflictResolver> = match &cli.command {
        Command::Merge(args) => Arc::from(
            builtin(&args.resolver)
                .ok_or_else(|| anyhow!("unknown resolver '{}' (use source or target)", args.resolver))?,
        ),
        _ => Arc::new(SourceWins),
    };
    let store = FileKvStore::open(&cli.data, config.storage.clone())
        .with_context(|| format!("opening {}", cli.data.display()))?;
    debug!(data = %cli.data.display(), "lineage store opened");

    let engine = Engine::builder(Arc::new(store))
        .config(config)
        .resolver(resolver)
        .history(Arc::new(TracingHistory))
        .build()?;
    let out = Output { format: cli.format };

    match cli.command {
        Command::Create(args) => cmd_create(&engine, &out, args).await,
        Command::Lines => cmd_lines(&engine, &out),
        Command::Show(args) => cmd_show(&engine, &out, args),
        Command::Append(args) => cmd_append(&engine, &out, args).await,
        Command::Snapshots(args) => cmd_snapshots(&engine, &out, args),
        Command::Fork(args) => cmd_fork(&engine, &out, args).await,
        Command::Merge(args) => cmd_merge(&engine, &out, args).await,
        Command::History(args) => cmd_history(&engine, &out, args),
        Command::Status(args) => cmd_status(&engine, &out, args).await,
        Command::Verify(args) => cmd_verify(&engine, &out, args),
        Command::Diff(args) => cmd_diff(&engine, &out, args),
        Command::Compact => cmd_compact(&engine, &out),
    }
}

struct Output {
    format: OutputFormat,
}

impl Output {
    fn json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    fn print_json(&self, value: &impl serde::Serialize) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}

fn context(key: Option<String>) -> anyhow::Result<OpContext> {
    let ctx = OpContext::new();
    Ok(match key {
        Some(key) => ctx.with_idempotency_key(IdempotencyKey::new(key)?),
        None => ctx,
    })
}

fn status_label(status: LineStatus) -> colored::ColoredString {
    match status {
        LineStatus::Active => status.as_str().green(),
        LineStatus::Paused => status.as_str().yellow(),
        LineStatus::Completed | LineStatus::Merged => status.as_str().blue(),
        LineStatus::Failed => status.as_str().red(),
        LineStatus::Archived => status.as_str().dimmed(),
    }
}

fn print_line(line: &Line) {
    let name = line.name.as_deref().unwrap_or("(unnamed)");
    println!("{} {}  [{}]", "Line".bold(), line.id.to_string().yellow(), status_label(line.status));
    println!("  Name: {}", name.bold());
    if let Some(reason) = &line.status_reason {
        println!("  Reason: {reason}");
    }
    if let (Some(parent), Some(origin)) = (line.parent_line_id, line.origin_snapshot_id) {
        println!("  Branched from: {} at {}", parent.to_string().cyan(), origin);
    }
    println!("  Snapshots: {}  Branches: {}", line.snapshot_count, line.branch_count);
    for (key, value) in &line.metadata {
        println!("  Meta {key}: {value}");
    }
    println!("  Updated: {}", line.updated_at.to_rfc3339().dimmed());
    println!("  State: {}", line.state.to_json());
}

async fn cmd_create(engine: &FileEngine, out: &Output, args: CreateArgs) -> anyhow::Result<()> {
    let mut new = NewLine::root();
    if let Some(name) = args.name {
        new = new.with_name(name);
    }
    if !args.set.is_empty() {
        new = new.with_state(State::from_pairs(args.set));
    }
    for (key, value) in args.metadata {
        new = new.with_metadata(key, value);
    }
    let id = engine.create_line(new, OpContext::new()).await?;
    if out.json() {
        return out.print_json(&engine.get_line(&id)?);
    }
    println!("{} Created line {}", "✓".green().bold(), id.to_string().yellow());
    Ok(())
}

fn cmd_lines(engine: &FileEngine, out: &Output) -> anyhow::Result<()> {
    let lines = engine.list_lines()?;
    if out.json() {
        return out.print_json(&lines);
    }
    if lines.is_empty() {
        println!("No lines.");
    }
    for line in &lines {
        let parent = line
            .parent_line_id
            .map(|p| format!(" <- {}", p.short_id()))
            .unwrap_or_default();
        println!(
            "{}  {:<9} {:>4} snapshots  {}{}",
            line.id.to_string().yellow(),
            status_label(line.status),
            line.snapshot_count,
            line.name.as_deref().unwrap_or("").bold(),
            parent.dimmed()
        );
    }
    Ok(())
}

fn cmd_show(engine: &FileEngine, out: &Output, args: LineArgs) -> anyhow::Result<()> {
    let line = engine.get_line(&args.line)?;
    if out.json() {
        return out.print_json(&line);
    }
    print_line(&line);
    Ok(())
}

async fn cmd_append(engine: &FileEngine, out: &Output, args: AppendArgs) -> anyhow::Result<()> {
    let mut state = engine.get_line(&args.line)?.state;
    for (key, value) in args.set {
        state.set(FieldKey::field(key), value);
    }
    for key in &args.unset {
        state.remove(&FieldKey::field(key.as_str()));
        state.remove(&FieldKey::extra(key.as_str()));
    }
    let snapshot = engine
        .append_snapshot(&args.line, &args.kind, state, OpContext::new())
        .await?;
    if out.json() {
        return out.print_json(&snapshot);
    }
    println!(
        "{} Recorded {} ({}) on {}",
        "✓".green().bold(),
        snapshot.id.to_string().yellow(),
        snapshot.step_kind,
        args.line.short_id()
    );
    Ok(())
}

fn cmd_snapshots(engine: &FileEngine, out: &Output, args: LineArgs) -> anyhow::Result<()> {
    let snapshots = engine.list_snapshots(&args.line)?;
    if out.json() {
        return out.print_json(&snapshots);
    }
    if snapshots.is_empty() {
        println!("No snapshots.");
    }
    for snapshot in &snapshots {
        println!(
            "{:>6}  {:<10} {}  {}",
            snapshot.id.to_string().yellow(),
            snapshot.step_kind,
            snapshot.created_at.to_rfc3339().dimmed(),
            snapshot.state.to_json()
        );
    }
    Ok(())
}

async fn cmd_fork(engine: &FileEngine, out: &Output, args: ForkArgs) -> anyhow::Result<()> {
    let mut request = ForkRequest::new(args.line, args.at, args.name);
    for (key, value) in args.metadata {
        request = request.with_metadata(key, value);
    }
    let branch = engine.fork(request, context(args.key)?).await?;
    let line = engine.get_line(&branch)?;
    if out.json() {
        return out.print_json(&line);
    }
    println!(
        "{} Forked {} from {} at {}",
        "✓".green().bold(),
        branch.to_string().yellow(),
        args.line.short_id(),
        line.origin_snapshot_id
            .map(|id| id.to_string())
            .unwrap_or_default()
    );
    Ok(())
}

async fn cmd_merge(engine: &FileEngine, out: &Output, args: MergeArgs) -> anyhow::Result<()> {
    let mut request = MergeRequest::new(args.target, args.source);
    if let Some(strategy) = args.strategy {
        request = request.with_strategy(strategy);
    }
    if args.allow_unrelated {
        request = request.allowing_unrelated();
    }
    let result = engine.merge(request, context(args.key)?).await?;
    if out.json() {
        return out.print_json(&result);
    }
    println!(
        "{} Merged {} into {} as {}",
        "✓".green().bold(),
        args.source.short_id().yellow(),
        args.target.short_id().yellow(),
        result.resulting_snapshot_id
    );
    println!("  Merge: {}", result.merge_id.to_string().cyan());
    if result.conflicts.is_empty() {
        println!("  Conflicts: {}", "none".green());
    }
    for conflict in &result.conflicts {
        let show = |v: &Option<lineage_types::StateValue>| {
            v.as_ref()
                .map(|v| v.to_json().to_string())
                .unwrap_or_else(|| "(absent)".into())
        };
        println!(
            "  {} {}: target {} / source {} -> {}",
            "conflict".red(),
            conflict.field.to_string().bold(),
            show(&conflict.target_value),
            show(&conflict.source_value),
            show(&conflict.resolved_value)
        );
    }
    Ok(())
}

fn cmd_history(engine: &FileEngine, out: &Output, args: LineArgs) -> anyhow::Result<()> {
    let records = engine.get_merge_history(&args.line)?;
    if out.json() {
        return out.print_json(&records);
    }
    if records.is_empty() {
        println!("No merges into {}.", args.line.short_id());
    }
    for record in &records {
        println!(
            "{}  {}  {} <- {}  {} conflicts  -> {}",
            record.timestamp.to_rfc3339().dimmed(),
            record.strategy.to_string().cyan(),
            record.target_line_id.short_id(),
            record.source_line_id.short_id().yellow(),
            record.conflicts.len(),
            record.resulting_snapshot_id
        );
    }
    Ok(())
}

async fn cmd_status(engine: &FileEngine, out: &Output, args: StatusArgs) -> anyhow::Result<()> {
    let line = engine
        .transition_status(&args.line, args.status, args.reason, OpContext::new())
        .await?;
    if out.json() {
        return out.print_json(&line);
    }
    println!(
        "{} {} is now {}",
        "✓".green().bold(),
        line.id.short_id(),
        status_label(line.status)
    );
    Ok(())
}

fn cmd_verify(engine: &FileEngine, out: &Output, args: LineArgs) -> anyhow::Result<()> {
    let replay = engine.replay_line(&args.line)?;
    let report = engine.verify_line(&args.line)?;
    if out.json() {
        return out.print_json(&json!({
            "line": report.line,
            "consistent": report.is_consistent(),
            "snapshot_count": report.snapshot_count,
            "chain": replay.chain,
            "snapshots_applied": replay.snapshots_applied,
            "state": replay.state,
            "violations": report
                .violations
                .iter()
                .map(|v| json!({ "kind": format!("{:?}", v.kind), "description": v.description }))
                .collect::<Vec<_>>(),
        }));
    }

    println!(
        "Replayed {} snapshots across {} lines",
        replay.snapshots_applied,
        replay.chain.len()
    );
    if report.is_consistent() {
        println!("{} Line {} verified", "✓".green().bold(), args.line.short_id());
        return Ok(());
    }
    for violation in &report.violations {
        println!("  {} {:?}: {}", "✗".red(), violation.kind, violation.description);
    }
    Err(anyhow!(
        "line {} failed verification with {} violation(s)",
        args.line,
        report.violations.len()
    ))
}

fn cmd_diff(engine: &FileEngine, out: &Output, args: DiffArgs) -> anyhow::Result<()> {
    let diff = engine.diff_snapshots(&args.line, args.from, args.to)?;
    if out.json() {
        return out.print_json(&diff);
    }
    if diff.is_empty() {
        println!("No changes.");
        return Ok(());
    }
    for change in &diff.changes {
        match change {
            FieldChange::Added { field, value } => {
                println!("{} {field}: {}", "+".green().bold(), value.to_json())
            }
            FieldChange::Removed { field, value } => {
                println!("{} {field}: {}", "-".red().bold(), value.to_json())
            }
            FieldChange::Modified { field, old, new } => println!(
                "{} {field}: {} -> {}",
                "~".yellow().bold(),
                old.to_json(),
                new.to_json()
            ),
        }
    }
    println!(
        "{} added, {} removed, {} modified",
        diff.additions(),
        diff.removals(),
        diff.modifications()
    );
    Ok(())
}

fn cmd_compact(engine: &FileEngine, out: &Output) -> anyhow::Result<()> {
    let store = engine.store();
    let before = store.log_len()?;
    store.compact()?;
    let after = store.log_len()?;
    if out.json() {
        return out.print_json(&json!({ "before": before, "after": after }));
    }
    println!(
        "{} Compacted {} ({before} -> {after} bytes)",
        "✓".green().bold(),
        store.path().display()
    );
    Ok(())
}
