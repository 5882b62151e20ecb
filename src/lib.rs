//! groundtruth: progressive discovery of an external system's real state.
//!
//! Discovery climbs a ladder of levels, from "can I reach it at all" up to
//! deep inspection. Each level runs only when the previous one was trusted
//! enough, is scored for confidence, and is cached with a level-specific TTL.
//! Any ladder result can be frozen into an immutable snapshot, and two
//! snapshots of the same target diff into a change-set.
//!
//! # Crate Structure
//!
//! - [`core`]: the engine (ladder, confidence, cache, snapshots, differ) and
//!   its store, config, locking and audit plumbing
//! - [`plugins`]: probes for filesystem, forge and database targets
//!
//! # Example
//!
//! ```bash
//! groundtruth discover --target fs:. --level 3
//! groundtruth discover --target fs:. --snapshot
//! groundtruth snapshot list --target fs:.
//! groundtruth snapshot diff <base-id> <target-id>
//! ```

pub mod core;
pub mod plugins;

mod cli;

use clap::Parser;
use serde_json::json;

use cli::{CacheCommand, Cli, Command, DiscoverCli, FormatArg, SnapshotCommand};
use crate::core::cache::{CacheStore, FileCacheStore};
use crate::core::config::{self, Config};
use crate::core::diff;
use crate::core::error::DiscoveryError;
use crate::core::ladder::DiscoveryLadder;
use crate::core::lock;
use crate::core::model::{Target, TargetKind};
use crate::core::output;
use crate::core::snapshot::SnapshotManager;
use crate::core::store::{self, Store};
use crate::core::time;
use crate::core::trace::{self, DiscoveryEvent};

/// Process exit code for a run that produced no trusted level.
pub const EXIT_NO_CONFIDENCE: u8 = 1;

struct Context {
    store: Store,
    config: Config,
    scope: String,
}

impl Context {
    fn session(&self, target: &Target) -> String {
        store::session_id(target, &self.scope)
    }
}

/// Parse arguments, run one command, and return the process exit code.
pub fn run() -> Result<u8, DiscoveryError> {
    let cli = Cli::parse();
    let store = Store::resolve(cli.store.as_deref())?;
    let config = config::load_config(&store.root)?;
    let scope = cli.session.unwrap_or_else(store::session_scope_from_env);
    let ctx = Context {
        store,
        config,
        scope,
    };
    tracing::debug!(store = %ctx.store.root.display(), scope = %ctx.scope, "store resolved");

    match cli.command {
        Command::Discover(args) => discover(&ctx, &args),
        Command::Snapshot(args) => snapshot(&ctx, args.command),
        Command::Cache(args) => match args.command {
            CacheCommand::Clear { target } => cache_clear(&ctx, &target),
        },
        Command::Levels => levels(&ctx),
        Command::Events { limit } => {
            let events = trace::last_events(&ctx.store, limit)?;
            emit(time::command_envelope(
                "events",
                "ok",
                json!({ "events": events }),
            ))?;
            Ok(0)
        }
    }
}

fn emit(value: serde_json::Value) -> Result<(), DiscoveryError> {
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn exit_for(confidence: f64) -> u8 {
    if confidence > 0.0 { 0 } else { EXIT_NO_CONFIDENCE }
}

fn status_for(confidence: f64) -> &'static str {
    if confidence > 0.0 { "ok" } else { "no_confidence" }
}

fn discover(ctx: &Context, args: &DiscoverCli) -> Result<u8, DiscoveryError> {
    let target: Target = args.target.parse()?;
    let probe = plugins::probe_for(target.kind, &ctx.config);
    ctx.store.ensure()?;

    lock::with_session_lock(&ctx.store, &ctx.session(&target), || {
        let mut cache = FileCacheStore::new(&ctx.store, ctx.scope.clone());
        if args.fresh {
            invalidate(ctx, &mut cache, &target)?;
        }
        let mut ladder =
            DiscoveryLadder::new(probe.as_ref(), &mut cache, &ctx.config).with_audit(&ctx.store);
        let level = args.level.unwrap_or_else(|| ladder.max_level());

        if args.snapshot {
            let manager = SnapshotManager::new(&ctx.store);
            let (snapshot, changes) = manager.compare_with_latest(&mut ladder, &target, level)?;
            let confidence = snapshot.statistics.overall_confidence;
            if args.format.is_text() {
                println!("{}", output::render_snapshot(&snapshot));
                if let Some(changes) = &changes {
                    println!("{}", output::render_changes(changes));
                }
            } else {
                emit(time::command_envelope(
                    "discover",
                    status_for(confidence),
                    json!({ "snapshot": snapshot, "changes": changes }),
                ))?;
            }
            return Ok(exit_for(confidence));
        }

        let result = ladder.discover(&target, level)?;
        if args.format.is_text() {
            println!("{}", output::render_ladder(&result, probe.as_ref()));
        } else {
            emit(time::command_envelope(
                "discover",
                status_for(result.overall_confidence),
                json!({ "result": result }),
            ))?;
        }
        Ok(exit_for(result.overall_confidence))
    })
}

fn invalidate(
    ctx: &Context,
    cache: &mut dyn CacheStore,
    target: &Target,
) -> Result<usize, DiscoveryError> {
    let removed = cache.invalidate_all(target)?;
    tracing::info!(target = %target, removed, "cache invalidated");
    trace::record(
        &ctx.store,
        DiscoveryEvent::new(
            "cache.invalidate",
            &target.to_string(),
            "ok",
            json!({ "removed": removed }),
        ),
    );
    Ok(removed)
}

fn cache_clear(ctx: &Context, raw_target: &str) -> Result<u8, DiscoveryError> {
    let target: Target = raw_target.parse()?;
    ctx.store.ensure()?;
    let removed = lock::with_session_lock(&ctx.store, &ctx.session(&target), || {
        let mut cache = FileCacheStore::new(&ctx.store, ctx.scope.clone());
        invalidate(ctx, &mut cache, &target)
    })?;
    emit(time::command_envelope(
        "cache.clear",
        "ok",
        json!({ "target": target.to_string(), "removed": removed }),
    ))?;
    Ok(0)
}

fn print_or_emit(
    format: &FormatArg,
    cmd: &str,
    text: impl FnOnce() -> String,
    payload: serde_json::Value,
) -> Result<(), DiscoveryError> {
    if format.is_text() {
        println!("{}", text());
        Ok(())
    } else {
        emit(time::command_envelope(cmd, "ok", payload))
    }
}

fn snapshot(ctx: &Context, command: SnapshotCommand) -> Result<u8, DiscoveryError> {
    let manager = SnapshotManager::new(&ctx.store);
    match command {
        SnapshotCommand::Capture {
            target,
            level,
            format,
        } => {
            let target: Target = target.parse()?;
            let probe = plugins::probe_for(target.kind, &ctx.config);
            ctx.store.ensure()?;
            let snapshot = lock::with_session_lock(&ctx.store, &ctx.session(&target), || {
                let mut cache = FileCacheStore::new(&ctx.store, ctx.scope.clone());
                let mut ladder = DiscoveryLadder::new(probe.as_ref(), &mut cache, &ctx.config)
                    .with_audit(&ctx.store);
                let level = level.unwrap_or_else(|| ladder.max_level());
                manager.capture(&mut ladder, &target, level)
            })?;
            let confidence = snapshot.statistics.overall_confidence;
            if format.is_text() {
                println!("{}", output::render_snapshot(&snapshot));
            } else {
                emit(time::command_envelope(
                    "snapshot.capture",
                    status_for(confidence),
                    json!({ "snapshot": snapshot }),
                ))?;
            }
            Ok(exit_for(confidence))
        }
        SnapshotCommand::List { target, format } => {
            let target = target.map(|t| t.parse::<Target>()).transpose()?;
            let rows = manager.list(target.as_ref())?;
            print_or_emit(
                &format,
                "snapshot.list",
                || output::render_snapshot_list(&rows),
                json!({ "snapshots": rows }),
            )?;
            Ok(0)
        }
        SnapshotCommand::Show { id, format } => {
            let snapshot = manager.load(&id)?;
            print_or_emit(
                &format,
                "snapshot.show",
                || output::render_snapshot(&snapshot),
                json!({ "snapshot": snapshot }),
            )?;
            Ok(0)
        }
        SnapshotCommand::Diff {
            base,
            target,
            format,
        } => {
            let base = manager.load(&base)?;
            let target = manager.load(&target)?;
            let changes = diff::diff(&base, &target)?;
            print_or_emit(
                &format,
                "snapshot.diff",
                || output::render_changes(&changes),
                json!({ "changes": changes }),
            )?;
            Ok(0)
        }
        SnapshotCommand::Prune { id } => {
            let pruned = manager.prune(&id)?;
            emit(time::command_envelope(
                "snapshot.prune",
                "ok",
                json!({ "snapshot_id": pruned.snapshot_id, "target": pruned.target.to_string() }),
            ))?;
            Ok(0)
        }
        SnapshotCommand::Latest { target, format } => {
            let target: Target = target.parse()?;
            let snapshot = manager
                .latest(&target)?
                .ok_or_else(|| DiscoveryError::NotFound(format!("no snapshot for {}", target)))?;
            print_or_emit(
                &format,
                "snapshot.latest",
                || output::render_snapshot(&snapshot),
                json!({ "snapshot": snapshot }),
            )?;
            Ok(0)
        }
    }
}

fn levels(ctx: &Context) -> Result<u8, DiscoveryError> {
    let probes: serde_json::Map<String, serde_json::Value> =
        [TargetKind::Filesystem, TargetKind::Forge, TargetKind::Database]
            .into_iter()
            .map(|kind| {
                let probe = plugins::probe_for(kind, &ctx.config);
                let names: Vec<&str> = (1..=probe.max_level())
                    .map(|level| probe.level_name(level))
                    .collect();
                (kind.as_str().to_string(), json!(names))
            })
            .collect();
    emit(time::command_envelope(
        "levels",
        "ok",
        json!({
            "levels": ctx.config.levels,
            "confidence": ctx.config.confidence,
            "probes": probes,
        }),
    ))?;
    Ok(0)
}
