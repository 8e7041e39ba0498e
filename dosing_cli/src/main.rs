use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use dosing_core::*;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "dosing")]
#[command(about = "Clinical event log for a closed-loop dosing controller", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Read configuration from this file instead of the default path
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Temporary glucose targets
    #[command(subcommand)]
    Target(TargetCommand),

    /// Reusable temp target presets
    #[command(subcommand)]
    Preset(PresetCommand),

    /// Carbohydrate entries
    #[command(subcommand)]
    Carbs(CarbsCommand),

    /// Uploader queries
    #[command(subcommand)]
    Sync(SyncCommand),

    /// Export a collection as CSV
    Export {
        #[arg(long, value_enum)]
        kind: ExportKind,

        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Subcommand)]
enum TargetCommand {
    /// Enter a temporary target
    Add {
        #[arg(long)]
        low: f64,

        /// Defaults to --low
        #[arg(long)]
        high: Option<f64>,

        /// Minutes
        #[arg(long)]
        duration: f64,

        /// Units of --low/--high (mgdl, mmol); defaults to the configured units
        #[arg(long)]
        units: Option<String>,

        #[arg(long)]
        name: Option<String>,

        /// Start time (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Cancel the active target
    Cancel,

    /// Show the active target
    Current,

    /// List targets from the retention window
    List,
}

#[derive(Subcommand)]
enum PresetCommand {
    /// Save a new preset
    Add {
        #[arg(long)]
        name: String,

        #[arg(long)]
        low: f64,

        #[arg(long)]
        high: Option<f64>,

        /// Minutes
        #[arg(long)]
        duration: f64,

        #[arg(long)]
        units: Option<String>,
    },

    /// List presets
    List,

    /// Start a preset now
    Enact { id: String },

    /// Delete a preset
    Remove { id: String },
}

#[derive(Subcommand)]
enum CarbsCommand {
    /// Record carbs
    Add {
        #[arg(long)]
        grams: f64,

        /// Time eaten (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// List carb entries from the retention window
    List,
}

#[derive(Subcommand)]
enum SyncCommand {
    /// Timestamp uploads should resume from
    Cursor,

    /// Manual temp targets not yet uploaded
    Pending,

    /// Acknowledge every pending temp target as uploaded
    MarkUploaded,

    /// Forget upload history
    Reset,
}

#[derive(Clone, Copy, ValueEnum)]
enum ExportKind {
    TempTargets,
    Carbs,
}

/// Logs every collection change the process causes
struct ChangeLogger;

impl Observer<TempTarget> for ChangeLogger {
    fn on_collection_changed(&self, kind: CollectionKind, events: &[TempTarget]) {
        tracing::info!("{} changed, {} visible", kind, events.len());
    }
}

impl Observer<CarbsEntry> for ChangeLogger {
    fn on_collection_changed(&self, kind: CollectionKind, events: &[CarbsEntry]) {
        tracing::info!("{} changed, {} visible", kind, events.len());
    }
}

struct Output {
    json: bool,
}

impl Output {
    fn print<T: Serialize>(&self, value: &T, human: impl FnOnce()) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            human();
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    dosing_core::logging::init();

    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let data_dir = cli.data_dir.clone().unwrap_or_else(|| config.data.data_dir.clone());

    let storages = Storages::open_in(&data_dir, &config)?;
    let logger = Arc::new(ChangeLogger);
    storages.temp_targets.subscribe(&logger);
    storages.presets.subscribe(&logger);
    storages.carbs.subscribe(&logger);

    let out = Output { json: cli.json };
    let result = match cli.command {
        Commands::Target(command) => cmd_target(&storages, &config, &out, command),
        Commands::Preset(command) => cmd_preset(&storages, &config, &out, command),
        Commands::Carbs(command) => cmd_carbs(&storages, &out, command),
        Commands::Sync(command) => cmd_sync(&storages, &out, command),
        Commands::Export { kind, out: path } => cmd_export(&storages, kind, path),
    };

    // Deliver queued notifications before exiting
    storages.broadcaster.flush();
    result
}

fn resolve_units(units: Option<String>, config: &Config) -> Result<GlucoseUnits> {
    match units {
        Some(units) => units.parse(),
        None => Ok(config.units.glucose),
    }
}

/// Convert producer input to a stored target: mg/dL, high >= low
fn build_target(
    name: Option<String>,
    low: f64,
    high: Option<f64>,
    duration: f64,
    units: GlucoseUnits,
    at: DateTime<Utc>,
) -> Result<TempTarget> {
    let valid_bound = |b: f64| b.is_finite() && b > 0.0;
    if !valid_bound(low) || high.is_some_and(|h| !valid_bound(h)) {
        return Err(Error::Other("Target bounds must be positive".into()));
    }
    if duration.is_nan() || duration <= 0.0 {
        return Err(Error::Other(
            "Duration must be positive; use `target cancel` to end a target".into(),
        ));
    }
    if duration > TempTarget::MAX_DURATION_MINUTES {
        return Err(Error::Other(format!(
            "Duration must be at most {} minutes",
            TempTarget::MAX_DURATION_MINUTES
        )));
    }
    let high = high.unwrap_or(low);
    Ok(TempTarget::manual(
        name,
        units.to_mgdl(low),
        units.to_mgdl(high),
        duration,
        at,
    ))
}

fn cmd_target(storages: &Storages, config: &Config, out: &Output, command: TargetCommand) -> Result<()> {
    match command {
        TargetCommand::Add {
            low,
            high,
            duration,
            units,
            name,
            at,
        } => {
            let units = resolve_units(units, config)?;
            let target = build_target(name, low, high, duration, units, at.unwrap_or_else(Utc::now))?;
            storages.temp_targets.append(vec![target.clone()])?;
            out.print(&target, || {
                println!("✓ Temp target set");
                println!("  {}", describe_target(&target));
            })
        }
        TargetCommand::Cancel => {
            let cancel = TempTarget::cancel(Utc::now());
            storages.temp_targets.append(vec![cancel.clone()])?;
            out.print(&cancel, || println!("✓ Temp target cancelled"))
        }
        TargetCommand::Current => {
            let current = storages.temp_targets.current();
            out.print(&current, || match current {
                Some(ref target) => {
                    println!("{}", describe_target(target));
                    println!("  until {}", target.ends_at().to_rfc3339());
                }
                None => println!("No active temp target"),
            })
        }
        TargetCommand::List => {
            let targets = storages.temp_targets.recent();
            out.print(&targets, || {
                if targets.is_empty() {
                    println!("No temp targets in the last {}h", config.retention.live_window_hours);
                }
                for target in &targets {
                    println!("{}", describe_target(target));
                }
            })
        }
    }
}

fn cmd_preset(storages: &Storages, config: &Config, out: &Output, command: PresetCommand) -> Result<()> {
    match command {
        PresetCommand::Add {
            name,
            low,
            high,
            duration,
            units,
        } => {
            let units = resolve_units(units, config)?;
            let preset = build_target(Some(name), low, high, duration, units, Utc::now())?;
            storages.presets.add(preset.clone())?;
            out.print(&preset, || {
                println!("✓ Preset saved");
                println!("  {}  {}", preset.id, preset.display_name());
            })
        }
        PresetCommand::List => {
            let presets = storages.presets.load();
            out.print(&presets, || {
                if presets.is_empty() {
                    println!("No presets");
                }
                for preset in &presets {
                    println!(
                        "{}  {} {}-{} mg/dL for {} min",
                        preset.id,
                        preset.display_name(),
                        format_bound(preset.target_bottom),
                        format_bound(preset.target_top),
                        preset.duration
                    );
                }
            })
        }
        PresetCommand::Enact { id } => {
            let enacted = storages.presets.enact(&id)?;
            out.print(&enacted, || match enacted {
                Some(ref target) => {
                    println!("✓ Preset enacted");
                    println!("  {}", describe_target(target));
                }
                None => println!("No preset with id {} - nothing enacted", id),
            })
        }
        PresetCommand::Remove { id } => {
            let removed = storages.presets.remove(&id)?;
            out.print(&removed, || {
                if removed {
                    println!("✓ Preset removed");
                } else {
                    println!("No preset with id {}", id);
                }
            })
        }
    }
}

fn cmd_carbs(storages: &Storages, out: &Output, command: CarbsCommand) -> Result<()> {
    match command {
        CarbsCommand::Add { grams, at } => {
            if grams.is_nan() || grams <= 0.0 {
                return out.print(&Option::<CarbsEntry>::None, || println!("Nothing to record"));
            }
            let entry = CarbsEntry::manual(grams, at.unwrap_or_else(Utc::now));
            storages.carbs.append(vec![entry.clone()])?;
            out.print(&entry, || println!("✓ Recorded {} g carbs", entry.carbs))
        }
        CarbsCommand::List => {
            let entries = storages.carbs.recent();
            out.print(&entries, || {
                if entries.is_empty() {
                    println!("No carb entries");
                }
                for entry in &entries {
                    println!("{}  {} g", entry.created_at.to_rfc3339(), entry.carbs);
                }
            })
        }
    }
}

fn cmd_sync(storages: &Storages, out: &Output, command: SyncCommand) -> Result<()> {
    match command {
        SyncCommand::Cursor => {
            let cursor = storages.temp_targets.sync_cursor();
            out.print(&cursor, || println!("{}", cursor.to_rfc3339()))
        }
        SyncCommand::Pending => {
            let pending = storages.uploads.unsynced_manual_events();
            out.print(&pending, || {
                println!("{} temp targets pending upload", pending.len());
                for target in &pending {
                    println!("  {}", describe_target(target));
                }
            })
        }
        SyncCommand::MarkUploaded => {
            let pending = storages.uploads.unsynced_manual_events();
            let added = storages.uploads.mark_uploaded(pending)?;
            out.print(&added, || println!("✓ Marked {} temp targets as uploaded", added))
        }
        SyncCommand::Reset => {
            storages.uploads.reset()?;
            out.print(&true, || println!("✓ Upload history cleared"))
        }
    }
}

fn cmd_export(storages: &Storages, kind: ExportKind, path: PathBuf) -> Result<()> {
    let count = match kind {
        ExportKind::TempTargets => {
            dosing_core::export::export_temp_targets(&storages.temp_targets.recent(), &path)?
        }
        ExportKind::Carbs => dosing_core::export::export_carbs(&storages.carbs.recent(), &path)?,
    };
    println!("✓ Exported {} rows to {}", count, path.display());
    Ok(())
}

fn format_bound(bound: Option<f64>) -> String {
    bound.map(|b| format!("{:.0}", b)).unwrap_or_else(|| "-".into())
}

fn describe_target(target: &TempTarget) -> String {
    if target.is_cancel() {
        return format!("{}  {}", target.created_at.to_rfc3339(), target.display_name());
    }
    format!(
        "{}  {} {}-{} mg/dL for {} min",
        target.created_at.to_rfc3339(),
        target.display_name(),
        format_bound(target.target_bottom),
        format_bound(target.target_top),
        target.duration
    )
}
