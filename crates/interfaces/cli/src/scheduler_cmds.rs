use anyhow::Result;
use chrono::Utc;

use reverie_config::AppConfig;
use reverie_memory::FileOutcome;
use reverie_runtime::clock::interval_bounds;
use reverie_runtime::{AdaptiveClock, JobKind, integrity_auditor};

pub(crate) async fn open_clock(config: &AppConfig) -> Result<AdaptiveClock> {
    reverie_runtime::open_clock(config).await
}

pub(crate) async fn run_audit(config: &AppConfig, json: bool) -> Result<()> {
    let clock = open_clock(config).await?;
    let report = integrity_auditor(config, clock.state_store())?.audit().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("── integrity audit ──────────────────────────────────");
    println!("  files checked:   {}", report.files_checked);
    println!("  issues found:    {}", report.issues_found);
    println!("  repairs made:    {}", report.repairs_made);
    println!("  temp removed:    {}", report.temp_files_removed);
    if let Some(snapshot) = &report.snapshot {
        println!("  snapshot:        {}", snapshot.display());
    }
    for audit in report.files.iter().filter(|f| f.outcome != FileOutcome::Ok) {
        let status = match &audit.outcome {
            FileOutcome::Ok => "ok".to_string(),
            FileOutcome::RestoredFromBackup => "restored from backup".to_string(),
            FileOutcome::InitializedDefault => "reset to default".to_string(),
            FileOutcome::RebuildRequired => "rebuilt on next open".to_string(),
            FileOutcome::Unrepaired { reason } => format!("UNREPAIRED ({reason})"),
        };
        println!("  {:<28}  {status}", audit.file);
    }
    Ok(())
}

pub(crate) fn status(clock: &AdaptiveClock) -> Result<()> {
    let state = clock.state_store().load()?;
    let mood = clock.mood_store().load()?;
    let now = Utc::now();

    println!("── scheduler ────────────────────────────────────────");
    println!("  mood:            {} ({:.2})", mood.mood, mood.intensity);
    println!("  external input:  {}", if state.recent_external_input { "pending" } else { "none" });
    if let Some(seed) = &state.next_chain_seed {
        println!("  chain seed:      {seed}");
    }
    println!();
    for kind in JobKind::ALL {
        let (low, high) = interval_bounds(clock.config(), &state, &mood, kind);
        let last = state.last_runs.get(kind.as_str());
        let since = last.map(|at| now.signed_duration_since(*at).num_seconds());
        let due = match since {
            None => "due",
            Some(secs) if secs as f64 >= high => "due",
            Some(secs) if secs as f64 >= low => "window",
            Some(_) => "waiting",
        };
        println!(
            "  {:<16} {:<8} interval {:>6.0}–{:<6.0}s  last {}",
            kind.as_str(),
            due,
            low,
            high,
            since.map(|s| format!("{s}s ago")).unwrap_or_else(|| "never".to_string()),
        );
    }
    Ok(())
}

pub(crate) async fn mark(clock: &AdaptiveClock, kind: &str) -> Result<()> {
    let kind: JobKind = kind.parse()?;
    clock.mark_executed(kind).await?;
    println!("{kind} marked as executed");
    Ok(())
}

pub(crate) async fn retune(clock: &AdaptiveClock) -> Result<()> {
    let intervals = clock.retune_intervals().await?;
    for (kind, secs) in &intervals {
        println!("  {kind:<16} {secs:>8.1}s");
    }
    Ok(())
}

pub(crate) fn mood_show(clock: &AdaptiveClock) -> Result<()> {
    let mood = clock.mood_store().load()?;
    println!("{}", serde_json::to_string_pretty(&mood)?);
    Ok(())
}

pub(crate) async fn mood_set(clock: &AdaptiveClock, mood: &str, intensity: f64) -> Result<()> {
    let before = clock.mood_store().load()?;
    let after = clock.mood_store().set(mood, intensity).await?;
    println!(
        "mood {} ({:.2}) → {} ({:.2})",
        before.mood, before.intensity, after.mood, after.intensity
    );
    Ok(())
}
