use anyhow::{Result, bail};

use reverie_memory::{MemoryGraph, Origin, ThoughtRecord, origin_metadata};
use reverie_memory::schema::truncate_str;

const PREVIEW_CHARS: usize = 96;

pub(crate) async fn add(memory: &mut MemoryGraph, text: &str, origin: &str) -> Result<()> {
    let Some(origin) = Origin::from_label(origin) else {
        bail!("unknown origin: {origin}");
    };
    let record = memory.save_record(text, origin_metadata(origin.slug())).await?;
    println!("stored {} ({} connections)", record.id, record.connections.len());
    for connection in &record.connections {
        println!(
            "  → {}  strength={:.3}  {}",
            short(&connection.target_id),
            connection.strength,
            connection.kind
        );
    }
    Ok(())
}

pub(crate) async fn search(memory: &mut MemoryGraph, query: &str, k: usize) -> Result<()> {
    let hits = memory.search_similar(query, k.max(1), None).await?;
    if hits.is_empty() {
        println!("no matching records");
        return Ok(());
    }
    for (rank, record) in hits.iter().enumerate() {
        println!(
            "{}. [{}] relevance={:.3} {}",
            rank + 1,
            record.id_short(),
            record.relevance_score.unwrap_or_default(),
            preview(record)
        );
    }
    Ok(())
}

pub(crate) fn associated(memory: &MemoryGraph, id: &str, min_strength: Option<f64>) -> Result<()> {
    let records = memory.get_associated(id, min_strength)?;
    println!("associations of {} ({})", short(id), records.len());
    for record in &records {
        println!("  [{}] {}", record.id_short(), preview(record));
    }
    Ok(())
}

pub(crate) fn trace(memory: &MemoryGraph, id: &str, depth: usize, branch: usize) -> Result<()> {
    let records = memory.trace(id, depth, branch)?;
    if records.is_empty() {
        bail!("no record with id {id}");
    }
    for (step, record) in records.iter().enumerate() {
        println!("{step:>3}. [{}] {}", record.id_short(), preview(record));
    }
    Ok(())
}

pub(crate) fn show(memory: &MemoryGraph, id: &str) -> Result<()> {
    match memory.load_record_by_id(id)? {
        Some(record) => {
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        None => bail!("no record with id {id}"),
    }
}

pub(crate) fn stats(memory: &MemoryGraph) -> Result<()> {
    let stats = memory.stats()?;
    println!("── memory stats ─────────────────────────────────────");
    println!("  records:          {}", stats.records);
    println!("  index vectors:    {}", stats.index_size);
    println!("  index mirror:     {}", stats.mirror_len);
    println!("  edges:            {}", stats.edges);
    println!("  linked records:   {}", stats.linked_records);
    println!("  mean activation:  {:.3}", stats.mean_activation);
    match stats.newest {
        Some(at) => println!("  newest:           {}", at.to_rfc3339()),
        None => println!("  newest:           (empty)"),
    }
    if stats.index_size != stats.records {
        println!();
        println!("  index and store disagree; run `reverie memory rebuild-index`");
    }
    Ok(())
}

pub(crate) async fn decay(memory: &MemoryGraph) -> Result<()> {
    let report = memory.decay().await?;
    println!(
        "decayed {} of {} records ({} at floor, mean activation {:.3})",
        report.decayed, report.records, report.at_floor, report.mean_activation
    );
    Ok(())
}

pub(crate) async fn rebuild(memory: &mut MemoryGraph, associations: bool) -> Result<()> {
    let vectors = memory.rebuild_index().await?;
    println!("index rebuilt: {vectors} vectors");
    if associations {
        let edges = memory.rederive_associations().await?;
        println!("associations rederived: {edges} edges");
    }
    Ok(())
}

/// List concept clusters; `regroup` reclusters first.
pub(crate) async fn concepts(memory: &mut MemoryGraph, regroup: bool) -> Result<()> {
    if regroup && memory.update_concept_clusters().await?.is_none() {
        println!("too few records to cluster");
    }
    let clusters = memory.concepts()?;
    if clusters.is_empty() {
        println!("no concept clusters yet");
        return Ok(());
    }
    for cluster in &clusters {
        println!(
            "{:<12} size={:<4} themes=[{}]  {}",
            cluster.id,
            cluster.size,
            cluster.common_themes.join(", "),
            truncate_str(&cluster.central_thought, PREVIEW_CHARS)
        );
    }
    Ok(())
}

pub(crate) fn concept(memory: &MemoryGraph, id: &str) -> Result<()> {
    let records = memory.concept_records(id)?;
    if records.is_empty() {
        bail!("no concept cluster {id}");
    }
    println!("{id} ({} records)", records.len());
    for record in &records {
        println!("  [{}] {}", record.id_short(), preview(record));
    }
    Ok(())
}

fn preview(record: &ThoughtRecord) -> String {
    let text = truncate_str(&record.text, PREVIEW_CHARS);
    let ellipsis = if text.len() < record.text.len() { "…" } else { "" };
    format!(
        "({}, act={:.2}) {text}{ellipsis}",
        record.origin(),
        record.activation
    )
}

fn short(id: &str) -> &str {
    truncate_str(id, 8)
}
