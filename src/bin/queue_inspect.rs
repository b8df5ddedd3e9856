use anyhow::Context;
use rust_lanshare::download::{EntryKind, QUEUE_FILE_VERSION, store};

fn usage() -> &'static str {
    "Usage: cargo run --bin queue_inspect -- <path/to/queue.json>"
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!(usage()))?;

    // Read without `load_queue`, which deletes files of another version.
    let bytes = tokio::fs::read(&path)
        .await
        .with_context(|| format!("failed to read {path}"))?;
    let file: store::QueueFile =
        serde_json::from_slice(&bytes).with_context(|| format!("failed to parse {path}"))?;

    println!("version: {} (current {QUEUE_FILE_VERSION})", file.version);
    println!("entries: {}", file.entries.len());
    let dirs = file
        .entries
        .iter()
        .filter(|r| r.entry.kind == EntryKind::Dir)
        .count();
    let resumable = file.entries.iter().filter(|r| r.complete).count();
    let bytes: u64 = file.entries.iter().map(|r| r.entry.size).sum();
    println!("directories: {dirs}");
    println!("with progress: {resumable}");
    println!("total size: {bytes} bytes");

    for (i, rec) in file.entries.iter().enumerate() {
        let kind = match rec.entry.kind {
            EntryKind::Dir => "dir ",
            EntryKind::File => "file",
        };
        println!(
            "  {i:>4} {kind} {}{} size={} chunks={}/{} peer={}{}",
            rec.entry.path,
            rec.entry.name,
            rec.entry.size,
            rec.entry.chunk_hashes.len(),
            rec.entry.chunk_count(),
            rust_lanshare::logging::redact_hex(&rec.peer_id.to_hex()),
            if rec.complete { " resume" } else { "" }
        );
    }

    if file.version != QUEUE_FILE_VERSION {
        println!("note: the client discards this file on load (version mismatch)");
    }
    Ok(())
}
