use super::{core_error, json_pretty, Context, EXIT_SUCCESS};
use strata_core::BuildCache;
use strata_store::CacheEntry;

fn entry_kind(entry: &CacheEntry) -> String {
    match entry {
        CacheEntry::Packaged(desc) => format!("packaged {}", desc.digest.short()),
        CacheEntry::BuildOnly { snapshot } => format!("build-only ({snapshot})"),
    }
}

pub fn list(ctx: &Context) -> Result<u8, String> {
    let cache = BuildCache::new(ctx.state().cache_dir());
    let records = cache.list().map_err(|e| core_error(&e))?;

    if ctx.json {
        println!("{}", json_pretty(&records)?);
        return Ok(EXIT_SUCCESS);
    }
    if records.is_empty() {
        println!("no cached layers");
        return Ok(EXIT_SUCCESS);
    }
    println!("{:<20} {:<14} {:<28} CREATED", "LAYER", "IDENTITY", "ENTRY");
    for record in &records {
        println!(
            "{:<20} {:<14} {:<28} {}",
            record.layer,
            record.identity.short(),
            entry_kind(&record.entry),
            record.created_at
        );
    }
    Ok(EXIT_SUCCESS)
}

pub fn clear(ctx: &Context) -> Result<u8, String> {
    let _lock = ctx.lock()?;
    let mut cache = BuildCache::new(ctx.state().cache_dir());
    let removed = cache.clear().map_err(|e| core_error(&e))?;

    if ctx.json {
        println!("{}", json_pretty(&serde_json::json!({ "removed": removed }))?);
    } else {
        println!("removed {removed} cache record(s)");
    }
    Ok(EXIT_SUCCESS)
}

pub fn forget(ctx: &Context, layer: &str) -> Result<u8, String> {
    let _lock = ctx.lock()?;
    let mut cache = BuildCache::new(ctx.state().cache_dir());
    cache.forget(layer).map_err(|e| core_error(&e))?;
    if !ctx.json {
        println!("forgot {layer}");
    }
    Ok(EXIT_SUCCESS)
}
