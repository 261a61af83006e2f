use super::{json_pretty, Context, EXIT_SUCCESS};
use serde::Serialize;
use strata_core::BuildCache;
use strata_store::{
    BundleMeta, CacheRecord, Descriptor, DirSnapshotStore, ImageConfig, ImageLayout,
    ImageManifest, ImageStore, SnapshotStore,
};

#[derive(Debug, Serialize)]
struct LayerInfo {
    layer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache: Option<CacheRecord>,
    snapshot: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    snapshot_entries: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reference: Option<Descriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    manifest: Option<ImageManifest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<ImageConfig>,
}

fn store_err(e: impl std::fmt::Display) -> String {
    format!("store error: {e}")
}

fn gather(ctx: &Context, layer: &str) -> Result<LayerInfo, String> {
    let cache = BuildCache::new(ctx.state().cache_dir());
    let cache = cache
        .list()
        .map_err(|e| e.to_string())?
        .into_iter()
        .find(|r| r.layer == layer);

    let snapshots = DirSnapshotStore::new(&ctx.config.rootfs_dir);
    let snapshot = snapshots.exists(layer);
    let snapshot_entries = if snapshot {
        BundleMeta::load(&snapshots.path(layer))
            .ok()
            .map(|m| m.fingerprint.len())
    } else {
        None
    };

    let mut info = LayerInfo {
        layer: layer.to_owned(),
        cache,
        snapshot,
        snapshot_entries,
        reference: None,
        manifest: None,
        config: None,
    };
    if !ctx.config.oci_dir.exists() {
        return Ok(info);
    }
    let images = ImageLayout::open_existing(&ctx.config.oci_dir).map_err(store_err)?;
    if let Some(desc) = images.resolve_reference(layer).map_err(store_err)? {
        let manifest = images.read_manifest(&desc).map_err(store_err)?;
        info.config = Some(images.read_config(&manifest).map_err(store_err)?);
        info.manifest = Some(manifest);
        info.reference = Some(desc);
    }
    Ok(info)
}

pub fn run(ctx: &Context, layer: &str) -> Result<u8, String> {
    let info = gather(ctx, layer)?;
    if info.cache.is_none() && !info.snapshot && info.reference.is_none() {
        return Err(format!("no such layer: {layer}"));
    }

    if ctx.json {
        println!("{}", json_pretty(&info)?);
        return Ok(EXIT_SUCCESS);
    }

    println!("layer:     {}", info.layer);
    match &info.cache {
        Some(record) => println!(
            "identity:  {} (cached {})",
            record.identity, record.created_at
        ),
        None => println!("identity:  (not cached)"),
    }
    match info.snapshot_entries {
        Some(n) => println!("snapshot:  present, {n} entries"),
        None if info.snapshot => println!("snapshot:  present"),
        None => println!("snapshot:  missing"),
    }
    if let (Some(desc), Some(manifest)) = (&info.reference, &info.manifest) {
        println!("manifest:  {}", desc.digest);
        println!("layers:    {}", manifest.layers.len());
        for l in &manifest.layers {
            println!("  {} {:>10}  {}", l.digest.short(), l.size, l.media_type);
        }
    }
    if let Some(config) = &info.config {
        println!("platform:  {}/{}", config.os, config.architecture);
        if let Some(cmd) = &config.config.cmd {
            println!("cmd:       {}", cmd.join(" "));
        }
        if let Some(ep) = &config.config.entrypoint {
            println!("entrypoint: {}", ep.join(" "));
        }
        for env in &config.config.env {
            println!("env:       {env}");
        }
    }
    Ok(EXIT_SUCCESS)
}
