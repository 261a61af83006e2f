use super::{core_error, json_pretty, Context, EXIT_SUCCESS};
use strata_core::{gc_roots, BuildCache};
use strata_store::{DirSnapshotStore, GarbageCollector, GcReport, ImageLayout};

pub fn run(ctx: &Context, dry_run: bool) -> Result<u8, String> {
    let _lock = ctx.lock()?;
    let report = if ctx.config.oci_dir.exists() {
        let images = ImageLayout::open_existing(&ctx.config.oci_dir)
            .map_err(|e| format!("store error: {e}"))?;
        let snapshots = DirSnapshotStore::new(&ctx.config.rootfs_dir);
        let cache = BuildCache::new(ctx.state().cache_dir());
        let roots = gc_roots(&snapshots, &cache).map_err(|e| core_error(&e))?;
        GarbageCollector::new(images.layout().clone())
            .collect(&roots, dry_run)
            .map_err(|e| format!("store error: {e}"))?
    } else {
        GcReport::default()
    };

    if ctx.json {
        let payload = serde_json::json!({
            "dry_run": dry_run,
            "orphaned_blobs": report.orphaned_blobs,
            "removed_blobs": report.removed_blobs,
            "removed_staging": report.removed_staging,
        });
        println!("{}", json_pretty(&payload)?);
    } else if dry_run {
        println!("would remove {} blob(s):", report.orphaned_blobs.len());
        for digest in &report.orphaned_blobs {
            println!("  {digest}");
        }
    } else {
        println!(
            "removed {} blob(s), {} staging entr{}",
            report.removed_blobs,
            report.removed_staging,
            if report.removed_staging == 1 { "y" } else { "ies" }
        );
    }
    Ok(EXIT_SUCCESS)
}
