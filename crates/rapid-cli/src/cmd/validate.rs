use std::path::Path;

use anyhow::{Result, bail};
use rapid_core::Layout;
use rapid_core::store::ContentStore;

/// Verify every blob in the pool under `writepath`.
pub fn validate(writepath: &Path, delete: bool) -> Result<()> {
    let store = ContentStore::new(Layout::new(writepath));
    let report = store.validate_pool(delete)?;

    for path in &report.broken {
        println!("  broken {}", path.display());
    }
    println!(
        "Checked {} blob(s): {} broken, {} deleted.",
        report.checked,
        report.broken.len(),
        report.deleted
    );

    if !report.is_clean() {
        bail!("{} broken blob(s) in {}", report.broken.len(), store.layout().pool_dir().display());
    }
    Ok(())
}
