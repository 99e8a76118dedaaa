use std::path::Path;

use anyhow::{Result, bail};
use rapid_core::Layout;
use rapid_core::cache::read_package_file;
use rapid_core::store::ContentStore;

/// Print one line per entry: filename, content digest, crc32, size.
pub fn dump_sdp(file: &Path) -> Result<()> {
    let index = read_package_file(file)?;
    for entry in index.entries() {
        println!(
            "{} {} {:08x} {}",
            entry.filename, entry.content_md5, entry.crc32, entry.size
        );
    }
    Ok(())
}

/// Check every blob referenced by `file`, removing the broken ones.
pub fn validate_sdp(writepath: &Path, file: &Path) -> Result<()> {
    let index = read_package_file(file)?;
    let store = ContentStore::new(Layout::new(writepath));
    let broken = store.check_package(&index, true)?;

    for entry in &broken {
        println!("  missing {} ({})", entry.filename, entry.content_md5);
    }
    if !broken.is_empty() {
        bail!("{} of {} blob(s) missing or corrupt", broken.len(), index.len());
    }
    println!("All {} blob(s) valid.", index.len());
    Ok(())
}
