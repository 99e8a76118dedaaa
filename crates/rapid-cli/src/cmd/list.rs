use anyhow::{Context, Result};
use rapid_core::resolver::{RemoteCatalog, RepositoryProvider};
use rapid_core::{SyncConfig, Syncer};
use rapid_schema::Md5Digest;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ListEntry<'a> {
    repository: &'a str,
    tag: &'a str,
    digest: Md5Digest,
    display_name: &'a str,
    depends: &'a [String],
}

/// List every package of every repository under the root index.
pub async fn list(config: SyncConfig, json: bool) -> Result<()> {
    let syncer = Syncer::new(config).context("Failed to build HTTP client")?;
    let root_url = &syncer.config().root_url;
    let catalog = RemoteCatalog::load(syncer.cache().clone(), root_url)
        .await
        .with_context(|| format!("Failed to load root index {root_url}"))?;
    let repositories = catalog
        .all_repositories()
        .await
        .context("Failed to load repository indices")?;

    let entries: Vec<ListEntry<'_>> = repositories
        .iter()
        .flat_map(|(name, index)| {
            index.packages().map(move |p| ListEntry {
                repository: name.as_str(),
                tag: p.tag.as_str(),
                digest: p.digest,
                display_name: p.display_name.as_str(),
                depends: &p.depends,
            })
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("  No packages published.");
        return Ok(());
    }
    for entry in &entries {
        println!("  {:<40} {}", entry.tag, entry.display_name);
    }
    println!();
    println!("  {} package(s) in {} repositories", entries.len(), repositories.len());
    Ok(())
}
