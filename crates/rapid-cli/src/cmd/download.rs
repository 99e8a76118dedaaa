use anyhow::{Context, Result, bail};
use rapid_core::{PackageState, SyncConfig, Syncer};
use rapid_schema::PackageSpec;
use tracing::debug;

/// Download `specs` and their dependencies into the configured writepath.
pub async fn download(config: SyncConfig, specs: &[String]) -> Result<()> {
    let specs: Vec<PackageSpec> = specs.iter().map(String::as_str).map(PackageSpec::parse).collect();
    debug!(specs = specs.len(), mode = ?config.mode, "download requested");
    let syncer = Syncer::new(config).context("Failed to build HTTP client")?;

    let outcome = match syncer.sync(&specs).await {
        Ok(outcome) => outcome,
        Err(e) => bail!("{}: {e}", e.resource()),
    };

    for report in &outcome.packages {
        if report.state == PackageState::Done {
            println!(
                "  {:<8} {} ({} blobs, {} bytes)",
                report.state, report.tag, report.blobs_fetched, report.bytes_fetched
            );
        } else {
            println!(
                "  {:<8} {} {}",
                report.state,
                report.tag,
                report.error.as_deref().unwrap_or_default()
            );
        }
    }

    if let Some(e) = outcome.first_failure {
        bail!("{}: {e}", e.resource());
    }
    if !outcome.is_success() {
        bail!("download incomplete");
    }

    println!(
        "Synced {} package(s), {} blob(s) fetched.",
        outcome.packages.len(),
        outcome.blobs_fetched()
    );
    Ok(())
}
