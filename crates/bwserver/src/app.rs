//! Process runners.
//!
//! Each runner binds a Nub, builds the process state, forwards signals as
//! interrupts and drives the dispatch loop until the process stops.

use anyhow::Context;
use std::path::Path;
use tracing::{info, warn};

use baseappmgr::{BaseAppMgr, RegistrySnapshot};
use mercury::{Address, Nub};

use crate::config::AppConfig;
use crate::signals::forward_signals;
use crate::worker::{BaseAppWorker, WorkerConfig};

/// Reads a registry snapshot, if the file exists.
pub async fn load_snapshot(path: &Path) -> anyhow::Result<Option<RegistrySnapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Reading snapshot {}", path.display()))?;
    Ok(Some(RegistrySnapshot::from_bytes(&bytes)?))
}

pub async fn save_snapshot(path: &Path, snapshot: &RegistrySnapshot) -> anyhow::Result<()> {
    tokio::fs::write(path, snapshot.to_bytes()?)
        .await
        .with_context(|| format!("Writing snapshot {}", path.display()))
}

/// Runs the BaseApp manager until it shuts down.
pub async fn run_base_app_mgr(config: &AppConfig) -> anyhow::Result<()> {
    let mut nub = Nub::bind(config.to_nub_config()?).context("Binding manager socket")?;
    let mut mgr = BaseAppMgr::new(config.to_manager_config());

    let snapshot_path = config.snapshot_path();
    if let Some(path) = snapshot_path.as_deref() {
        match load_snapshot(path).await {
            Ok(Some(snapshot)) => {
                info!("♻️ Restoring registry from {}", path.display());
                mgr.restore(&mut nub, snapshot);
            }
            Ok(None) => {}
            Err(e) => warn!("Ignoring unreadable snapshot: {:#}", e),
        }
    }

    mgr.init(&mut nub)?;
    let signals = forward_signals(nub.interrupt_handle());

    info!("✅ BaseAppMgr is now running on {}", nub.local_addr());
    info!("🛑 Press Ctrl+C once for a controlled shutdown, twice to stop at once");
    nub.run(&mut mgr, &BaseAppMgr::interface_table()).await?;
    signals.abort();

    if let Some(path) = snapshot_path.as_deref() {
        save_snapshot(path, &mgr.snapshot()).await?;
        info!("💾 Registry saved to {}", path.display());
    }

    let stats = nub.stats();
    info!(
        "📊 Final statistics: {} datagrams in, {} out, {} protocol errors",
        stats.datagrams_received, stats.datagrams_sent, stats.protocol_errors
    );
    Ok(())
}

/// Runs a BaseApp until it leaves or is shut down.
pub async fn run_base_app(config: &AppConfig, manager: Option<Address>, backup: bool) -> anyhow::Result<()> {
    let mut nub = Nub::bind(config.to_nub_config()?).context("Binding BaseApp socket")?;

    let external_addr = config
        .baseapp
        .external_address
        .as_deref()
        .map(str::parse::<Address>)
        .transpose()?;
    let configured_manager = config
        .baseapp
        .manager_address
        .as_deref()
        .map(str::parse::<Address>)
        .transpose()?;

    let worker_config = WorkerConfig {
        external_addr,
        manager: manager.or(configured_manager),
        backup,
        join: config.to_join_config(),
        load_report_interval: tokio::time::Duration::from_millis(config.baseapp.load_report_interval_ms),
        capacity: config.baseapp.capacity,
        ..Default::default()
    };
    let mut worker = BaseAppWorker::new(worker_config);
    worker.start(&mut nub)?;
    let signals = forward_signals(nub.interrupt_handle());

    info!(
        "✅ {} running on {}",
        if backup { "Backup BaseApp" } else { "BaseApp" },
        nub.local_addr()
    );
    nub.run(&mut worker, &BaseAppWorker::interface_table()).await?;
    signals.abort();

    info!(
        "👋 BaseApp {:?} stopped with {} entities, {} restored, backed up by {:?}, backing up {}",
        worker.id(),
        worker.num_entities(),
        worker.restored().len(),
        worker.backup(),
        worker.backing_up().len()
    );
    if let Some(addr) = worker.create_base_addr() {
        info!("Last creation target was {}", addr);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mercury::NubConfig;

    #[tokio::test]
    async fn test_snapshot_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("baseappmgr.snap");
        assert!(load_snapshot(&path).await.unwrap().is_none());

        let mut nub = Nub::new("10.0.0.100:20013".parse().unwrap(), NubConfig::default());
        let mut mgr = BaseAppMgr::new(Default::default());
        mgr.add(&mut nub, "10.0.0.1:1".parse().unwrap(), "1.2.3.4:1".parse().unwrap())
            .unwrap();

        save_snapshot(&path, &mgr.snapshot()).await.unwrap();
        let loaded = load_snapshot(&path).await.unwrap().unwrap();
        assert_eq!(loaded, mgr.snapshot());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("baseappmgr.snap");
        tokio::fs::write(&path, b"\x01\x02").await.unwrap();
        assert!(load_snapshot(&path).await.is_err());
    }
}
