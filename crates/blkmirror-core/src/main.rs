#![warn(missing_docs)]

//! blkmirror demo: two in-memory nodes replicate, lose their link, keep
//! writing and resync after reconnecting.

use std::path::PathBuf;

use anyhow::{bail, Result};
use blkmirror_core::sim::{sim_config, SimCluster};
use blkmirror_core::types::{ConnectionId, PeerDeviceId, VolumeId};
use blkmirror_core::ResourceConfig;
use blkmirror_meta::Placement;
use bytes::Bytes;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEMO_SECTORS: u64 = 1 << 14;

fn load_config() -> Result<Option<ResourceConfig>> {
    let Some(path) = std::env::args().nth(1).map(PathBuf::from) else {
        return Ok(None);
    };
    if !path.exists() {
        tracing::warn!("Config file not found, using defaults: {}", path.display());
        return Ok(None);
    }
    Ok(Some(ResourceConfig::from_file(&path)?))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    tracing::info!("blkmirror demo starting...");

    let base = load_config()?;
    let cluster = SimCluster::with_config(2, |id| match &base {
        Some(cfg) => {
            let mut cfg = cfg.clone();
            cfg.node_id = id;
            cfg.peers = vec![1 - id];
            for d in &mut cfg.devices {
                d.placement = Placement::External { start_sector: 0 };
            }
            cfg
        }
        None => sim_config(id, 2, DEMO_SECTORS),
    })?;

    cluster.connect_all()?;
    cluster.promote(0)?;
    for i in 0..16u64 {
        let mut h = cluster.write(0, i * 8, Bytes::from(vec![i as u8; 4096])).await?;
        if let Some(Err(e)) = h.try_result() {
            bail!("write {} failed: {}", i, e);
        }
    }
    cluster.flush();

    cluster.cut(0, 1);
    for i in 0..64u64 {
        cluster.write(0, 1024 + i * 8, Bytes::from(vec![0xa5; 4096])).await?;
    }
    cluster.flush();
    let pd = PeerDeviceId::new(ConnectionId(1), VolumeId(0));
    tracing::info!(out_of_sync = cluster.node(0).out_of_sync(pd)?, "writes while disconnected");

    cluster.heal(0, 1)?;
    if !cluster.run_resync(1000) {
        bail!("resync did not finish");
    }
    let same = cluster.contents(0, 0, 2048) == cluster.contents(1, 0, 2048);
    tracing::info!(in_sync = same, "resync finished");

    println!("{}", serde_json::to_string_pretty(&cluster.node(0).status())?);
    if !same {
        bail!("nodes differ after resync");
    }
    Ok(())
}
