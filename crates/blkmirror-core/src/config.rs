//! Resource configuration.
//!
//! Loadable from TOML or JSON; every field has a default so a partial file is
//! enough.

use std::path::Path;

use blkmirror_meta::{DigestAlgorithm, Placement, DEFAULT_AL_SIZE_4K};
use serde::{Deserialize, Serialize};

use crate::activity_log::AL_MAX_EXTENTS;
use crate::error::{ReplError, ReplResult};
use crate::types::{Protocol, WriteOrdering, BM_SECT_PER_BIT, MAX_BIO_SIZE, MAX_PEERS};

/// Highest protocol version this implementation speaks.
pub const PRO_VERSION_MAX: u32 = 121;
/// Lowest protocol version accepted from a peer.
pub const PRO_VERSION_MIN: u32 = 86;

/// What to do when a connection is congested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnCongestion {
    /// Keep replicating; writers wait.
    #[default]
    Block,
    /// Switch to Ahead and only record writes out-of-sync.
    PullAhead,
}

/// Network settings, per connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Replication protocol.
    pub protocol: Protocol,
    /// Highest protocol version offered in the handshake.
    pub pro_version_max: u32,
    /// Interval between keep-alive pings.
    pub ping_interval_ms: u64,
    /// Time without any inbound packet after which the link is declared dead.
    pub ping_timeout_ms: u64,
    /// Congestion policy.
    pub on_congestion: OnCongestion,
    /// Sectors in flight above which the connection counts as congested.
    pub cong_fill_sectors: u64,
    /// Use checksum-based resync.
    pub csums: bool,
    /// Digest used for checksum resync and online verify.
    pub digest: DigestAlgorithm,
    /// Largest replication request.
    pub max_bio_size: u64,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::C,
            pro_version_max: PRO_VERSION_MAX,
            ping_interval_ms: 10_000,
            ping_timeout_ms: 5_000,
            on_congestion: OnCongestion::Block,
            cong_fill_sectors: 0,
            csums: false,
            digest: DigestAlgorithm::Blake3,
            max_bio_size: MAX_BIO_SIZE,
        }
    }
}

/// Resync rate control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResyncConfig {
    /// Fixed resync rate in KiB/s, used when `c_plan_ahead` is 0 and as the
    /// initial rate of the dynamic controller.
    pub resync_rate_kib: u64,
    /// Planning horizon of the dynamic controller in ticks; 0 disables it.
    pub c_plan_ahead: u32,
    /// Sectors the controller tries to keep in flight; 0 uses the delay target.
    pub c_fill_target: u64,
    /// Target delay in tenths of a second, used when `c_fill_target` is 0.
    pub c_delay_target: u32,
    /// Upper bound in KiB/s.
    pub c_max_rate_kib: u64,
    /// Resync is slowed down to this rate (KiB/s) while application I/O is
    /// active; 0 never slows down.
    pub c_min_rate_kib: u64,
    /// Controller tick.
    pub tick_ms: u64,
    /// Size of each peer's resync extent cache.
    pub resync_extents: usize,
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            resync_rate_kib: 250,
            c_plan_ahead: 20,
            c_fill_target: 100,
            c_delay_target: 10,
            c_max_rate_kib: 102_400,
            c_min_rate_kib: 250,
            tick_ms: 100,
            resync_extents: 61,
        }
    }
}

/// What a local I/O error does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnIoError {
    /// Downgrade the disk to Failed and detach once local I/O drained.
    #[default]
    Detach,
    /// Publish the error and downgrade the disk to Inconsistent. The disk
    /// stays attached.
    PassOn,
}

/// Backing disk settings, shared by all volumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    /// Number of activity log extents.
    pub al_extents: usize,
    /// Activity log transaction blocks on disk.
    pub al_size_4k: u32,
    /// Write activity log transactions (off means every write dirties the
    /// bitmap directly).
    pub al_updates: bool,
    /// Local error policy.
    pub on_io_error: OnIoError,
    /// Upper bound of in-flight application requests per volume.
    pub max_buffers: u32,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            al_extents: 1237,
            al_size_4k: DEFAULT_AL_SIZE_4K,
            al_updates: true,
            on_io_error: OnIoError::Detach,
            max_buffers: 2048,
        }
    }
}

/// One volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Volume number.
    pub volume: u32,
    /// Size of the backing device in sectors.
    pub device_sectors: u64,
    /// Where the metadata lives.
    pub placement: Placement,
    /// Bitmap planes to reserve.
    pub max_peers: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            volume: 0,
            device_sectors: 1 << 21,
            placement: Placement::External { start_sector: 0 },
            max_peers: 1,
        }
    }
}

/// One resource: its volumes, its peers and all tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Resource name.
    pub name: String,
    /// Local node id.
    pub node_id: u32,
    /// Peer node ids; each becomes a connection.
    pub peers: Vec<u32>,
    /// Write ordering policy.
    pub write_ordering: WriteOrdering,
    /// Replicated writes per epoch before a barrier is forced.
    pub max_epoch_size: u32,
    /// Allow both nodes to be primary.
    pub allow_two_primaries: bool,
    /// Network settings.
    pub net: NetConfig,
    /// Disk settings.
    pub disk: DiskConfig,
    /// Resync settings.
    pub resync: ResyncConfig,
    /// Volumes.
    pub devices: Vec<DeviceConfig>,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            name: String::from("r0"),
            node_id: 0,
            peers: vec![1],
            write_ordering: WriteOrdering::Barrier,
            max_epoch_size: 2048,
            allow_two_primaries: false,
            net: NetConfig::default(),
            disk: DiskConfig::default(),
            resync: ResyncConfig::default(),
            devices: vec![DeviceConfig::default()],
        }
    }
}

impl ResourceConfig {
    /// Loads a config file; the format follows the extension (`.toml` or
    /// `.json`).
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ResourceConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> ReplResult<()> {
        let err = |msg: String| Err(ReplError::Config(msg));
        if self.peers.contains(&self.node_id) {
            return err(format!("node {} lists itself as a peer", self.node_id));
        }
        if self.peers.len() > MAX_PEERS {
            return err(format!("{} peers exceed the limit of {}", self.peers.len(), MAX_PEERS));
        }
        if self.max_epoch_size == 0 {
            return err("max_epoch_size must be at least 1".to_string());
        }
        if self.disk.al_extents < 7 {
            return err(format!("al_extents {} is below the minimum of 7", self.disk.al_extents));
        }
        if self.disk.al_extents > AL_MAX_EXTENTS {
            return err(format!("al_extents {} exceeds the maximum of {}", self.disk.al_extents, AL_MAX_EXTENTS));
        }
        if self.disk.al_size_4k == 0 {
            return err("al_size_4k must be at least 1".to_string());
        }
        if self.disk.max_buffers == 0 {
            return err("max_buffers must be at least 1".to_string());
        }
        if self.net.max_bio_size < 4096 || self.net.max_bio_size % 4096 != 0 {
            return err(format!("max_bio_size {} is not a multiple of 4096", self.net.max_bio_size));
        }
        if self.net.pro_version_max < PRO_VERSION_MIN {
            return err(format!("pro_version_max {} is below {}", self.net.pro_version_max, PRO_VERSION_MIN));
        }
        if self.resync.tick_ms == 0 {
            return err("resync tick must be positive".to_string());
        }
        if self.resync.resync_extents == 0 {
            return err("resync_extents must be at least 1".to_string());
        }
        let mut volumes = std::collections::BTreeSet::new();
        for d in &self.devices {
            if !volumes.insert(d.volume) {
                return err(format!("volume {} configured twice", d.volume));
            }
            if d.device_sectors % BM_SECT_PER_BIT != 0 {
                return err(format!(
                    "volume {}: size {} is not a multiple of 4 KiB",
                    d.volume, d.device_sectors
                ));
            }
            if (d.max_peers as usize) < self.peers.len() {
                return err(format!(
                    "volume {}: {} bitmap planes for {} peers",
                    d.volume,
                    d.max_peers,
                    self.peers.len()
                ));
            }
        }
        Ok(())
    }
}
