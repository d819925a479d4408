// Author: Lukas Bower
// Purpose: Queue-set tunables loaded from TOML with range validation.

//! Queue-set configuration.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

/// Smallest ring accepted for any queue.
pub const MIN_RING_SIZE: u32 = 32;
/// Largest ring accepted for any queue.
pub const MAX_RING_SIZE: u32 = 16384;
/// Queue sets a single device exposes.
pub const MAX_QSETS: u32 = 8;

fn default_txq_size() -> [u32; 3] {
    [1024, 1024, 256]
}

fn default_rspq_size() -> u32 {
    1024
}

fn default_fl_size() -> [u32; 2] {
    [1024, 512]
}

fn default_small_buf() -> u32 {
    2048
}

fn default_jumbo_buf() -> u32 {
    9216
}

fn default_copy_thresh() -> u32 {
    256
}

fn default_true() -> bool {
    true
}

fn default_reclaim_thresh() -> u32 {
    16
}

fn default_refill_batch() -> u32 {
    32
}

fn default_idle_refill() -> u32 {
    512
}

fn default_drop_thresh() -> u32 {
    16
}

fn default_timer_period() -> u64 {
    250
}

fn default_holdoff() -> u32 {
    50
}

fn default_compl_interval() -> u32 {
    32
}

/// Tunables for one queue set.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SgeConfig {
    /// Queue-set index; selects the response-queue id in register writes.
    #[serde(default)]
    pub qset_idx: u32,
    /// Egress interface used in transmit control words.
    #[serde(default)]
    pub port: u8,
    /// Ring sizes of the data, offload and control send queues.
    #[serde(default = "default_txq_size")]
    pub txq_size: [u32; 3],
    /// Response-queue ring size.
    #[serde(default = "default_rspq_size")]
    pub rspq_size: u32,
    /// Ring sizes of the small and jumbo free lists.
    #[serde(default = "default_fl_size")]
    pub fl_size: [u32; 2],
    /// Small free-list buffer size in bytes.
    #[serde(default = "default_small_buf")]
    pub small_buf_size: u32,
    /// Jumbo free-list buffer size in bytes.
    #[serde(default = "default_jumbo_buf")]
    pub jumbo_buf_size: u32,
    /// Received packets up to this length are copied and their buffer reposted.
    #[serde(default = "default_copy_thresh")]
    pub rx_copy_thresh: u32,
    /// Enables the copy-and-repost receive optimisation.
    #[serde(default = "default_true")]
    pub rx_recycle: bool,
    /// Completed descriptors that trigger a reclaim on the send path.
    #[serde(default = "default_reclaim_thresh")]
    pub tx_reclaim_thresh: u32,
    /// Buffers posted per free list after each response pass.
    #[serde(default = "default_refill_batch")]
    pub fl_refill_batch: u32,
    /// Buffers posted per free list when the response queue goes idle.
    #[serde(default = "default_idle_refill")]
    pub fl_idle_refill: u32,
    /// Free-list credits below which Ethernet receive drops and recycles.
    #[serde(default = "default_drop_thresh")]
    pub rx_drop_thresh: u32,
    /// Maintenance timer period in milliseconds.
    #[serde(default = "default_timer_period")]
    pub timer_period_ms: u64,
    /// Interrupt holdoff written with every index update.
    #[serde(default = "default_holdoff")]
    pub holdoff_tmr: u32,
    /// Descriptors between completion requests.
    #[serde(default = "default_compl_interval")]
    pub compl_interval: u32,
}

impl Default for SgeConfig {
    fn default() -> Self {
        Self {
            qset_idx: 0,
            port: 0,
            txq_size: default_txq_size(),
            rspq_size: default_rspq_size(),
            fl_size: default_fl_size(),
            small_buf_size: default_small_buf(),
            jumbo_buf_size: default_jumbo_buf(),
            rx_copy_thresh: default_copy_thresh(),
            rx_recycle: true,
            tx_reclaim_thresh: default_reclaim_thresh(),
            fl_refill_batch: default_refill_batch(),
            fl_idle_refill: default_idle_refill(),
            rx_drop_thresh: default_drop_thresh(),
            timer_period_ms: default_timer_period(),
            holdoff_tmr: default_holdoff(),
            compl_interval: default_compl_interval(),
        }
    }
}

impl SgeConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: SgeConfig = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads, parses and validates a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Checks ranges and cross-field consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        range("qset_idx", u64::from(self.qset_idx), 0, u64::from(MAX_QSETS - 1))?;
        range("port", u64::from(self.port), 0, 15)?;
        let ring = |field, value: u32| {
            range(
                field,
                u64::from(value),
                u64::from(MIN_RING_SIZE),
                u64::from(MAX_RING_SIZE),
            )
        };
        ring("txq_size[eth]", self.txq_size[0])?;
        ring("txq_size[offload]", self.txq_size[1])?;
        ring("txq_size[control]", self.txq_size[2])?;
        ring("rspq_size", self.rspq_size)?;
        ring("fl_size[small]", self.fl_size[0])?;
        ring("fl_size[jumbo]", self.fl_size[1])?;
        range("small_buf_size", u64::from(self.small_buf_size), 64, 65536)?;
        range("jumbo_buf_size", u64::from(self.jumbo_buf_size), 64, 65536)?;
        if self.jumbo_buf_size < self.small_buf_size {
            return Err(ConfigError::Inconsistent(
                "jumbo_buf_size must not be smaller than small_buf_size",
            ));
        }
        if self.rx_copy_thresh > self.small_buf_size {
            return Err(ConfigError::Inconsistent(
                "rx_copy_thresh exceeds small_buf_size",
            ));
        }
        let min_fl = self.fl_size[0].min(self.fl_size[1]);
        let min_txq = self.txq_size.iter().copied().min().unwrap_or(MIN_RING_SIZE);
        range("tx_reclaim_thresh", u64::from(self.tx_reclaim_thresh), 1, u64::from(min_txq - 1))?;
        range("compl_interval", u64::from(self.compl_interval), 1, u64::from(min_txq))?;
        range("fl_refill_batch", u64::from(self.fl_refill_batch), 1, u64::from(min_fl))?;
        range("fl_idle_refill", u64::from(self.fl_idle_refill), 1, u64::from(MAX_RING_SIZE))?;
        range("rx_drop_thresh", u64::from(self.rx_drop_thresh), 0, u64::from(min_fl - 1))?;
        range("timer_period_ms", self.timer_period_ms, 1, 60_000)?;
        range("holdoff_tmr", u64::from(self.holdoff_tmr), 0, 0x1fff)?;
        Ok(())
    }
}

fn range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_validate() {
        SgeConfig::default().validate().expect("defaults are valid");
    }

    #[test]
    fn partial_document_keeps_defaults() {
        let cfg = SgeConfig::from_toml_str("rspq_size = 512\ntxq_size = [128, 128, 64]\n")
            .expect("parse");
        assert_eq!(cfg.rspq_size, 512);
        assert_eq!(cfg.txq_size, [128, 128, 64]);
        assert_eq!(cfg.fl_refill_batch, 32);
        assert!(cfg.rx_recycle);
    }

    #[test]
    fn undersized_ring_is_rejected() {
        let err = SgeConfig::from_toml_str("rspq_size = 8\n").expect_err("too small");
        assert!(matches!(
            err,
            ConfigError::OutOfRange {
                field: "rspq_size",
                ..
            }
        ));
    }

    #[test]
    fn unknown_field_is_a_parse_error() {
        let err = SgeConfig::from_toml_str("bogus = 1\n").expect_err("unknown");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("sge.toml");
        fs::write(&path, "qset_idx = 3\nholdoff_tmr = 10\n").expect("write config");
        let cfg = SgeConfig::load(&path).expect("load");
        assert_eq!(cfg.qset_idx, 3);
        assert_eq!(cfg.holdoff_tmr, 10);
    }

    #[test]
    fn jumbo_smaller_than_small_is_inconsistent() {
        let cfg = SgeConfig {
            small_buf_size: 4096,
            jumbo_buf_size: 2048,
            ..SgeConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Inconsistent(_))));
    }
}
