use std::fs;
use std::mem::size_of;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tracing::info;

use crate::infra::{HostData, HostKey};
use crate::rtt::{RTT_MAX_TIMEOUT, RTT_MIN_TIMEOUT, RttBounds};

/// 预估的区域名（wire 格式）平均字节数，用于容量换算。
pub const INFRA_BYTES_NAME: usize = 14;

#[derive(Debug, Clone, Deserialize)]
pub struct InfraConfig {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub infra: InfraSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct InfraSettings {
    /// 主机状态保留秒数，缺省900。
    #[serde(default = "default_host_ttl")]
    pub host_ttl: u64,
    /// 分片数量，必须是2的幂，缺省4。
    #[serde(default = "default_slabs")]
    pub slabs: usize,
    /// 可缓存的主机条目数，用于换算字节容量。
    #[serde(default = "default_num_hosts")]
    pub num_hosts: usize,
    /// 超时下限（毫秒）。
    #[serde(default = "default_min_rtt")]
    pub min_rtt: i32,
    /// 超时上限（毫秒）。
    #[serde(default = "default_max_rtt")]
    pub max_rtt: i32,
    /// 对无响应的服务器持续探测。
    #[serde(default)]
    pub keep_probing: bool,
}

impl Default for InfraSettings {
    fn default() -> Self {
        Self {
            host_ttl: default_host_ttl(),
            slabs: default_slabs(),
            num_hosts: default_num_hosts(),
            min_rtt: default_min_rtt(),
            max_rtt: default_max_rtt(),
            keep_probing: false,
        }
    }
}

impl InfraSettings {
    pub fn rtt_bounds(&self) -> RttBounds {
        RttBounds {
            min: self.min_rtt,
            max: self.max_rtt,
        }
    }

    /// Byte budget for the whole table.
    pub fn capacity_bytes(&self) -> usize {
        self.num_hosts * (size_of::<HostKey>() + size_of::<HostData>() + INFRA_BYTES_NAME)
    }

    pub fn validate(&self) -> Result<()> {
        if self.slabs == 0 || !self.slabs.is_power_of_two() {
            anyhow::bail!("infra.slabs must be a power of 2, got {}", self.slabs);
        }
        if self.num_hosts == 0 {
            anyhow::bail!("infra.num_hosts must be positive");
        }
        if self.host_ttl == 0 {
            anyhow::bail!("infra.host_ttl must be positive");
        }
        if self.min_rtt <= 0 || self.min_rtt > self.max_rtt {
            anyhow::bail!(
                "infra rtt bounds invalid: min_rtt={} max_rtt={}",
                self.min_rtt,
                self.max_rtt
            );
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<InfraConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: InfraConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    if let Some(version) = cfg.version.as_ref() {
        info!(target = "config", version = %version, "config loaded");
    }

    cfg.infra
        .validate()
        .with_context(|| format!("validate config file: {}", path.display()))?;
    Ok(cfg)
}


fn default_host_ttl() -> u64 {
    900
}

fn default_slabs() -> usize {
    4
}

fn default_num_hosts() -> usize {
    10_000
}

fn default_min_rtt() -> i32 {
    RTT_MIN_TIMEOUT
}

fn default_max_rtt() -> i32 {
    RTT_MAX_TIMEOUT
}
