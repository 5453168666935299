//! Per-destination host state: rtt, EDNS capability and lameness for each
//! (server address, zone) pair, kept for `host_ttl` seconds.
//!
//! Expired records are never reported. Any update that lands on an expired
//! record starts from a fresh record, so stale bits never leak into a new
//! TTL window.

use std::fmt;
use std::mem::size_of;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use arc_swap::ArcSwap;
use bytes::Bytes;
use hickory_proto::rr::{Name, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tracing::{debug, info, warn};

use crate::config::InfraSettings;
use crate::lruhash::SlabStats;
use crate::rtt::{RttBounds, RttInfo};
use crate::slabhash::SlabHash;

/// Above this timeout a server only gets single probe queries.
pub const PROBE_MAXRTO: i32 = 12_000;
/// Cap on the per-class consecutive timeout counters.
pub const TIMEOUT_COUNT_MAX: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostKey {
    addr: SocketAddr,
    /// zone name, uncompressed wire format
    zone: Bytes,
}

impl Default for HostKey {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            zone: Bytes::new(),
        }
    }
}

impl HostKey {
    /// `zone` must already be in wire format; it is compared byte for byte.
    pub fn new(addr: SocketAddr, zone: impl Into<Bytes>) -> Self {
        Self {
            addr,
            zone: zone.into(),
        }
    }

    pub fn from_name(addr: SocketAddr, zone: &Name) -> anyhow::Result<Self> {
        let wire = zone
            .to_bytes()
            .with_context(|| format!("encode zone name: {zone}"))?;
        Ok(Self::new(addr, wire))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn zone(&self) -> &[u8] {
        &self.zone
    }

    /// Bytes this key's record accounts for in the table.
    fn cost(&self) -> usize {
        size_of::<HostKey>() + size_of::<HostData>() + self.zone.len()
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Name::from_bytes(&self.zone) {
            Ok(name) => write!(f, "{} {}", self.addr.ip(), name),
            Err(_) => write!(f, "{} <{} bytes>", self.addr.ip(), self.zone.len()),
        }
    }
}

/// What we know about a server's EDNS support.
///
/// Ordered `Unknown < NotSupported < Version(_)`. A "not supported" report
/// never replaces a known version; a version report always wins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EdnsStatus {
    #[default]
    Unknown,
    NotSupported,
    Version(u8),
}

impl EdnsStatus {
    /// `-1` means "no EDNS", anything else is a version number.
    pub fn from_version(version: i32) -> Self {
        if version < 0 {
            Self::NotSupported
        } else {
            Self::Version(u8::try_from(version).unwrap_or(u8::MAX))
        }
    }

    /// Version to put in outgoing queries; `-1` for "send without EDNS".
    pub fn version(self) -> i32 {
        match self {
            Self::Unknown => 0,
            Self::NotSupported => -1,
            Self::Version(v) => i32::from(v),
        }
    }

    pub fn is_known(self) -> bool {
        self != Self::Unknown
    }

    pub fn merge(self, incoming: Self) -> Self {
        match (self, incoming) {
            (_, Self::Unknown) => self,
            (Self::Version(_), Self::NotSupported) => self,
            _ => incoming,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HostData {
    rtt: RttInfo,
    edns: EdnsStatus,
    lame_type_a: bool,
    lame_other: bool,
    rec_lame: bool,
    dnssec_lame: bool,
    /// absolute expiry, seconds
    expires: u64,
    /// no new queries before this time, except the probe
    probe_delay: u64,
    timeout_a: u8,
    timeout_aaaa: u8,
    timeout_other: u8,
}

impl HostData {
    fn new(now: u64, settings: &InfraSettings) -> Self {
        Self {
            rtt: RttInfo::new(&settings.rtt_bounds()),
            expires: now.saturating_add(settings.host_ttl),
            ..Self::default()
        }
    }

    /// Fresh record if the old one ran out.
    fn refresh(&mut self, now: u64, settings: &InfraSettings) {
        if self.is_expired(now) {
            *self = Self::new(now, settings);
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires
    }

    pub fn rtt(&self) -> &RttInfo {
        &self.rtt
    }

    pub fn edns(&self) -> EdnsStatus {
        self.edns
    }

    pub fn expires(&self) -> u64 {
        self.expires
    }

    pub fn probe_delay(&self) -> u64 {
        self.probe_delay
    }

    pub fn lame_type_a(&self) -> bool {
        self.lame_type_a
    }

    pub fn lame_other(&self) -> bool {
        self.lame_other
    }

    pub fn rec_lame(&self) -> bool {
        self.rec_lame
    }

    pub fn dnssec_lame(&self) -> bool {
        self.dnssec_lame
    }

    pub fn timeouts(&self, qtype: RecordType) -> u8 {
        match qtype {
            RecordType::A => self.timeout_a,
            RecordType::AAAA => self.timeout_aaaa,
            _ => self.timeout_other,
        }
    }

    fn timeout_counter(&mut self, qtype: RecordType) -> &mut u8 {
        match qtype {
            RecordType::A => &mut self.timeout_a,
            RecordType::AAAA => &mut self.timeout_aaaa,
            _ => &mut self.timeout_other,
        }
    }

    fn info(&self) -> HostInfo {
        HostInfo {
            edns: self.edns,
            timeout: self.rtt.timeout(),
        }
    }

    /// Backed off so far that only a probe should go out.
    fn needs_probe(&self, settings: &InfraSettings) -> bool {
        let to = self.rtt.timeout();
        let estimate = self.rtt.no_timeout(&settings.rtt_bounds());
        to >= PROBE_MAXRTO && (settings.keep_probing || estimate.saturating_mul(4) <= to)
    }
}

/// Answer of [`InfraCache::host_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostInfo {
    pub edns: EdnsStatus,
    /// milliseconds
    pub timeout: i32,
}

impl HostInfo {
    pub fn edns_version(&self) -> i32 {
        self.edns.version()
    }

    pub fn edns_lame_known(&self) -> bool {
        self.edns.is_known()
    }
}

/// Server selection view of a host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LameRtt {
    pub lame: bool,
    pub dnssec_lame: bool,
    pub rec_lame: bool,
    pub rtt: i32,
}

/// Diagnostic view of a host's timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostRto {
    pub rtt: i32,
    pub rto: i32,
    /// seconds until probing is allowed again
    pub delay: u64,
    /// seconds until the record expires
    pub ttl: u64,
    pub timeout_a: u8,
    pub timeout_aaaa: u8,
    pub timeout_other: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InfraStats {
    pub hosts: usize,
    pub used: usize,
    pub capacity: usize,
    pub slabs: Vec<SlabStats>,
    pub pool_quarantined: usize,
}

impl InfraStats {
    pub fn quarantined(&self) -> usize {
        self.pool_quarantined + self.slabs.iter().map(|s| s.quarantined).sum::<usize>()
    }
}

impl fmt::Display for InfraStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hosts={} used={} capacity={} slabs={} quarantined={}",
            self.hosts,
            self.used,
            self.capacity,
            self.slabs.len(),
            self.quarantined()
        )
    }
}

pub struct InfraCache {
    hosts: SlabHash<HostKey, HostData>,
    settings: ArcSwap<InfraSettings>,
}

impl InfraCache {
    pub fn new(settings: InfraSettings) -> Self {
        let capacity = settings.capacity_bytes();
        info!(
            target = "infra",
            slabs = settings.slabs,
            capacity,
            host_ttl = settings.host_ttl,
            "infra cache created"
        );
        Self {
            hosts: SlabHash::new(settings.slabs, capacity),
            settings: ArcSwap::from_pointee(settings),
        }
    }

    pub fn settings(&self) -> InfraSettings {
        **self.settings.load()
    }

    /// EDNS status and timeout to use for the next query to this host.
    /// Unknown or expired hosts get defaults and a fresh record.
    pub fn host_info(&self, key: &HostKey, now: u64) -> HostInfo {
        let settings = self.settings.load();
        if let Some(data) = self.hosts.lookup(key) {
            if !data.is_expired(now) && !data.needs_probe(&settings) {
                return data.info();
            }
        }
        self.hosts.update_or_insert(
            key.clone(),
            key.cost(),
            || HostData::new(now, &settings),
            |data| {
                data.refresh(now, &settings);
                let info = data.info();
                if data.needs_probe(&settings) {
                    // round msec up to seconds, plus one so this probe has
                    // timed out before the next is allowed
                    data.probe_delay = now + (info.timeout as u64 + 1999) / 1000;
                }
                info
            },
        )
    }

    /// Record a reply after `roundtrip` ms, or a loss if `roundtrip` is
    /// negative (`orig_rtt` is the timeout the lost query was sent with).
    /// Returns the new timeout.
    pub fn rtt_update(
        &self,
        key: &HostKey,
        qtype: RecordType,
        roundtrip: i32,
        orig_rtt: i32,
        now: u64,
    ) -> i32 {
        let settings = self.settings.load();
        let bounds = settings.rtt_bounds();
        self.hosts.update_or_insert(
            key.clone(),
            key.cost(),
            || HostData::new(now, &settings),
            |data| {
                data.refresh(now, &settings);
                if roundtrip < 0 {
                    data.rtt.lost(orig_rtt, &bounds);
                    let counter = data.timeout_counter(qtype);
                    if *counter < TIMEOUT_COUNT_MAX {
                        *counter += 1;
                    }
                } else {
                    // a reply from a server at the ceiling makes it fully
                    // usable again
                    if data.rtt.unclamped(&bounds) >= bounds.max {
                        data.rtt = RttInfo::new(&bounds);
                    }
                    data.rtt.update(roundtrip, &bounds);
                    data.probe_delay = 0;
                    *data.timeout_counter(qtype) = 0;
                }
                data.rtt.timeout()
            },
        )
    }

    pub fn edns_update(&self, key: &HostKey, edns: EdnsStatus, now: u64) {
        let settings = self.settings.load();
        self.hosts.update_or_insert(
            key.clone(),
            key.cost(),
            || HostData::new(now, &settings),
            |data| {
                data.refresh(now, &settings);
                let merged = data.edns.merge(edns);
                if merged != data.edns {
                    debug!(target = "infra", host = %key, from = ?data.edns, to = ?merged, "edns status changed");
                }
                data.edns = merged;
            },
        )
    }

    /// Mark the host lame. A plain lame report marks the query's class
    /// (type A or everything else); dnssec/recursion lameness are their own
    /// bits. Bits accumulate within the TTL window.
    pub fn set_lame(
        &self,
        key: &HostKey,
        dnssec_lame: bool,
        rec_lame: bool,
        qtype: RecordType,
        now: u64,
    ) {
        let settings = self.settings.load();
        self.hosts.update_or_insert(
            key.clone(),
            key.cost(),
            || HostData::new(now, &settings),
            |data| {
                data.refresh(now, &settings);
                data.dnssec_lame |= dnssec_lame;
                data.rec_lame |= rec_lame;
                if !dnssec_lame && !rec_lame {
                    if qtype == RecordType::A {
                        data.lame_type_a = true;
                    } else {
                        data.lame_other = true;
                    }
                }
                data.expires = now.saturating_add(settings.host_ttl);
            },
        );
        debug!(target = "infra", host = %key, dnssec_lame, rec_lame, qtype = %qtype, "host marked lame");
    }

    /// Lameness and rtt for server selection, `None` if nothing is known.
    pub fn lame_rtt(&self, key: &HostKey, qtype: RecordType, now: u64) -> Option<LameRtt> {
        let settings = self.settings.load();
        let bounds = settings.rtt_bounds();
        let data = self.hosts.lookup(key)?;
        if data.is_expired(now) {
            return None;
        }
        let rto = data.rtt.timeout();
        let mut rtt = data.rtt.unclamped(&bounds);
        if rto >= PROBE_MAXRTO && now >= data.probe_delay && settings.keep_probing {
            // keep sending single probes
            if rtt >= bounds.max {
                rtt = bounds.retry_ceiling();
            }
        } else if rto >= PROBE_MAXRTO
            && now < data.probe_delay
            && data.rtt.no_timeout(&bounds).saturating_mul(4) <= rto
        {
            // a probe is out already; this query class may still try once
            rtt = if data.timeouts(qtype) >= TIMEOUT_COUNT_MAX {
                bounds.max
            } else {
                bounds.retry_ceiling()
            };
        }

        let type_lame = if qtype == RecordType::A {
            data.lame_type_a
        } else {
            data.lame_other
        };
        let mut out = LameRtt {
            rtt,
            ..LameRtt::default()
        };
        if type_lame {
            out.lame = true;
        } else if data.dnssec_lame {
            out.dnssec_lame = true;
        } else if data.rec_lame {
            out.rec_lame = true;
        }
        Some(out)
    }

    /// The server answers over TCP even though UDP keeps timing out.
    pub fn tcp_works(&self, key: &HostKey, now: u64) {
        let settings = self.settings.load();
        let bounds: RttBounds = settings.rtt_bounds();
        let Some(mut data) = self.hosts.lookup_mut(key) else {
            return;
        };
        data.refresh(now, &settings);
        if data.rtt.timeout() >= bounds.max {
            // better than nothing, keep it selectable
            data.rtt.set_timeout(bounds.retry_ceiling(), &bounds);
        }
    }

    pub fn host_rto(&self, key: &HostKey, now: u64) -> Option<HostRto> {
        let bounds = self.settings.load().rtt_bounds();
        let data = self.hosts.lookup(key)?;
        if data.is_expired(now) {
            return None;
        }
        Some(HostRto {
            rtt: data.rtt.unclamped(&bounds),
            rto: data.rtt.timeout(),
            delay: data.probe_delay.saturating_sub(now),
            ttl: data.expires - now,
            timeout_a: data.timeout_a,
            timeout_aaaa: data.timeout_aaaa,
            timeout_other: data.timeout_other,
        })
    }

    pub fn remove_host(&self, key: &HostKey) -> bool {
        self.hosts.remove(key)
    }

    pub fn flush_all(&self) {
        self.hosts.clear();
        info!(target = "infra", "infra cache flushed");
    }

    /// Visit every record, expired ones included. `visit` runs under the
    /// record's read lock and must not update this cache.
    pub fn for_each_host(&self, visit: impl FnMut(&HostKey, &HostData)) {
        self.hosts.traverse(visit);
    }

    pub fn stats(&self) -> InfraStats {
        let slabs = self.hosts.slab_stats();
        InfraStats {
            hosts: slabs.iter().map(|s| s.entries).sum(),
            used: slabs.iter().map(|s| s.used).sum(),
            capacity: slabs.iter().map(|s| s.capacity).sum(),
            slabs,
            pool_quarantined: self.hosts.pool_quarantined(),
        }
    }

    /// Apply reloaded settings. TTL, rtt bounds and probing apply at once and
    /// the table is resized in place; the slab count cannot change live.
    pub fn apply_settings(&self, mut settings: InfraSettings) {
        let old = self.settings();
        if settings.slabs != self.hosts.num_slabs() {
            warn!(
                target = "infra",
                current = self.hosts.num_slabs(),
                requested = settings.slabs,
                "slab count change needs a restart, keeping current slabs"
            );
            settings.slabs = self.hosts.num_slabs();
        }
        if settings.capacity_bytes() != old.capacity_bytes() {
            self.hosts.set_capacity(settings.capacity_bytes());
        }
        self.settings.store(Arc::new(settings));
        info!(
            target = "infra",
            host_ttl = settings.host_ttl,
            capacity = settings.capacity_bytes(),
            keep_probing = settings.keep_probing,
            "infra settings applied"
        );
    }
}
