use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use hickory_proto::rr::{Name, RecordType};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use kixdns_infra::{EdnsStatus, HostKey, InfraCache, load_config, watcher};

const ZONES: [&str; 4] = ["com.", "net.", "example.org.", "."];

#[derive(Parser, Debug)]
#[command(author, version, about = "KixDNS infra cache driver", long_about = None)]
struct Args {
    /// 配置文件路径（JSON）
    #[arg(short = 'c', long = "config", default_value = "config/infra.json")]
    config: PathBuf,
    /// 启用调试日志
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    /// JSON 格式日志
    #[arg(long = "json-logs", default_value_t = false)]
    json_logs: bool,
    /// 模拟 worker 数量（默认 CPU 核心数）
    #[arg(long = "workers", default_value_t = 0)]
    workers: usize,
    /// 模拟的上游服务器数量
    #[arg(long = "servers", default_value_t = 256)]
    servers: usize,
    /// 运行秒数，0 表示直到 Ctrl-C
    #[arg(long = "duration", default_value_t = 10)]
    duration: u64,
    /// 结束时打印全部主机状态
    #[arg(long = "dump", default_value_t = false)]
    dump: bool,
}

/// Simulated upstream behaviour, fixed per server index.
#[derive(Debug, Clone, Copy)]
struct Profile {
    latency_ms: i32,
    loss_percent: u32,
    edns: EdnsStatus,
    lame: bool,
}

impl Profile {
    fn for_server(idx: usize) -> Self {
        Self {
            latency_ms: 5 + (idx % 20) as i32 * 15,
            loss_percent: if idx % 7 == 0 { 60 } else { 2 },
            edns: if idx % 5 == 0 {
                EdnsStatus::NotSupported
            } else {
                EdnsStatus::Version(0)
            },
            lame: idx % 11 == 0,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug, args.json_logs);

    let cfg = load_config(&args.config).context("load initial config")?;
    let cache = Arc::new(InfraCache::new(cfg.infra));
    watcher::spawn(args.config.clone(), cache.clone());

    let keys = Arc::new(build_keys(args.servers.max(1)).context("build host keys")?);

    // worker 数量：默认为 CPU 核心数，最少 1 个
    let workers = if args.workers > 0 {
        args.workers
    } else {
        num_cpus::get()
    };
    info!(target = "driver", workers, servers = keys.len(), duration = args.duration, "driver started");

    let started = Instant::now();
    let queries = Arc::new(AtomicU64::new(0));
    let (stop_tx, stop_rx) = watch::channel(false);

    let mut handles = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        let cache = cache.clone();
        let keys = keys.clone();
        let queries = queries.clone();
        let stop = stop_rx.clone();
        handles.push(tokio::spawn(async move {
            run_worker(worker_id, cache, keys, queries, started, stop).await;
        }));
    }

    let ticker = {
        let cache = cache.clone();
        let queries = queries.clone();
        let mut stop = stop_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let stats = cache.stats();
                        info!(
                            target = "driver",
                            queries = queries.load(Ordering::Relaxed),
                            hosts = stats.hosts,
                            used = stats.used,
                            capacity = stats.capacity,
                            quarantined = stats.quarantined(),
                            "infra stats"
                        );
                    }
                    _ = stop.changed() => break,
                }
            }
        })
    };

    let run_for = async {
        if args.duration == 0 {
            std::future::pending::<()>().await;
        } else {
            tokio::time::sleep(Duration::from_secs(args.duration)).await;
        }
    };
    tokio::select! {
        _ = run_for => {}
        res = tokio::signal::ctrl_c() => {
            if let Err(err) = res {
                error!(target = "driver", error = %err, "ctrl-c handler failed");
            }
            info!(target = "driver", "interrupted");
        }
    }

    if let Err(err) = stop_tx.send(true) {
        warn!(target = "driver", error = %err, "stop signal not delivered");
    }
    for h in handles {
        if let Err(err) = h.await {
            error!(target = "driver", error = %err, "worker task failed");
        }
    }
    if let Err(err) = ticker.await {
        error!(target = "driver", error = %err, "stats ticker failed");
    }

    let stats = cache.stats();
    println!(
        "queries={} elapsed={:.1}s {}",
        queries.load(Ordering::Relaxed),
        started.elapsed().as_secs_f64(),
        stats
    );
    for (i, slab) in stats.slabs.iter().enumerate() {
        println!(
            "slab[{i}] entries={} used={} capacity={} quarantined={}",
            slab.entries, slab.used, slab.capacity, slab.quarantined
        );
    }
    if args.dump {
        dump_hosts(&cache, started.elapsed().as_secs());
    }
    Ok(())
}

fn build_keys(servers: usize) -> anyhow::Result<Vec<HostKey>> {
    let zones = ZONES
        .iter()
        .map(|z| Name::from_ascii(z).with_context(|| format!("parse zone {z}")))
        .collect::<anyhow::Result<Vec<_>>>()?;
    (0..servers)
        .map(|idx| {
            let ip = Ipv4Addr::from(0x0a00_0000u32 + idx as u32);
            HostKey::from_name(SocketAddr::from((ip, 53)), &zones[idx % zones.len()])
        })
        .collect()
}

async fn run_worker(
    worker_id: usize,
    cache: Arc<InfraCache>,
    keys: Arc<Vec<HostKey>>,
    queries: Arc<AtomicU64>,
    started: Instant,
    stop: watch::Receiver<bool>,
) {
    const BATCH: usize = 256;
    let mut rng = fastrand::Rng::with_seed(worker_id as u64);
    while !*stop.borrow() {
        let now = started.elapsed().as_secs();
        for _ in 0..BATCH {
            let idx = rng.usize(..keys.len());
            simulate_query(&cache, &keys[idx], Profile::for_server(idx), now, &mut rng);
        }
        queries.fetch_add(BATCH as u64, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

fn simulate_query(
    cache: &InfraCache,
    key: &HostKey,
    profile: Profile,
    now: u64,
    rng: &mut fastrand::Rng,
) {
    let qtype = match rng.u8(..3) {
        0 => RecordType::A,
        1 => RecordType::AAAA,
        _ => RecordType::NS,
    };
    if let Some(view) = cache.lame_rtt(key, qtype, now) {
        if view.lame {
            return;
        }
    }
    let info = cache.host_info(key, now);
    if rng.u32(..100) < profile.loss_percent {
        cache.rtt_update(key, qtype, -1, info.timeout, now);
        if info.timeout >= cache.settings().max_rtt && rng.u32(..100) < 5 {
            cache.tcp_works(key, now);
        }
        return;
    }
    let jitter = rng.i32(0..=profile.latency_ms / 2);
    cache.rtt_update(key, qtype, profile.latency_ms + jitter, info.timeout, now);
    if !info.edns_lame_known() {
        cache.edns_update(key, profile.edns, now);
    }
    if profile.lame && rng.u32(..100) < 10 {
        cache.set_lame(key, false, false, qtype, now);
    }
}

fn dump_hosts(cache: &InfraCache, now: u64) {
    cache.for_each_host(|key, data| {
        println!(
            "{} port={} ttl={} rto={} edns={} lame_a={} lame_other={} rec_lame={} dnssec_lame={} probe_delay={} to_a={} to_aaaa={} to_other={}",
            key,
            key.addr().port(),
            data.expires().saturating_sub(now),
            data.rtt().timeout(),
            data.edns().version(),
            data.lame_type_a(),
            data.lame_other(),
            data.rec_lame(),
            data.dnssec_lame(),
            data.probe_delay(),
            data.timeouts(RecordType::A),
            data.timeouts(RecordType::AAAA),
            data.timeouts(RecordType::NS),
        );
    });
}

fn init_tracing(debug: bool, json: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_ansi(false))
            .init();
    }
}
