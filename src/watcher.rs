use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::thread;
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{error, info, warn};

use crate::config;
use crate::infra::InfraCache;

const RELOAD_RETRIES: u32 = 3;
const RELOAD_BACKOFF: Duration = Duration::from_millis(50);

pub fn spawn(path: PathBuf, cache: Arc<InfraCache>) {
    // 使用阻塞线程持有watcher，避免异步生命周期问题。
    thread::spawn(move || {
        if let Err(err) = run_watcher(path, cache) {
            error!(target = "watcher", error = %err, "config watcher exited with error");
        }
    });
}

fn run_watcher(path: PathBuf, cache: Arc<InfraCache>) -> notify::Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher: RecommendedWatcher = Watcher::new(tx, Config::default())?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;

    info!(target = "watcher", path = %path.display(), "config watcher started");
    apply_events(&path, &cache, rx);
    Ok(())
}

fn apply_events(path: &Path, cache: &InfraCache, rx: Receiver<notify::Result<Event>>) {
    for res in rx {
        match res {
            Ok(_event) => {
                reload(path, cache);
            }
            Err(err) => {
                warn!(target = "watcher", error = %err, "watcher event error");
            }
        }
    }
}

/// 重新加载配置，失败时保留旧设置。
pub fn reload(path: &Path, cache: &InfraCache) -> bool {
    // 写文件可能是 truncate+write，读到半截时稍等重试
    let mut retries = RELOAD_RETRIES;
    loop {
        match config::load_config(path) {
            Ok(cfg) => {
                cache.apply_settings(cfg.infra);
                info!(target = "watcher", path = %path.display(), "config reloaded");
                return true;
            }
            Err(err) => {
                retries -= 1;
                if retries == 0 {
                    warn!(target = "watcher", path = %path.display(), error = %err, "config reload failed, keeping old config");
                    return false;
                }
                thread::sleep(RELOAD_BACKOFF);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InfraSettings;
    use std::io::Write;

    #[test]
    fn reload_applies_new_settings() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, r#"{{ "infra": {{ "host_ttl": 30, "keep_probing": true }} }}"#).expect("write");
        let cache = InfraCache::new(InfraSettings::default());
        assert!(reload(file.path(), &cache));
        let s = cache.settings();
        assert_eq!(s.host_ttl, 30);
        assert!(s.keep_probing);
    }

    #[test]
    fn broken_file_keeps_old_settings() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, "{{ \"infra\": ").expect("write");
        let cache = InfraCache::new(InfraSettings::default());
        assert!(!reload(file.path(), &cache));
        assert_eq!(cache.settings(), InfraSettings::default());
    }

    #[test]
    fn events_drive_reloads_until_channel_closes() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, r#"{{ "infra": {{ "host_ttl": 45 }} }}"#).expect("write");
        let cache = InfraCache::new(InfraSettings::default());
        let (tx, rx) = std::sync::mpsc::channel();
        tx.send(Ok(Event::new(notify::EventKind::Any))).expect("send");
        tx.send(Err(notify::Error::generic("boom"))).expect("send");
        drop(tx);
        apply_events(file.path(), &cache, rx);
        assert_eq!(cache.settings().host_ttl, 45);
    }

    #[test]
    fn bad_rewrite_after_good_reload_keeps_applied_settings() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, r#"{{ "infra": {{ "host_ttl": 75 }} }}"#).expect("write");
        let cache = InfraCache::new(InfraSettings::default());

        let (tx, rx) = std::sync::mpsc::channel();
        tx.send(Ok(Event::new(notify::EventKind::Any))).expect("send");
        drop(tx);
        apply_events(file.path(), &cache, rx);
        assert_eq!(cache.settings().host_ttl, 75);

        std::fs::write(file.path(), r#"{ "infra": { "slabs": 3 } }"#).expect("rewrite");
        let (tx, rx) = std::sync::mpsc::channel();
        tx.send(Ok(Event::new(notify::EventKind::Any))).expect("send");
        drop(tx);
        apply_events(file.path(), &cache, rx);
        assert_eq!(cache.settings().host_ttl, 75);
        assert_eq!(cache.settings().slabs, 4);
    }
}
