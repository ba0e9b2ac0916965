// pack-fetch: downloads packs over HTTP range requests, writes mounted entries, optionally serves peers.

mod config;
mod peer;
mod store;
mod transport;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use pack_core::{PackEvent, PackManager};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::transport::HttpTransport;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_PRIORITY: f32 = 1.0;

#[derive(Debug, Default, PartialEq)]
struct Args {
    version: bool,
    serve: bool,
    config: Option<PathBuf>,
    /// Local copies to delete.
    remove: Vec<String>,
    /// (pack, priority)
    packs: Vec<(String, f32)>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<Args> {
    let mut out = Args::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => out.version = true,
            "--serve" => out.serve = true,
            "--config" | "-c" => {
                let Some(path) = args.next() else {
                    bail!("--config needs a path");
                };
                out.config = Some(PathBuf::from(path));
            }
            "--remove" => {
                let Some(name) = args.next() else {
                    bail!("--remove needs a pack name");
                };
                out.remove.push(name);
            }
            flag if flag.starts_with('-') => bail!("unknown option {flag}"),
            other => out.packs.push(parse_pack_arg(other)?),
        }
    }
    Ok(out)
}

/// `name` or `name=priority`.
fn parse_pack_arg(arg: &str) -> anyhow::Result<(String, f32)> {
    match arg.split_once('=') {
        Some((name, priority)) => {
            let priority: f32 = priority
                .parse()
                .with_context(|| format!("bad priority in {arg}"))?;
            Ok((name.to_string(), priority))
        }
        None => Ok((arg.to_string(), DEFAULT_PRIORITY)),
    }
}

fn main() -> anyhow::Result<()> {
    let args = parse_args(std::env::args().skip(1))?;
    if args.version {
        println!("pack-fetch {}", VERSION);
        return Ok(());
    }

    let cfg = config::load(args.config.as_deref())?;
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_level))
        .context("invalid log_level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    for name in &args.remove {
        if !store::remove_local(&cfg.output_dir, name)? {
            info!(pack = %name, "nothing to remove");
        }
    }
    if !args.remove.is_empty() && args.packs.is_empty() && !args.serve {
        return Ok(());
    }

    let catalog = config::load_catalog(&cfg.catalog)?;
    let mut packs = args.packs;
    if packs.is_empty() {
        packs = cfg.packs.iter().map(|p| (p.clone(), DEFAULT_PRIORITY)).collect();
    }
    if args.serve && cfg.peer_port.is_none() {
        bail!("--serve needs `peer_port` in the config");
    }
    let serve = cfg.peer_port.is_some();
    if packs.is_empty() && !serve {
        bail!("no packs requested (pass names or set `packs` in the config)");
    }

    let rt = tokio::runtime::Runtime::new()?;
    let transport = HttpTransport::new(
        rt.handle().clone(),
        Duration::from_secs(cfg.request_timeout_secs),
    )?;
    let mut manager = PackManager::new(cfg.delivery.clone(), catalog, transport);
    seed_local(&mut manager, &cfg.output_dir, &packs);
    let manager = Arc::new(Mutex::new(manager));

    rt.block_on(async {
        {
            let mut m = manager.lock().await;
            for (name, priority) in &packs {
                m.request_pack(name, *priority)
                    .with_context(|| format!("requesting {name}"))?;
            }
        }
        if let Some(port) = cfg.peer_port {
            let bind = std::net::SocketAddr::from(([0, 0, 0, 0], port));
            let peers = manager.clone();
            tokio::spawn(async move {
                if let Err(e) = peer::run_peer_listener(bind, peers).await {
                    warn!(error = %e, "peer listener stopped");
                }
            });
        }
        run(manager.clone(), &cfg, serve).await
    })
}

/// Tick until every pack settles (or forever when serving), or until Ctrl+C/SIGTERM.
async fn run(
    manager: Arc<Mutex<PackManager<HttpTransport>>>,
    cfg: &config::Config,
    serve: bool,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_millis(cfg.tick_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut failed = Vec::new();
    let mut settled = false;
    loop {
        tokio::select! {
            res = &mut shutdown => {
                res?;
                info!("shutdown requested");
                break;
            }
            _ = ticker.tick() => {}
        }
        let mut to_write = Vec::new();
        let pending = {
            let mut m = manager.lock().await;
            for event in m.update() {
                match event {
                    PackEvent::Started { pack } => info!(pack = %pack, "download started"),
                    PackEvent::Progress { pack, progress } => {
                        info!(pack = %pack, percent = (progress * 100.0).round(), "progress")
                    }
                    PackEvent::Mounted { pack } => {
                        let files = store::collect(&*m, &pack);
                        to_write.push((pack, files));
                    }
                    PackEvent::Failed { pack, reason } => {
                        warn!(pack = %pack, reason = %reason, "pack failed");
                        failed.push(pack);
                    }
                    PackEvent::Removed { pack } => info!(pack = %pack, "pack removed"),
                }
            }
            m.has_pending()
        };
        // Written without the manager lock held.
        for (pack, files) in to_write {
            let out = cfg.output_dir.clone();
            let name = pack.clone();
            let written =
                tokio::task::spawn_blocking(move || store::write_pack(&out, &name, &files))
                    .await??;
            info!(pack = %pack, files = written, dir = %cfg.output_dir.display(), "pack written");
        }
        if !settled && !pending {
            settled = true;
            if !serve {
                break;
            }
            info!("all packs settled, serving peers until shutdown");
        }
    }
    manager.lock().await.shutdown();

    if !failed.is_empty() {
        bail!("failed packs: {}", failed.join(", "));
    }
    Ok(())
}

/// Offer entries already written by an earlier run for every pack about to be fetched.
fn seed_local<T: pack_core::Transport>(m: &mut PackManager<T>, out: &Path, packs: &[(String, f32)]) {
    let mut names: Vec<String> = Vec::new();
    for (name, _) in packs {
        for dep in m.catalog().dependency_order(name).unwrap_or_default() {
            if !names.contains(&dep) {
                names.push(dep);
            }
        }
    }
    for pack in names {
        match store::load_local(out, &pack) {
            Ok(files) => {
                if !files.is_empty() {
                    info!(pack = %pack, entries = files.len(), "reusing local entries");
                }
                for file in files {
                    m.add_local_entry(&pack, &file.name, file.checksum, file.data);
                }
            }
            Err(e) => warn!(pack = %pack, error = %e, "local copy ignored"),
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> anyhow::Result<Args> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn pack_names_with_optional_priority() {
        let a = args(&["base", "level1=5", "--serve"]).unwrap();
        assert!(a.serve);
        assert_eq!(
            a.packs,
            vec![("base".to_string(), 1.0), ("level1".to_string(), 5.0)]
        );
    }

    #[test]
    fn config_flag_takes_a_path() {
        let a = args(&["-c", "/tmp/pf.toml", "base"]).unwrap();
        assert_eq!(a.config, Some(PathBuf::from("/tmp/pf.toml")));
        assert!(args(&["--config"]).is_err());
    }

    #[test]
    fn bad_input_is_rejected() {
        assert!(args(&["--frobnicate"]).is_err());
        assert!(args(&["base=high"]).is_err());
    }

    #[test]
    fn remove_collects_names() {
        let a = args(&["--remove", "base", "--remove", "level1"]).unwrap();
        assert_eq!(a.remove, vec!["base".to_string(), "level1".to_string()]);
        assert!(a.packs.is_empty());
        assert!(args(&["--remove"]).is_err());
    }
}
