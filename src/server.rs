use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{error, info, warn};

use crate::config::{Security, ServerConfig, Threading};
use crate::error::{MazurkaError, MazurkaResult};
use crate::metrics::WorkerMetrics;
use crate::router::Router;
use crate::syscalls;
use crate::tls::Acceptor;
use crate::worker::Worker;

/// Server facade: binds, spawns one pinned worker per configured thread,
/// each with its own listener, reactor, and pool.
pub struct Server {
    addr: String,
    cfg: ServerConfig,
}

impl Server {
    pub fn bind(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            cfg: ServerConfig::default(),
        }
    }

    pub fn config(mut self, cfg: ServerConfig) -> Self {
        self.cfg = cfg;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.cfg.threading = Threading::Count(workers);
        self
    }

    /// Serve until ctrl-c (or a handler kills the runtime).
    pub fn serve(self, router: Router) -> MazurkaResult<()> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        if let Err(err) = ctrlc::set_handler(move || {
            flag.store(true, Ordering::Release);
        }) {
            warn!("could not install ctrl-c handler: {}", err);
        }
        self.serve_until(router, shutdown)
    }

    /// Serve until the caller flips `shutdown`. Blocks until every worker
    /// has drained and exited.
    pub fn serve_until(self, router: Router, shutdown: Arc<AtomicBool>) -> MazurkaResult<()> {
        let (host, port) = split_addr(&self.addr)?;
        let cfg = Arc::new(self.cfg);
        let workers = cfg.worker_count();
        let router = Arc::new(router);
        let acceptor = build_acceptor(&cfg)?;

        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        let metrics: Vec<Arc<WorkerMetrics>> =
            (0..workers).map(|_| Arc::new(WorkerMetrics::new())).collect();

        {
            let metrics = metrics.clone();
            let shutdown = shutdown.clone();
            let _ = thread::Builder::new()
                .name("mazurka-metrics".to_string())
                .spawn(move || {
                    let mut ticks = 0u32;
                    while !shutdown.load(Ordering::Acquire) {
                        thread::sleep(Duration::from_secs(1));
                        ticks += 1;
                        if ticks % 5 != 0 {
                            continue;
                        }
                        let mut reqs = 0;
                        let mut active = 0;
                        for m in &metrics {
                            reqs += m.req_count.load(Ordering::Relaxed);
                            active += m.active_conns.load(Ordering::Relaxed);
                        }
                        info!("active connections: {} | total requests: {}", active, reqs);
                    }
                });
        }

        info!("starting {} worker(s) on {}:{}", workers, host, port);

        let mut handles: Vec<thread::JoinHandle<()>> = Vec::with_capacity(workers);
        for i in 0..workers {
            let core_id = if core_ids.is_empty() {
                None
            } else {
                Some(core_ids[i % core_ids.len()])
            };
            let cfg = cfg.clone();
            let router = router.clone();
            let shutdown = shutdown.clone();
            let worker_metrics = metrics[i].clone();
            let acceptor = acceptor.clone();
            let host = host.clone();

            let handle = thread::Builder::new()
                .name(format!("mazurka-worker-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        core_affinity::set_for_current(id);
                    }
                    // A worker that stops — kill, bind failure, fatal error —
                    // takes only itself down. Siblings own their listeners
                    // and keep serving.
                    match syscalls::create_listen_socket(&host, port, cfg.size_backlog) {
                        Ok(listen_fd) => {
                            match Worker::new(i, cfg, router, worker_metrics, listen_fd, acceptor)
                            {
                                Ok(mut worker) => {
                                    if let Err(err) = worker.run(shutdown) {
                                        error!("worker {} exited with error: {}", i, err);
                                    }
                                }
                                Err(err) => error!("worker {} failed to start: {}", i, err),
                            }
                            syscalls::close_fd(listen_fd);
                        }
                        Err(err) => error!("worker {} failed to bind: {}", i, err),
                    }
                })
                .map_err(|e| MazurkaError::Worker(e.to_string()))?;
            handles.push(handle);
        }

        for handle in handles {
            let _ = handle.join();
        }
        shutdown.store(true, Ordering::Release);
        Ok(())
    }
}

fn build_acceptor(cfg: &ServerConfig) -> MazurkaResult<Option<Arc<dyn Acceptor>>> {
    match &cfg.security {
        Security::Plain => Ok(None),
        #[cfg(feature = "tls")]
        Security::Tls {
            cert,
            key,
            cert_name,
            key_name,
        } => {
            let ctx = crate::tls::TlsContext::from_files(cert, key, cert_name, key_name)?;
            Ok(Some(Arc::new(ctx)))
        }
        #[cfg(not(feature = "tls"))]
        Security::Tls { .. } => Err(MazurkaError::Other(
            "TLS requested but the `tls` feature is disabled".to_string(),
        )),
    }
}

fn split_addr(addr: &str) -> MazurkaResult<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| MazurkaError::Addr(addr.to_string()))?;
    let port: u16 = port
        .parse()
        .map_err(|_| MazurkaError::Addr(addr.to_string()))?;
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_splitting() {
        assert_eq!(split_addr("127.0.0.1:8080").unwrap(), ("127.0.0.1".into(), 8080));
        assert_eq!(split_addr(":9000").unwrap(), ("0.0.0.0".into(), 9000));
        assert_eq!(split_addr("[::1]:8443").unwrap(), ("[::1]".into(), 8443));
        assert!(split_addr("no-port").is_err());
        assert!(split_addr("host:not-a-port").is_err());
    }
}
