// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Resource guard of the agent process.
//!
//! The watchdog samples resident memory, user CPU time and open connections on a fixed
//! interval. Going over any limit is fatal: the agent is expected to exit and be restarted rather than keep
//! running degraded.

use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Clock ticks per second of `/proc/<pid>/stat` times (`USER_HZ`).
const CLOCK_TICKS_PER_SEC: u64 = 100;

#[derive(Clone, Debug, PartialEq)]
pub struct WatchdogConfig {
    /// Resident memory limit, in bytes.
    pub max_memory: f64,
    /// User CPU limit, as a fraction of one core.
    pub max_cpu: f64,
    /// Open socket limit.
    pub max_connections: u64,
    pub interval: Duration,
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum WatchdogError {
    #[error("exceeded max memory (current={used}, max={max})")]
    MemoryExceeded { used: u64, max: f64 },

    #[error("exceeded max cpu (current={used:.3}, max={max})")]
    CpuExceeded { used: f64, max: f64 },

    #[error("exceeded max connections (current={used}, max={max})")]
    ConnectionsExceeded { used: u64, max: u64 },
}

/// Source of process resource usage. `None` means the platform cannot tell.
pub trait ResourceUsage: Send + Sync {
    fn resident_memory(&self) -> Option<u64>;
    fn user_cpu_time(&self) -> Option<Duration>;
    fn open_connections(&self) -> Option<u64>;
}

/// Reads usage of the current process from `/proc/self`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcUsage;

impl ResourceUsage for ProcUsage {
    fn resident_memory(&self) -> Option<u64> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        parse_vm_rss(&status)
    }

    fn user_cpu_time(&self) -> Option<Duration> {
        let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
        parse_utime(&stat)
    }

    fn open_connections(&self) -> Option<u64> {
        let entries = std::fs::read_dir("/proc/self/fd").ok()?;
        let sockets = entries
            .filter_map(Result::ok)
            .filter_map(|entry| std::fs::read_link(entry.path()).ok())
            .filter(|target| is_socket_link(&target.to_string_lossy()))
            .count();
        Some(sockets as u64)
    }
}

fn is_socket_link(target: &str) -> bool {
    target.starts_with("socket:")
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

fn parse_utime(stat: &str) -> Option<Duration> {
    // the command name may contain spaces, fields are counted after its closing paren
    let after_comm = &stat[stat.rfind(')')? + 1..];
    let ticks: u64 = after_comm.split_whitespace().nth(11)?.parse().ok()?;
    Some(Duration::from_millis(ticks * 1000 / CLOCK_TICKS_PER_SEC))
}

struct CpuSample {
    at: Instant,
    user: Duration,
}

pub struct Watchdog<P: ResourceUsage = ProcUsage> {
    config: WatchdogConfig,
    source: P,
    last_cpu: Mutex<Option<CpuSample>>,
}

impl Watchdog<ProcUsage> {
    pub fn new(config: WatchdogConfig) -> Self {
        Self::with_source(config, ProcUsage)
    }
}

impl<P: ResourceUsage> Watchdog<P> {
    pub fn with_source(config: WatchdogConfig, source: P) -> Self {
        Self {
            config,
            source,
            last_cpu: Mutex::new(None),
        }
    }

    /// Samples usage now. CPU usage is averaged since the previous check, so the first
    /// check only verifies memory.
    pub fn check(&self) -> Result<(), WatchdogError> {
        self.check_at(Instant::now())
    }

    fn check_at(&self, now: Instant) -> Result<(), WatchdogError> {
        if let Some(used) = self.source.resident_memory() {
            debug!("Watchdog: resident memory {used} bytes");
            if used as f64 > self.config.max_memory {
                return Err(WatchdogError::MemoryExceeded {
                    used,
                    max: self.config.max_memory,
                });
            }
        }

        if let Some(used) = self.source.open_connections() {
            debug!("Watchdog: {used} open connections");
            if used > self.config.max_connections {
                return Err(WatchdogError::ConnectionsExceeded {
                    used,
                    max: self.config.max_connections,
                });
            }
        }

        let Some(user) = self.source.user_cpu_time() else {
            return Ok(());
        };
        let previous = match self.last_cpu.lock() {
            Ok(mut last) => last.replace(CpuSample { at: now, user }),
            Err(_) => None,
        };
        let Some(previous) = previous else {
            return Ok(());
        };
        let wall = now.saturating_duration_since(previous.at);
        if wall.is_zero() {
            return Ok(());
        }
        let used = user.saturating_sub(previous.user).as_secs_f64() / wall.as_secs_f64();
        debug!("Watchdog: user cpu {used:.3}");
        if used > self.config.max_cpu {
            return Err(WatchdogError::CpuExceeded {
                used,
                max: self.config.max_cpu,
            });
        }
        Ok(())
    }

    /// Checks on every interval until cancelled, returning the first breach.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), WatchdogError> {
        let mut ticker = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    if let Err(e) = self.check() {
                        error!("Watchdog: {e}");
                        return Err(e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    struct FixedUsage {
        memory: Option<u64>,
        cpu: Mutex<Vec<Duration>>,
        connections: Option<u64>,
    }

    impl FixedUsage {
        fn new(memory: Option<u64>, cpu: &[u64]) -> Self {
            let mut samples: Vec<Duration> = cpu.iter().map(|ms| Duration::from_millis(*ms)).collect();
            samples.reverse();
            Self {
                memory,
                cpu: Mutex::new(samples),
                connections: None,
            }
        }

        fn with_connections(mut self, connections: u64) -> Self {
            self.connections = Some(connections);
            self
        }
    }

    impl ResourceUsage for FixedUsage {
        fn resident_memory(&self) -> Option<u64> {
            self.memory
        }

        fn user_cpu_time(&self) -> Option<Duration> {
            self.cpu.lock().unwrap().pop()
        }

        fn open_connections(&self) -> Option<u64> {
            self.connections
        }
    }

    fn config() -> WatchdogConfig {
        WatchdogConfig {
            max_memory: 1_000.0,
            max_cpu: 0.5,
            max_connections: 200,
            interval: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_memory_breach() {
        let watchdog = Watchdog::with_source(config(), FixedUsage::new(Some(2_000), &[]));
        let err = watchdog.check().unwrap_err();
        assert_eq!(
            err,
            WatchdogError::MemoryExceeded {
                used: 2_000,
                max: 1_000.0
            }
        );
        assert!(err.to_string().starts_with("exceeded max memory"));
    }

    #[test]
    fn test_connections_breach() {
        let usage = FixedUsage::new(Some(10), &[]).with_connections(200);
        let at_limit = Watchdog::with_source(config(), usage);
        assert_eq!(at_limit.check(), Ok(()));

        let usage = FixedUsage::new(Some(10), &[]).with_connections(201);
        let over = Watchdog::with_source(config(), usage);
        let err = over.check().unwrap_err();
        assert_eq!(
            err,
            WatchdogError::ConnectionsExceeded {
                used: 201,
                max: 200
            }
        );
        assert_eq!(
            err.to_string(),
            "exceeded max connections (current=201, max=200)"
        );
    }

    #[test]
    fn test_cpu_is_averaged_between_checks() {
        let watchdog =
            Watchdog::with_source(config(), FixedUsage::new(Some(10), &[0, 400, 1_400]));
        let start = Instant::now();
        assert_eq!(watchdog.check_at(start), Ok(()));
        // 400ms of user time over one second
        assert_eq!(watchdog.check_at(start + Duration::from_secs(1)), Ok(()));
        // 1s of user time over one second
        assert!(matches!(
            watchdog.check_at(start + Duration::from_secs(2)),
            Err(WatchdogError::CpuExceeded { .. })
        ));
    }

    #[test]
    fn test_unknown_usage_is_never_a_breach() {
        let watchdog = Watchdog::with_source(config(), FixedUsage::new(None, &[]));
        assert_eq!(watchdog.check(), Ok(()));
        assert_eq!(watchdog.check(), Ok(()));
    }

    #[test]
    fn test_parse_proc_files() {
        let status = "Name:\ttrace-agent\nVmPeak:\t  20000 kB\nVmRSS:\t   1234 kB\n";
        assert_eq!(parse_vm_rss(status), Some(1234 * 1024));
        let stat = "4242 (trace agent) S 1 4242 4242 0 -1 4194560 100 0 0 0 250 30 0 0 20 0 4";
        assert_eq!(parse_utime(stat), Some(Duration::from_millis(2_500)));
        assert_eq!(parse_utime("garbage"), None);
        assert!(is_socket_link("socket:[123456]"));
        assert!(!is_socket_link("/var/log/trace-agent.log"));
        assert!(!is_socket_link("pipe:[42]"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_proc_counts_open_sockets() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (_server, _) = listener.accept().unwrap();
        assert!(ProcUsage.open_connections().unwrap() >= 3);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_run_returns_first_breach() {
        let watchdog = Watchdog::with_source(config(), FixedUsage::new(Some(5_000), &[]));
        let result = watchdog.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(WatchdogError::MemoryExceeded { .. })));
        assert!(logs_contain("Watchdog: exceeded max memory"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let watchdog = Watchdog::with_source(config(), FixedUsage::new(Some(10), &[]));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(watchdog.run(cancel).await, Ok(()));
    }
}
