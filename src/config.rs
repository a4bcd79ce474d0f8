use std::path::PathBuf;
use std::time::Duration;

use crate::workers::WorkerKind;

/// Runtime configuration, assembled from CLI arguments in `main`.
/// Every bound here exists so that a misbehaving worker or a stalled
/// client cannot grow server memory or hold a process forever.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Interpreter used to run worker scripts.
    pub python_bin: String,
    /// Directory containing the worker scripts.
    pub workers_dir: PathBuf,
    /// Maximum worker run time before it is killed.
    pub worker_timeout_secs: u64,
    /// Cap on a buffered partial stdout line; overflow is fatal for
    /// that worker.
    pub stdout_line_limit: usize,
    /// Bytes of worker stderr retained for error reporting.
    pub stderr_tail_bytes: usize,
    /// Outbound WebSocket queue depth; a client that cannot drain this
    /// many messages is disconnected.
    pub outbound_queue_depth: usize,
    /// Number of generated roadmaps retained in the history store.
    pub roadmap_history_capacity: usize,
}

impl Config {
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn worker_script(&self, kind: WorkerKind) -> PathBuf {
        self.workers_dir.join(kind.script_name())
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            python_bin: "python3".to_string(),
            workers_dir: PathBuf::from("./workers"),
            worker_timeout_secs: 600,
            stdout_line_limit: 1024 * 1024,
            stderr_tail_bytes: 4096,
            outbound_queue_depth: 256,
            roadmap_history_capacity: 100,
        }
    }
}
