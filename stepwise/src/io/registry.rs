//! Tracks detached processes so they can be stopped when the agent exits.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::exit_codes;
use crate::io::detached::{self, ProcessControl, ProcessHandle};

/// Shared set of live detached processes, keyed by pid.
#[derive(Debug, Clone)]
pub struct ProcessRegistry {
    handles: Arc<Mutex<HashMap<u32, ProcessHandle>>>,
    control: ProcessControl,
}

impl ProcessRegistry {
    pub fn new(control: ProcessControl) -> Self {
        Self {
            handles: Arc::new(Mutex::new(HashMap::new())),
            control,
        }
    }

    pub fn register(&self, handle: ProcessHandle) {
        self.lock().insert(handle.pid, handle);
    }

    pub fn unregister(&self, pid: u32) -> Option<ProcessHandle> {
        self.lock().remove(&pid)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Registered handles, ordered by pid.
    pub fn handles(&self) -> Vec<ProcessHandle> {
        let mut handles: Vec<ProcessHandle> = self.lock().values().cloned().collect();
        handles.sort_by_key(|handle| handle.pid);
        handles
    }

    /// Registered handles whose process is still alive.
    pub fn running(&self) -> Vec<ProcessHandle> {
        self.handles()
            .into_iter()
            .filter(|handle| self.control.is_running(handle))
            .collect()
    }

    /// Stop every registered process that is still running, remove the files
    /// of every process that is gone, and empty the registry. Returns how
    /// many were stopped.
    pub fn sweep(&self) -> usize {
        let handles: Vec<ProcessHandle> = self.lock().drain().map(|(_, handle)| handle).collect();
        let mut stopped = 0;
        for handle in &handles {
            if self.control.stop(handle) {
                stopped += 1;
            }
            if self.control.is_running(handle) {
                warn!(pid = handle.pid, "process still running, keeping its files");
                continue;
            }
            discard_files(handle);
        }
        if stopped > 0 {
            info!(stopped, "stopped detached processes");
        }
        stopped
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, ProcessHandle>> {
        match self.handles.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Remove a finished process's script, log and pid file. Failures are logged.
pub fn discard_files(handle: &ProcessHandle) {
    if let Err(err) = detached::cleanup(handle) {
        warn!(pid = handle.pid, err = %format!("{err:#}"), "could not remove process files");
    }
}

/// Sweeps the registry when dropped, including during unwinding.
pub struct SweepOnDrop(pub ProcessRegistry);

impl Drop for SweepOnDrop {
    fn drop(&mut self) {
        self.0.sweep();
    }
}

/// Sweep the registry and exit on ctrl-c, and on SIGTERM or SIGHUP on Unix.
pub fn install_shutdown_hooks(registry: &ProcessRegistry) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;
    let registry = registry.clone();
    thread::Builder::new()
        .name("stepwise-signals".to_string())
        .spawn(move || {
            let signal = match runtime.block_on(shutdown_signal()) {
                Ok(signal) => signal,
                Err(err) => {
                    warn!(err = %format!("{err:#}"), "signal handling unavailable");
                    return;
                }
            };
            warn!(signal, "shutting down");
            let stopped = registry.sweep();
            if stopped > 0 {
                eprintln!("stopped {stopped} detached process(es)");
            }
            std::process::exit(exit_codes::INTERRUPTED);
        })
        .context("spawn signal thread")?;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate()).context("listen for SIGTERM")?;
    let mut hangup = signal(SignalKind::hangup()).context("listen for SIGHUP")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("listen for ctrl-c")?;
            Ok("interrupt")
        }
        _ = terminate.recv() => Ok("terminate"),
        _ = hangup.recv() => Ok("hangup"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .context("listen for ctrl-c")?;
    Ok("interrupt")
}
