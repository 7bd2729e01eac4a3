//! Process lifecycle: pidfile, runtime paths and termination signals.

use std::path::{Path, PathBuf};

use sysinfo::{Pid, System};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};

pub fn pidfile_path(config: &Config) -> PathBuf {
    config
        .station
        .run_dir
        .join(format!("{}.pid", config.station.name))
}

pub fn control_path(config: &Config) -> PathBuf {
    config
        .station
        .run_dir
        .join(format!("{}.ctl", config.station.name))
}

/// A pidfile removed again on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write our PID to `path`. Refuses if the file names a live process;
    /// a stale file is replaced.
    pub fn create(path: &Path) -> Result<PidFile> {
        if let Ok(text) = std::fs::read_to_string(path) {
            match text.trim().parse::<u32>() {
                Ok(pid) if pid != std::process::id() && process_alive(pid) => {
                    return Err(Error::AlreadyRunning(pid));
                }
                _ => warn!(path = %path.display(), "Replacing stale pidfile"),
            }
        }
        std::fs::write(path, format!("{}\n", std::process::id()))?;
        Ok(PidFile {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn process_alive(pid: u32) -> bool {
    pid != 0 && System::new().refresh_process(Pid::from_u32(pid))
}

/// Cancel `cancel` on SIGTERM or SIGINT.
pub fn spawn_signal_handler(cancel: CancellationToken) -> Result<JoinHandle<()>> {
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = term.recv() => info!("SIGTERM, shutting down"),
            _ = int.recv() => info!("SIGINT, shutting down"),
            () = cancel.cancelled() => return,
        }
        cancel.cancel();
    }))
}
