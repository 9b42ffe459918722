//! Maintenance gate and the sentinel-file poller that drives it.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Process-wide maintenance flag. While active, only commands that allow
/// maintenance are admitted.
#[derive(Debug, Clone, Default)]
pub struct MaintenanceGate {
    active: Arc<AtomicBool>,
}

impl MaintenanceGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Set the flag and return its previous value.
    pub fn set(&self, active: bool) -> bool {
        self.active.swap(active, Ordering::AcqRel)
    }
}

/// Mirror the existence of `path` into `gate` every `interval` until
/// `shutdown` flips. The first check runs immediately.
pub async fn watch_maintenance_file(
    gate: MaintenanceGate,
    path: PathBuf,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(path = %path.display(), ?interval, "maintenance watcher starting");
    loop {
        let present = match tokio::fs::try_exists(&path).await {
            Ok(present) => present,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot stat maintenance file");
                gate.is_active()
            }
        };
        let previous = gate.set(present);
        if previous != present {
            if present {
                info!(path = %path.display(), "maintenance mode entered");
            } else {
                info!(path = %path.display(), "maintenance mode left");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                debug!("maintenance watcher shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_swaps() {
        let gate = MaintenanceGate::new();
        assert!(!gate.is_active());
        assert!(!gate.set(true));
        assert!(gate.is_active());
        assert!(gate.clone().set(false));
        assert!(!gate.is_active());
    }

    #[tokio::test]
    async fn watcher_follows_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("maint");
        let gate = MaintenanceGate::new();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(watch_maintenance_file(
            gate.clone(),
            path.clone(),
            Duration::from_millis(5),
            rx,
        ));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!gate.is_active());

        std::fs::write(&path, b"").unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(gate.is_active());

        std::fs::remove_file(&path).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!gate.is_active());

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
