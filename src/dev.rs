//! Development helpers: live reload of the static assets and browser launch

use anyhow::{Context, Result};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::time::Duration;
use tokio::sync::broadcast;

/// Quiet period before a burst of file events becomes one reload
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(200);

/// Watches the asset directory and announces changes
///
/// Every subscriber of the broadcast channel receives one `()` per settled
/// burst of changes. Watching stops when this value is dropped.
pub struct ReloadWatcher {
    _watcher: RecommendedWatcher,
}

impl ReloadWatcher {
    pub fn spawn(dir: &Path, reload_tx: broadcast::Sender<()>) -> Result<Self> {
        let (tx, mut rx) = tokio::sync::mpsc::channel(256);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                if is_content_change(&event.kind) {
                    let _ = tx.blocking_send(());
                }
            }
        })?;
        watcher
            .watch(dir, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", dir.display()))?;

        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                // Swallow the rest of the burst
                while let Ok(Some(())) = tokio::time::timeout(RELOAD_DEBOUNCE, rx.recv()).await {}
                tracing::debug!("Static assets changed, reloading clients");
                // No subscribers is fine
                let _ = reload_tx.send(());
            }
        });

        tracing::info!("Watching {} for changes", dir.display());
        Ok(Self { _watcher: watcher })
    }
}

fn is_content_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Open `url` in the default browser; failure is only logged
pub fn launch_browser(url: &str) {
    match webbrowser::open(url) {
        Ok(()) => tracing::info!("Opened {} in browser", url),
        Err(e) => tracing::warn!("Failed to open browser at {}: {}", url, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind};
    use tempfile::TempDir;

    #[test]
    fn test_only_content_changes_count() {
        assert!(is_content_change(&EventKind::Create(CreateKind::File)));
        assert!(!is_content_change(&EventKind::Access(AccessKind::Any)));
    }

    #[tokio::test]
    async fn test_watcher_starts_on_existing_dir() {
        let dir = TempDir::new().unwrap();
        let (tx, _rx) = broadcast::channel(4);
        assert!(ReloadWatcher::spawn(dir.path(), tx.clone()).is_ok());
        assert!(ReloadWatcher::spawn(&dir.path().join("missing"), tx).is_err());
    }
}
