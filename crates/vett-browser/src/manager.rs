use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use vett_contract::{BrowserType, DeviceProfile};

use crate::driver::{BrowserBackend, BrowserError, BrowserSession};

/// Process-wide browser owner.
///
/// Keeps at most one long-lived process per browser type; sessions are
/// per-run and must be closed by the sequencer on run exit. Shutting the
/// manager down tears the processes down with it.
pub struct BrowserManager {
    backend: Arc<dyn BrowserBackend>,
    launched: Mutex<HashSet<BrowserType>>,
}

impl BrowserManager {
    pub fn new(backend: Arc<dyn BrowserBackend>) -> Self {
        Self {
            backend,
            launched: Mutex::new(HashSet::new()),
        }
    }

    /// Opens a session for one run, launching the process on first use of a
    /// browser type and reusing it afterwards.
    pub async fn open_session(
        &self,
        browser: BrowserType,
        device: &DeviceProfile,
    ) -> Result<Arc<dyn BrowserSession>, BrowserError> {
        let needs_launch = self
            .launched
            .lock()
            .map(|launched| !launched.contains(&browser))
            .unwrap_or(true);
        if needs_launch {
            info!(browser = browser.as_str(), "launching browser process");
            self.backend.launch(browser).await?;
            if let Ok(mut launched) = self.launched.lock() {
                launched.insert(browser);
            }
        } else {
            debug!(browser = browser.as_str(), "reusing browser process");
        }
        self.backend.new_session(browser, device).await
    }

    /// Number of distinct browser processes currently launched.
    pub fn launched_count(&self) -> usize {
        self.launched.lock().map(|launched| launched.len()).unwrap_or(0)
    }

    pub async fn shutdown(&self) {
        self.backend.shutdown().await;
        if let Ok(mut launched) = self.launched.lock() {
            launched.clear();
        }
    }
}
