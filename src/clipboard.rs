//! Clipboard polling.
//!
//! The poller runs off the UI thread and only ever talks to the UI through a
//! channel: every time the clipboard holds new text it sends the replacement
//! input value, and the UI applies it in `update`.

use iced::futures::channel::mpsc;
use iced::futures::SinkExt;
use std::sync::Arc;
use std::time::Duration;

/// Anything that can hand out the current clipboard text.
///
/// `None` covers both "no text on the clipboard" and "clipboard unavailable".
pub trait ClipboardSource: Send + Sync + 'static {
    fn read_text(&self) -> Option<String>;
}

/// System clipboard through arboard. A fresh handle is opened for every read
/// so a clipboard owner going away between polls does not wedge us.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClipboard;

impl ClipboardSource for SystemClipboard {
    fn read_text(&self) -> Option<String> {
        let mut clipboard = match arboard::Clipboard::new() {
            Ok(clipboard) => clipboard,
            Err(e) => {
                tracing::debug!("clipboard unavailable: {}", e);
                return None;
            }
        };

        match clipboard.get_text() {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::debug!("clipboard read failed: {}", e);
                None
            }
        }
    }
}

/// Last observed clipboard value plus the suffix glued onto new values.
#[derive(Debug, Clone)]
pub struct ClipboardWatcher {
    snapshot: Option<String>,
    suffix: String,
}

impl ClipboardWatcher {
    pub fn new(suffix: impl Into<String>) -> Self {
        ClipboardWatcher {
            snapshot: None,
            suffix: suffix.into(),
        }
    }

    #[allow(dead_code)]
    pub fn snapshot(&self) -> Option<&str> {
        self.snapshot.as_deref()
    }

    /// Feed one clipboard read. Returns the new input content when the
    /// clipboard changed to something non-empty. Empty and failed reads leave
    /// the snapshot alone.
    pub fn observe(&mut self, current: Option<String>) -> Option<String> {
        let current = current.filter(|text| !text.is_empty())?;

        if self.snapshot.as_deref() == Some(current.as_str()) {
            return None;
        }

        let input = format!("{}{}", current, self.suffix);
        self.snapshot = Some(current);
        Some(input)
    }
}

async fn read_off_thread<C: ClipboardSource>(source: &Arc<C>) -> Option<String> {
    let source = Arc::clone(source);
    match tokio::task::spawn_blocking(move || source.read_text()).await {
        Ok(text) => text,
        Err(e) => {
            tracing::debug!("clipboard read task failed: {}", e);
            None
        }
    }
}

/// Poll `source` every `interval` until the receiving side goes away.
pub async fn poll_loop<C: ClipboardSource>(
    source: Arc<C>,
    mut watcher: ClipboardWatcher,
    interval: Duration,
    mut output: mpsc::Sender<String>,
) {
    tracing::info!("clipboard polling started ({:?} interval)", interval);

    loop {
        let current = read_off_thread(&source).await;

        if let Some(input) = watcher.observe(current) {
            tracing::debug!("clipboard changed ({} chars)", input.chars().count());
            if output.send(input).await.is_err() {
                break;
            }
        }

        tokio::time::sleep(interval).await;
    }

    tracing::info!("clipboard polling stopped");
}
