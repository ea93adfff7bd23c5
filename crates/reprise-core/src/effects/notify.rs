//! Download notifications.
//!
//! One ongoing progress notification (id 1) summarises running downloads;
//! each download that completes or fails gets its own terminal
//! notification with ids counting up from 2. Notifications are written to
//! `/reprise/notifications/<id>` for the host to render.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use nine_s_shell::Shell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::download::DownloadListener;
use crate::error::log_err;
use crate::models::download::{Download, DownloadState};
use crate::paths;

pub const FOREGROUND_NOTIFICATION_ID: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Progress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub title: String,
    pub message: Option<String>,
    /// Overall percentage, `None` when no running download knows its length.
    pub percent: Option<f32>,
    pub ongoing: bool,
}

pub trait Notifier: Send + Sync {
    fn post(&self, id: u32, notification: &Notification);
}

/// Posts notifications as scrolls.
pub struct ScrollNotifier {
    shell: Arc<Shell>,
}

impl ScrollNotifier {
    pub fn new(shell: Arc<Shell>) -> Self {
        Self { shell }
    }
}

impl Notifier for ScrollNotifier {
    fn post(&self, id: u32, notification: &Notification) {
        log::debug!("reprise: notification {} {:?} {}", id, notification.kind, notification.title);
        match serde_json::to_value(notification) {
            Ok(data) => {
                log_err(self.shell.put(&paths::notification_path(id), data), "post notification");
            }
            Err(e) => log::warn!("reprise: serialize notification failed: {}", e),
        }
    }
}

/// Turns download changes into notifications.
pub struct DownloadNotifications {
    notifier: Arc<dyn Notifier>,
    next_id: AtomicU32,
    last_state: Mutex<HashMap<String, DownloadState>>,
}

impl DownloadNotifications {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            notifier,
            next_id: AtomicU32::new(FOREGROUND_NOTIFICATION_ID + 1),
            last_state: Mutex::new(HashMap::new()),
        }
    }

    /// Refresh the ongoing notification. Posts nothing while idle.
    pub fn refresh_progress(&self, downloads: &[Download]) {
        let running: Vec<&Download> = downloads
            .iter()
            .filter(|d| d.state == DownloadState::Downloading)
            .collect();
        if running.is_empty() {
            return;
        }

        let known: Vec<f32> = running
            .iter()
            .map(|d| d.percent_downloaded())
            .filter(|p| *p >= 0.0)
            .collect();
        let percent = if known.is_empty() {
            None
        } else {
            Some(known.iter().sum::<f32>() / known.len() as f32)
        };

        let title = match running.as_slice() {
            [only] => only.request.title(),
            many => format!("{} downloads", many.len()),
        };
        self.notifier.post(
            FOREGROUND_NOTIFICATION_ID,
            &Notification {
                kind: NotificationKind::Progress,
                title,
                message: None,
                percent,
                ongoing: true,
            },
        );
    }
}

impl DownloadListener for DownloadNotifications {
    fn on_download_changed(&self, download: &Download) {
        let previous = self
            .last_state
            .lock()
            .insert(download.request.id.clone(), download.state);
        if previous == Some(download.state) {
            return;
        }

        let (kind, message) = match download.state {
            DownloadState::Completed => (NotificationKind::Completed, None),
            DownloadState::Failed => (NotificationKind::Failed, download.failure_reason.clone()),
            _ => return,
        };
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.notifier.post(
            id,
            &Notification {
                kind,
                title: download.request.title(),
                message,
                percent: None,
                ongoing: false,
            },
        );
    }

    fn on_download_removed(&self, download: &Download) {
        self.last_state.lock().remove(&download.request.id);
    }
}
