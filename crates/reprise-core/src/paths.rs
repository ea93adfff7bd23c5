//! reprise path conventions over 9S.
//!
//! Pure functions mapping engine concepts to scroll paths.

// ---------------------------------------------------------------------------
// Players (event channel mirror)
// ---------------------------------------------------------------------------

pub fn player_event_path(player_id: &str) -> String {
    format!("/reprise/players/{}/event", player_id)
}

pub const PLAYERS_PREFIX: &str = "/reprise/players";

// ---------------------------------------------------------------------------
// Downloads (persistent download index)
// ---------------------------------------------------------------------------

pub fn download_path(id: &str) -> String {
    format!("/reprise/downloads/{}", id)
}

pub const DOWNLOADS_PREFIX: &str = "/reprise/downloads";

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

pub fn notification_path(id: u32) -> String {
    format!("/reprise/notifications/{}", id)
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

pub const SETTINGS_ENGINE: &str = "/reprise/settings/engine";

// ---------------------------------------------------------------------------
// Watch patterns
// ---------------------------------------------------------------------------

pub const WATCH_ALL: &str = "/reprise/**";
