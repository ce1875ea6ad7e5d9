use chrono::Utc;

pub const APP_NAME: &str = "lanchat_sync";

/// Message timestamps are whole seconds since the Unix epoch.
pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}
