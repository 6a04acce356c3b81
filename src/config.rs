use std::path::PathBuf;

/// Application-level constants
pub const APP_NAME: &str = "DentalDesk";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get the application data directory
/// ~/DentalDesk/ on all platforms (user-visible, per design requirement)
pub fn app_data_dir() -> PathBuf {
    let home = dirs::home_dir().expect("Cannot determine home directory");
    home.join("DentalDesk")
}

/// Get the path of the clinic database file
pub fn database_path() -> PathBuf {
    app_data_dir().join("dentaldesk.db")
}

/// Get the backups directory (used by the host's backup/restore utilities)
pub fn backups_dir() -> PathBuf {
    app_data_dir().join("backups")
}

/// Default tracing filter when RUST_LOG is unset
pub fn default_log_filter() -> &'static str {
    "info,dentaldesk=debug"
}
