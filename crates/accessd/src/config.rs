use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// TCP port the `/ws` endpoint listens on.
    pub port: u16,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine similarity threshold for a positive recognition match.
    pub similarity_threshold: f32,
    /// Whether liveness is applied on the recognition (`sendlog`) path.
    pub recognize_with_liveness: bool,
    /// Minimum "real" probability for the anti-spoof network.
    pub liveness_threshold: f32,
    /// Interval between reconciler ticks, in seconds.
    pub reconcile_interval_secs: u64,
    /// Wall-clock bound on a pending enrollment, in seconds.
    pub enrollment_timeout_secs: u64,
    /// Debounce window for attendance writes, in seconds.
    pub attendance_debounce_secs: i64,
    /// Age beyond which an inbound log record is considered stale, in seconds.
    pub log_staleness_secs: i64,
}

impl Config {
    /// Load configuration from `ACCESSD_*` environment variables with
    /// defaults. `cli_port`, the CLI positional argument, overrides the
    /// environment when present.
    pub fn from_env(cli_port: Option<u16>) -> Self {
        let model_dir = std::env::var("ACCESSD_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| visage_core::default_model_dir());

        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("accessd");

        let db_path = std::env::var("ACCESSD_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("accessd.db"));

        Self {
            port: cli_port.unwrap_or_else(|| env_u16("ACCESSD_PORT", 7878)),
            model_dir,
            db_path,
            similarity_threshold: env_f32("ACCESSD_SIMILARITY_THRESHOLD", 0.40),
            recognize_with_liveness: std::env::var("ACCESSD_RECOGNIZE_WITH_LIVENESS")
                .map(|v| v != "0")
                .unwrap_or(true),
            liveness_threshold: env_f32(
                "ACCESSD_LIVENESS_THRESHOLD",
                visage_core::DEFAULT_LIVENESS_THRESHOLD,
            ),
            reconcile_interval_secs: env_u64("ACCESSD_RECONCILE_INTERVAL_SECS", 30),
            enrollment_timeout_secs: env_u64("ACCESSD_ENROLLMENT_TIMEOUT_SECS", 60),
            attendance_debounce_secs: env_u64("ACCESSD_ATTENDANCE_DEBOUNCE_SECS", 20) as i64,
            log_staleness_secs: env_u64("ACCESSD_LOG_STALENESS_SECS", 10) as i64,
        }
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn recognizer_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the anti-spoof liveness model.
    pub fn antispoof_model_path(&self) -> String {
        self.model_dir
            .join("antispoof.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_port_overrides_env() {
        std::env::set_var("ACCESSD_PORT", "1234");
        let cfg = Config::from_env(Some(9999));
        assert_eq!(cfg.port, 9999);
        std::env::remove_var("ACCESSD_PORT");
    }

    #[test]
    fn defaults_match_expected() {
        std::env::remove_var("ACCESSD_SIMILARITY_THRESHOLD");
        std::env::remove_var("ACCESSD_LIVENESS_THRESHOLD");
        let cfg = Config::from_env(None);
        assert_eq!(cfg.similarity_threshold, 0.40);
        assert_eq!(cfg.liveness_threshold, 0.30);
        assert!(cfg.recognize_with_liveness);
        assert_eq!(cfg.reconcile_interval_secs, 30);
        assert_eq!(cfg.enrollment_timeout_secs, 60);
        assert_eq!(cfg.attendance_debounce_secs, 20);
        assert_eq!(cfg.log_staleness_secs, 10);
    }
}
