//! Wire format for the `/ws` endpoint. Every frame is a single JSON object;
//! device-initiated frames carry a `cmd` tag, server replies carry `ret`
//! equal to the originating tag plus a boolean `result`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct LogRecord {
    pub enrollid: i64,
    pub time: String,
    #[serde(default)]
    pub note: Option<LogNote>,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogNote {
    #[serde(default)]
    pub msg: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegFrame {
    pub sn: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendUserFrame {
    pub sn: String,
    pub enrollid: i64,
    pub backupnum: i64,
    pub name: String,
    #[serde(default)]
    pub admin: bool,
    pub record: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendLogFrame {
    pub sn: String,
    pub record: Vec<LogRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PingFrame {
    pub ts: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminAddUserFrame {
    #[serde(rename = "deviceSn")]
    pub device_sn: String,
    pub name: String,
    #[serde(default, rename = "isAdmin")]
    pub is_admin: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminDeleteUserFrame {
    #[serde(rename = "enrollId")]
    pub enroll_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminSetActiveFrame {
    #[serde(rename = "enrollId")]
    pub enroll_id: i64,
    #[serde(rename = "isActive")]
    pub is_active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminGetUserFrame {
    #[serde(rename = "enrollId")]
    pub enroll_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminSearchUserByNameFrame {
    pub name: String,
}

/// Telemetry published to every connected operator after a recognition
/// attempt, successful or not.
#[derive(Debug, Clone, Serialize)]
pub struct LiveScanTelemetry {
    pub ret: &'static str,
    #[serde(rename = "deviceSn")]
    pub device_sn: String,
    #[serde(rename = "deviceIp")]
    pub device_ip: String,
    pub time: String,
    pub matched: bool,
    #[serde(rename = "matchScore")]
    pub match_score: f32,
    #[serde(rename = "enrollId")]
    pub enroll_id: i64,
    #[serde(rename = "userName")]
    pub user_name: String,
    #[serde(rename = "isActive")]
    pub is_active: bool,
    #[serde(rename = "hasFace")]
    pub has_face: bool,
    pub liveness: Option<LivenessTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LivenessTelemetry {
    #[serde(rename = "Score")]
    pub score: f32,
    #[serde(rename = "Prob")]
    pub prob: f32,
    #[serde(rename = "TimeMs")]
    pub time_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollCompleteTelemetry {
    pub ret: &'static str,
    #[serde(rename = "enrollId")]
    pub enroll_id: i64,
    pub username: String,
    #[serde(rename = "deviceSn")]
    pub device_sn: String,
}

pub fn cloudtime_now() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}
