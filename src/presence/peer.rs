use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::SyncConfig;

/// Collaborator colors, handed out in order.
pub const PALETTE: [&str; 20] = [
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#96CEB4", "#FECA57", "#FF9FF3", "#54A0FF", "#5F27CD",
    "#00D2D3", "#FF9F43", "#10AC84", "#EE5A24", "#0ABDE3", "#FFC312", "#C44569", "#F8B500",
    "#7D5BA6", "#20BF6B", "#FA8231", "#8395A7",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub join_time: i64,
    #[serde(default)]
    pub active_file: Option<String>,
    #[serde(default)]
    pub last_active: Option<i64>,
    /// Set while the peer's tab is hidden
    #[serde(default)]
    pub potentially_left: Option<i64>,
    /// Set while the peer's window is unfocused
    #[serde(default)]
    pub window_blurred: Option<i64>,
}

impl Peer {
    pub fn new(id: impl Into<String>, name: impl Into<String>, color: impl Into<String>, now: i64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            color: color.into(),
            join_time: now,
            active_file: None,
            last_active: Some(now),
            potentially_left: None,
            window_blurred: None,
        }
    }

    /// Parse a replicated record. Anything without a non-empty `id` and `name`
    /// counts as absent.
    pub fn from_record(record: &Value) -> Option<Self> {
        let peer: Peer = serde_json::from_value(record.clone()).ok()?;
        if peer.id.is_empty() || peer.name.is_empty() {
            return None;
        }
        Some(peer)
    }

    pub fn to_record(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn eviction_reason(&self, now: i64, windows: &LivenessWindows) -> Option<EvictReason> {
        if self
            .last_active
            .is_some_and(|at| now - at > windows.stale_after_ms)
        {
            return Some(EvictReason::Stale);
        }
        if self
            .potentially_left
            .is_some_and(|at| now - at > windows.hidden_grace_ms)
        {
            return Some(EvictReason::Hidden);
        }
        if self
            .window_blurred
            .is_some_and(|at| now - at > windows.blurred_grace_ms)
        {
            return Some(EvictReason::Blurred);
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    /// No heartbeat within the stale window
    Stale,
    /// Tab hidden longer than the grace period
    Hidden,
    /// Window unfocused longer than the grace period
    Blurred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessWindows {
    pub stale_after_ms: i64,
    pub hidden_grace_ms: i64,
    pub blurred_grace_ms: i64,
}

impl From<&SyncConfig> for LivenessWindows {
    fn from(config: &SyncConfig) -> Self {
        Self {
            stale_after_ms: config.stale_after_ms,
            hidden_grace_ms: config.hidden_grace_ms,
            blurred_grace_ms: config.blurred_grace_ms,
        }
    }
}

impl Default for LivenessWindows {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

/// First palette color nobody uses yet; once all are taken, a stable pick
/// derived from the peer id.
pub fn pick_color<'a>(used: impl IntoIterator<Item = &'a str>, peer_id: &str) -> String {
    let used: Vec<&str> = used.into_iter().collect();
    if let Some(free) = PALETTE.iter().find(|color| !used.contains(*color)) {
        return free.to_string();
    }
    let hash = peer_id
        .bytes()
        .fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(b as u32));
    PALETTE[hash as usize % PALETTE.len()].to_string()
}
