//! Room identifiers. Every transport path is scoped by one.

use std::fmt;

use crate::sync::TransportPath;

/// Prefix that marks a view-only room link.
pub const VIEW_PREFIX: &str = "view-";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId {
    id: String,
    read_only: bool,
}

impl RoomId {
    /// Parse a link fragment such as `abc123` or `view-abc123`.
    ///
    /// An empty fragment yields a freshly generated collaborative room.
    pub fn parse(fragment: &str) -> Self {
        let fragment = fragment.trim().trim_start_matches('#');
        if let Some(id) = fragment.strip_prefix(VIEW_PREFIX) {
            if !id.is_empty() {
                return Self {
                    id: id.to_string(),
                    read_only: true,
                };
            }
        }
        if fragment.is_empty() {
            return Self::generate();
        }
        Self {
            id: fragment.to_string(),
            read_only: false,
        }
    }

    pub fn generate() -> Self {
        let id: String = uuid::Uuid::new_v4().simple().to_string().chars().take(6).collect();
        Self {
            id,
            read_only: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Fragment for a collaborative link to this room.
    pub fn share_fragment(&self) -> String {
        self.id.clone()
    }

    /// Fragment for a view-only link to this room.
    pub fn view_fragment(&self) -> String {
        format!("{VIEW_PREFIX}{}", self.id)
    }

    pub fn root(&self, namespace: &str) -> TransportPath {
        TransportPath::from_segments([namespace, self.id.as_str()])
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.read_only {
            write!(f, "{} (view only)", self.id)
        } else {
            f.write_str(&self.id)
        }
    }
}
