//! Logical channel identities

use std::fmt;

/// One logical real-time stream.
///
/// `Notify` is the per-user singleton stream; `Contest` streams are shared by
/// every consumer looking at the same contest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    Notify,
    Contest(String),
}

impl Channel {
    pub fn contest(slug: impl Into<String>) -> Self {
        Self::Contest(slug.into())
    }

    /// Unencoded path, for display. Addresses are built from
    /// [`segments`](Self::segments).
    pub fn path(&self) -> String {
        format!("/{}/", self.segments().join("/"))
    }

    /// Path segments appended to the configured base address. The slug is
    /// always a single segment.
    pub fn segments(&self) -> Vec<&str> {
        match self {
            Self::Notify => vec!["ws", "notify"],
            Self::Contest(slug) => vec!["ws", "contests", slug],
        }
    }

    /// False for slugs that cannot be carried as one path segment
    pub fn is_addressable(&self) -> bool {
        match self {
            Self::Notify => true,
            Self::Contest(slug) => !matches!(slug.as_str(), "" | "." | ".."),
        }
    }

    pub fn contest_slug(&self) -> Option<&str> {
        match self {
            Self::Notify => None,
            Self::Contest(slug) => Some(slug),
        }
    }

    pub fn is_notify(&self) -> bool {
        matches!(self, Self::Notify)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Notify => write!(f, "notify"),
            Self::Contest(slug) => write!(f, "contest:{}", slug),
        }
    }
}
