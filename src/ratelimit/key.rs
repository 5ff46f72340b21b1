//! Rate-limit key derivation and handling.

use std::net::IpAddr;

/// The identity a quota is tracked against.
///
/// Authenticated principals take precedence over network addresses. Requests
/// that carry neither share a single bucket, so anonymous traffic without a
/// resolvable address is still limited.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateLimitKey {
    /// An authenticated principal, optionally on a named tier
    Principal {
        /// Stable principal identifier
        id: String,
        /// Tier name used to look up a limit override
        tier: Option<String>,
    },
    /// A client network address
    Address(IpAddr),
    /// No principal and no address could be determined
    Unidentified,
}

impl RateLimitKey {
    /// Create a key for an authenticated principal.
    pub fn principal(id: impl Into<String>, tier: Option<String>) -> Self {
        Self::Principal {
            id: id.into(),
            tier,
        }
    }

    /// The tier this key belongs to, if any.
    pub fn tier(&self) -> Option<&str> {
        match self {
            Self::Principal { tier, .. } => tier.as_deref(),
            _ => None,
        }
    }

    /// The category reported in rejections: the tier name, or the key kind.
    pub fn category(&self) -> &str {
        match self {
            Self::Principal { tier: Some(tier), .. } => tier,
            Self::Principal { tier: None, .. } => "authenticated",
            Self::Address(_) | Self::Unidentified => "anonymous",
        }
    }

    /// Convert the key to the string form used by the window stores.
    ///
    /// The tier is not part of the storage key; a principal keeps one window
    /// across tier changes.
    pub fn to_storage_key(&self) -> String {
        match self {
            Self::Principal { id, .. } => format!("user:{}", id),
            Self::Address(ip) => format!("ip:{}", ip),
            Self::Unidentified => "anonymous".to_string(),
        }
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_storage_key())
    }
}
