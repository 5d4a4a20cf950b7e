//! Counter-store key generation for a rate-limited resource.

use super::window::Window;

/// Key namespace shared by every process limiting the same resource.
///
/// Layout: `ratelimit:<resource>:config`, `ratelimit:<resource>:<window>:count`
/// and `ratelimit:<resource>:total:count`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuotaKeys {
    base: String,
}

impl QuotaKeys {
    /// Create the key namespace for a resource.
    pub fn new(resource: &str) -> Self {
        Self {
            base: format!("ratelimit:{}", resource),
        }
    }

    /// Key holding the cached JSON quota configuration.
    pub fn config(&self) -> String {
        format!("{}:config", self.base)
    }

    /// Key holding the count for one window.
    pub fn window(&self, window: Window) -> String {
        format!("{}:{}:count", self.base, window.as_str())
    }

    /// Key holding the lifetime request total.
    pub fn total(&self) -> String {
        format!("{}:total:count", self.base)
    }
}

impl std::fmt::Display for QuotaKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.base)
    }
}
