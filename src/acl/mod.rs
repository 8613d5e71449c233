//! Host based access policy shared by the plaintext and the tunneling paths.

/// Returns whether a request for `host` must be refused.
///
/// A host is forbidden when `avoid` is non-empty and appears anywhere in
/// `host`. The host is matched as the client sent it, port included.
pub fn is_forbidden(host: &str, avoid: &str) -> bool {
    !avoid.is_empty() && host.contains(avoid)
}

/// The avoid pattern the proxy was started with.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    avoid: String,
}

impl AccessPolicy {
    pub fn new(avoid: impl Into<String>) -> Self {
        Self { avoid: avoid.into() }
    }

    pub fn is_forbidden(&self, host: &str) -> bool {
        is_forbidden(host, &self.avoid)
    }

    pub fn avoid(&self) -> &str {
        &self.avoid
    }
}
