//! Statistics hooks handed to the proxy by the shell. A capability struct
//! of function fields: no trait objects to subclass, nothing to cycle.

use std::sync::Arc;

type BlockedHook = Arc<dyn Fn(&str, &str) + Send + Sync>;
type AllowedHook = Arc<dyn Fn(&str) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(Option<&str>, &str) + Send + Sync>;
type TlsHandshakeHook = Arc<dyn Fn(&str, bool) + Send + Sync>;

#[derive(Clone)]
pub struct ProxyDelegate {
    /// `(url, rule)` for every request answered with the block page.
    pub on_blocked: BlockedHook,
    /// `(url)` for requests forwarded to origin.
    pub on_allowed: AllowedHook,
    /// `(url, error)`; the url is absent when the failure precedes parsing.
    pub on_error: ErrorHook,
    /// `(domain, ok)` once per client-side TLS termination attempt.
    pub on_tls_handshake: TlsHandshakeHook,
}

impl Default for ProxyDelegate {
    fn default() -> Self {
        Self {
            on_blocked: Arc::new(|_, _| {}),
            on_allowed: Arc::new(|_| {}),
            on_error: Arc::new(|_, _| {}),
            on_tls_handshake: Arc::new(|_, _| {}),
        }
    }
}

impl std::fmt::Debug for ProxyDelegate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyDelegate").finish_non_exhaustive()
    }
}
