use crate::security::{BodyInspector, SecurityDecision, SecurityRequest};

/// Per-request state carried across the proxy phases.
pub struct ProxyContext {
    pub request: Option<SecurityRequest>,
    pub body_inspector: BodyInspector,
    pub decision: Option<SecurityDecision>,
}

impl ProxyContext {
    pub fn new(max_body_size: u64) -> Self {
        Self {
            request: None,
            body_inspector: BodyInspector::new(max_body_size),
            decision: None,
        }
    }

    /// True once a decision refused the request.
    pub fn is_blocked(&self) -> bool {
        self.decision.as_ref().map(|d| d.blocked).unwrap_or(false)
    }
}
