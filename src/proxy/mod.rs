pub mod context;

use crate::error::SecurityError;
use crate::monitoring::MetricsCollector;
use crate::security::{
    ip_in_networks, SecurityDecision, SecurityPipeline, SecurityRequest, CSRF_TOKEN_HEADER,
};
use async_trait::async_trait;
use bytes::Bytes;
use context::ProxyContext;
use ipnetwork::IpNetwork;
use log::{error, info, warn};
use pingora::http::ResponseHeader;
use pingora::prelude::*;
use pingora::upstreams::peer::HttpPeer;
use pingora_proxy::{ProxyHttp, Session};
use serde_json::json;
use std::sync::Arc;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Client address for a connection from `peer`.
///
/// `X-Forwarded-For` is only honoured when `peer` is a trusted proxy. The
/// rightmost hop that is not itself trusted is the client; a malformed hop
/// falls back to `peer`.
pub fn resolve_client_ip(
    peer: Option<&str>,
    forwarded_for: Option<&str>,
    trusted: &[IpNetwork],
) -> String {
    let Some(peer) = peer else {
        return "unknown".to_string();
    };
    let Some(xff) = forwarded_for.filter(|_| ip_in_networks(peer, trusted)) else {
        return peer.to_string();
    };

    match xff
        .split(',')
        .map(str::trim)
        .filter(|hop| !hop.is_empty())
        .rev()
        .find(|hop| !ip_in_networks(hop, trusted))
    {
        Some(hop) if hop.parse::<std::net::IpAddr>().is_ok() => hop.to_string(),
        _ => peer.to_string(),
    }
}

/// Reverse proxy that runs every request through a [`SecurityPipeline`]
/// before it reaches the upstream.
pub struct GuardProxy {
    pub pipeline: Arc<SecurityPipeline>,
    pub metrics: Arc<MetricsCollector>,
    pub upstream_addr: (String, u16),
    pub max_body_size: u64,
    pub trusted_proxies: Vec<IpNetwork>,
}

impl GuardProxy {
    pub fn new(
        upstream_addr: (String, u16),
        pipeline: Arc<SecurityPipeline>,
        metrics: Arc<MetricsCollector>,
        max_body_size: u64,
        trusted_proxies: Vec<IpNetwork>,
    ) -> Self {
        Self {
            pipeline,
            metrics,
            upstream_addr,
            max_body_size,
            trusted_proxies,
        }
    }

    fn get_client_ip(&self, session: &Session) -> String {
        let peer = session
            .client_addr()
            .and_then(|addr| addr.as_inet().map(|inet| inet.ip().to_string()));
        let forwarded_for = session
            .req_header()
            .headers
            .get("X-Forwarded-For")
            .and_then(|v| v.to_str().ok());
        resolve_client_ip(peer.as_deref(), forwarded_for, &self.trusted_proxies)
    }

    fn build_request(&self, session: &Session, client_ip: &str) -> SecurityRequest {
        let header = session.req_header();
        let mut request =
            SecurityRequest::new(header.method.as_str(), &header.uri.to_string(), client_ip);

        for (name, value) in header.headers.iter() {
            request =
                request.with_header(name.as_str(), &String::from_utf8_lossy(value.as_bytes()));
        }

        if let Some(len) = header
            .headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
        {
            request = request.with_content_length(len);
        }

        request
    }

    fn count(&self, decision: &SecurityDecision) {
        for threat in &decision.threats {
            self.metrics.increment_threats(threat.threat_type.as_str());
        }
        match decision.block_reason {
            Some(reason) => self.metrics.increment_blocked_requests(reason.as_str()),
            None => self.metrics.increment_allowed_requests(),
        }
    }

    async fn respond_json(
        session: &mut Session,
        status: u16,
        headers: &[(String, String)],
        body: String,
    ) -> Result<()> {
        let mut resp = ResponseHeader::build(status, Some(headers.len() + 2))?;
        for (name, value) in headers {
            resp.insert_header(name.clone(), value.clone())?;
        }
        resp.insert_header("Content-Type", "application/json")?;
        resp.insert_header("Content-Length", body.len().to_string())?;
        session.write_response_header(Box::new(resp), false).await?;
        session
            .write_response_body(Some(Bytes::from(body)), true)
            .await
    }

    /// Write the refusal for `decision` and remember it. Returns true when the
    /// request was refused.
    async fn settle(
        &self,
        session: &mut Session,
        ctx: &mut ProxyContext,
        decision: SecurityDecision,
    ) -> bool {
        self.count(&decision);
        let blocked = decision.blocked;
        if blocked {
            let written = Self::respond_json(
                session,
                decision.status_code(),
                &decision.headers,
                decision.error_body(),
            )
            .await;
            if let Err(e) = written {
                error!("Failed to write block response: {}", e);
            }
        }
        ctx.decision = Some(decision);
        blocked
    }
}

#[async_trait]
impl ProxyHttp for GuardProxy {
    type CTX = ProxyContext;

    fn new_ctx(&self) -> Self::CTX {
        ProxyContext::new(self.max_body_size)
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool>
    where
        Self::CTX: Send + Sync,
    {
        let client_ip = self.get_client_ip(session);
        let mut request = self.build_request(session, &client_ip);

        if let Some(presented) = request.header(API_KEY_HEADER).map(str::to_string) {
            let origin = request.header("origin").map(str::to_string);
            match self
                .pipeline
                .authenticate_api_key(&presented, &client_ip, origin.as_deref())
            {
                Ok(record) => request = request.with_api_key(&record.id),
                Err(e) => {
                    // The blocklist still answers first
                    if let Some(decision) = self.pipeline.admit(&request) {
                        return Ok(self.settle(session, ctx, decision).await);
                    }
                    warn!("API key rejected for {}: {}", client_ip, e);
                    self.metrics.increment_blocked_requests("api_key");
                    let body = json!({ "error": e.to_string() }).to_string();
                    let headers = self.pipeline.headers().to_vec();
                    if let Err(err) = Self::respond_json(session, 401, &headers, body).await {
                        error!("Failed to write API key rejection: {}", err);
                    }
                    return Ok(true);
                }
            }
        }

        // Blocklist, declared size and rate limit run for every request
        // before anything is sent upstream
        if let Some(decision) = self.pipeline.admit(&request) {
            return Ok(self.settle(session, ctx, decision).await);
        }
        if let Some(decision) = self.pipeline.check_presented_csrf(&request) {
            return Ok(self.settle(session, ctx, decision).await);
        }

        let has_body = request.content_length.map(|len| len > 0).unwrap_or(false)
            || session
                .req_header()
                .headers
                .contains_key(http::header::TRANSFER_ENCODING);

        // The scan of a request with a body waits for the whole body
        if has_body {
            ctx.request = Some(request);
            return Ok(false);
        }

        let decision = self.pipeline.inspect(&request);
        ctx.request = Some(request);
        Ok(self.settle(session, ctx, decision).await)
    }

    async fn request_body_filter(
        &self,
        session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<()>
    where
        Self::CTX: Send + Sync,
    {
        if ctx.decision.is_some() {
            return Ok(());
        }

        let mut oversized = None;
        if let Some(chunk) = body {
            if let Err(SecurityError::RequestTooLarge { size, .. }) =
                ctx.body_inspector.append_chunk(chunk)
            {
                oversized = Some(size);
            }
        }

        // Only decide once the body is complete or already over the limit
        if !end_of_stream && oversized.is_none() {
            return Ok(());
        }

        let Some(mut request) = ctx.request.take() else {
            return Ok(());
        };
        match oversized {
            Some(size) => request.content_length = Some(size),
            None => {
                let full_body = ctx.body_inspector.take_body();
                if request.content_length.is_none() {
                    request.content_length = Some(full_body.len() as u64);
                }
                request.body = Some(full_body);
            }
        }

        let decision = self.pipeline.inspect(&request);
        ctx.request = Some(request);

        if self.settle(session, ctx, decision).await {
            // Stop the request from reaching upstream
            return Err(Error::explain(
                ErrorType::Custom("RequestBlocked"),
                "Request blocked by security pipeline",
            ));
        }
        Ok(())
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        if ctx.is_blocked() {
            return Err(Error::new_str("Request blocked by security pipeline"));
        }

        let peer = Box::new(HttpPeer::new(
            (self.upstream_addr.0.as_str(), self.upstream_addr.1),
            false,
            "".to_string(),
        ));
        Ok(peer)
    }

    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        _upstream_request: &mut pingora::http::RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()>
    where
        Self::CTX: Send + Sync,
    {
        // Final check before the request header goes upstream
        if ctx.is_blocked() {
            return Err(Error::new_str(
                "Request blocked by security pipeline before upstream",
            ));
        }
        Ok(())
    }

    async fn response_filter(
        &self,
        _session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()>
    where
        Self::CTX: Send + Sync,
    {
        let Some(decision) = &ctx.decision else {
            return Ok(());
        };
        for (name, value) in &decision.headers {
            upstream_response.insert_header(name.clone(), value.clone())?;
        }
        if let Some(token) = &decision.csrf_token {
            upstream_response.insert_header(CSRF_TOKEN_HEADER, token.clone())?;
        }
        Ok(())
    }

    async fn logging(
        &self,
        session: &mut Session,
        e: Option<&pingora::Error>,
        ctx: &mut Self::CTX,
    ) {
        let response_code = session
            .response_written()
            .map_or(0, |resp| resp.status.as_u16());

        let client_ip = self.get_client_ip(session);
        let method = session.req_header().method.as_str();
        let uri = session.req_header().uri.to_string();

        if let Some(error) = e {
            error!(
                "Request failed - IP: {}, Method: {}, URI: {}, Error: {:?}",
                client_ip, method, uri, error
            );
        } else {
            info!(
                "Request completed - IP: {}, Method: {}, URI: {}, Status: {}",
                client_ip, method, uri, response_code
            );
        }

        if let Some(decision) = &ctx.decision {
            for threat in &decision.threats {
                warn!(
                    "Threat - IP: {}, Type: {}, Severity: {}, Blocked: {}, Description: {}",
                    client_ip,
                    threat.threat_type,
                    threat.severity,
                    threat.blocked,
                    threat.description
                );
            }
        }

        ctx.body_inspector.clear();
    }
}
