use super::signatures::{ScanScope, SignatureCategory, SIGNATURE_CATALOG};
use super::{SecurityRequest, Severity, ThreatRecord, ThreatType};
use crate::clock::{system_clock, SharedClock};
use log::{debug, warn};
use once_cell::sync::Lazy;
use std::borrow::Cow;
use std::collections::HashSet;

/// Headers whose values are never scanned for content signatures.
static SAFE_HEADERS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    let mut set = HashSet::new();
    set.insert("accept");
    set.insert("accept-encoding");
    set.insert("accept-language");
    set.insert("content-type");
    set.insert("content-length");
    set.insert("user-agent");
    set.insert("cache-control");
    set.insert("connection");
    set.insert("upgrade-insecure-requests");
    set.insert("sec-fetch-mode");
    set.insert("sec-fetch-site");
    set.insert("sec-fetch-dest");
    set.insert("sec-ch-ua");
    set.insert("sec-ch-ua-mobile");
    set.insert("sec-ch-ua-platform");
    set.insert("host");
    set.insert("origin");
    set.insert("referer");
    set
});

/// Pattern matcher over URL, headers and body.
///
/// Categories are evaluated independently in catalog order; one input can
/// produce one record per matching category. Blocking is decided by the
/// caller from the aggregate.
pub struct ThreatDetector {
    enabled: bool,
    catalog: &'static [SignatureCategory],
    clock: SharedClock,
}

impl ThreatDetector {
    pub fn new(enabled: bool) -> Self {
        Self::with_clock(enabled, system_clock())
    }

    pub fn with_clock(enabled: bool, clock: SharedClock) -> Self {
        Self {
            enabled,
            catalog: SIGNATURE_CATALOG.as_slice(),
            clock,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Read-only view of the signature catalog.
    pub fn catalog(&self) -> &[SignatureCategory] {
        self.catalog
    }

    pub fn scan(
        &self,
        body: Option<&[u8]>,
        headers: &[(String, String)],
        url: &str,
    ) -> Vec<ThreatRecord> {
        self.scan_from("unknown", body, headers, url)
    }

    pub fn scan_request(&self, request: &SecurityRequest) -> Vec<ThreatRecord> {
        let mut records = self.scan_from(
            &request.identity().key(),
            request.body.as_deref(),
            &request.headers,
            &request.url,
        );

        if let Some(record) = self.check_json_body(request) {
            records.push(record);
        }

        records
    }

    pub fn scan_from(
        &self,
        source: &str,
        body: Option<&[u8]>,
        headers: &[(String, String)],
        url: &str,
    ) -> Vec<ThreatRecord> {
        if !self.enabled {
            return Vec::new();
        }

        let now = self.clock.now();
        let body_text = body.filter(|b| !b.is_empty()).map(String::from_utf8_lossy);
        let header_lines: Vec<String> = headers
            .iter()
            .map(|(name, value)| format!("{}: {}", name.to_ascii_lowercase(), value))
            .collect();

        let mut records = Vec::new();

        for category in self.catalog {
            let hit = match category.scope {
                ScanScope::Content => {
                    Self::match_content(category, url, headers, body_text.as_deref())
                }
                ScanScope::Headers => header_lines.iter().find_map(|line| {
                    category
                        .find(line)
                        .map(|p| (format!("header {}", header_name(line)), p.as_str()))
                }),
            };

            if let Some((location, pattern)) = hit {
                debug!(
                    "Signature {} matched in {} from {}",
                    category.kind.name(),
                    location,
                    source
                );
                records.push(
                    ThreatRecord::new(
                        category.threat_type,
                        category.severity,
                        source,
                        format!("{} detected in {}", category.kind.name(), location),
                        now,
                    )
                    .with_pattern(pattern),
                );
            }
        }

        records
    }

    /// A body declared as JSON that does not parse is treated as hostile.
    fn check_json_body(&self, request: &SecurityRequest) -> Option<ThreatRecord> {
        if !self.enabled {
            return None;
        }

        let is_json = request
            .header("content-type")
            .map(|ct| ct.to_ascii_lowercase().contains("application/json"))
            .unwrap_or(false);
        let body = request.body.as_deref().filter(|b| !b.is_empty())?;
        if !is_json {
            return None;
        }

        match serde_json::from_slice::<serde_json::Value>(body) {
            Ok(_) => None,
            Err(e) => {
                warn!(
                    "Unparseable JSON body from {}: {}",
                    request.identity().key(),
                    e
                );
                Some(ThreatRecord::new(
                    ThreatType::Injection,
                    Severity::Critical,
                    request.identity().key(),
                    format!("Malformed JSON body: {}", e),
                    self.clock.now(),
                ))
            }
        }
    }

    fn match_content<'a>(
        category: &'a SignatureCategory,
        url: &str,
        headers: &[(String, String)],
        body: Option<&str>,
    ) -> Option<(String, &'a str)> {
        if let Some(p) = check_string(category, url) {
            return Some(("URL".to_string(), p));
        }

        for (name, value) in headers {
            if is_safe_header(name) {
                continue;
            }
            if let Some(p) = check_string(category, value) {
                return Some((format!("header {}", name), p));
            }
        }

        if let Some(text) = body {
            if let Some(p) = check_string(category, text) {
                return Some(("request body".to_string(), p));
            }
        }

        None
    }
}

fn check_string<'a>(category: &'a SignatureCategory, input: &str) -> Option<&'a str> {
    if input.len() < 3 {
        return None;
    }

    let decoded = urlencoding::decode(input).unwrap_or(Cow::Borrowed(input));
    category
        .find(&decoded)
        .or_else(|| category.find(input))
        .map(|p| p.as_str())
}

fn is_safe_header(name: &str) -> bool {
    SAFE_HEADERS.contains(name.to_ascii_lowercase().as_str())
}

fn header_name(line: &str) -> &str {
    line.split(':').next().unwrap_or(line)
}
