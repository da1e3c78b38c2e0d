use super::{Severity, ThreatType};
use once_cell::sync::Lazy;
use regex::Regex;

/// Where a category's patterns are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanScope {
    /// URL, non-benign header values and body text.
    Content,
    /// Header names and values only.
    Headers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureKind {
    ScriptTag,
    JavascriptUri,
    EventHandler,
    SqlInjection,
    PathTraversal,
    ExploitCall,
    CommandInjection,
    SuspiciousHeader,
}

impl SignatureKind {
    pub fn name(&self) -> &'static str {
        match self {
            SignatureKind::ScriptTag => "script_tag",
            SignatureKind::JavascriptUri => "javascript_uri",
            SignatureKind::EventHandler => "event_handler",
            SignatureKind::SqlInjection => "sql_injection",
            SignatureKind::PathTraversal => "path_traversal",
            SignatureKind::ExploitCall => "exploit_call",
            SignatureKind::CommandInjection => "command_injection",
            SignatureKind::SuspiciousHeader => "suspicious_header",
        }
    }
}

/// One category of the signature catalog. Every match of a category yields a
/// record with the category's fixed type and severity.
#[derive(Debug)]
pub struct SignatureCategory {
    pub kind: SignatureKind,
    pub threat_type: ThreatType,
    pub severity: Severity,
    pub scope: ScanScope,
    pub patterns: Vec<Regex>,
}

impl SignatureCategory {
    fn new(
        kind: SignatureKind,
        threat_type: ThreatType,
        severity: Severity,
        scope: ScanScope,
        patterns: &[&str],
    ) -> Self {
        Self {
            kind,
            threat_type,
            severity,
            scope,
            patterns: patterns
                .iter()
                .map(|p| Regex::new(p).expect("invalid built-in signature"))
                .collect(),
        }
    }

    /// First pattern matching `input`.
    pub fn find(&self, input: &str) -> Option<&Regex> {
        self.patterns.iter().find(|p| p.is_match(input))
    }
}

/// Built-in catalog, in evaluation order.
pub static SIGNATURE_CATALOG: Lazy<Vec<SignatureCategory>> = Lazy::new(|| {
    vec![
        SignatureCategory::new(
            SignatureKind::ScriptTag,
            ThreatType::Xss,
            Severity::High,
            ScanScope::Content,
            &[
                r"(?i)<script[^>]*>",
                r"(?i)</script\s*>",
                r"(?i)<iframe[^>]*>",
                r"(?i)<object[^>]*>",
                r"(?i)<embed[^>]*>",
                r"(?i)data:text/html",
            ],
        ),
        SignatureCategory::new(
            SignatureKind::JavascriptUri,
            ThreatType::Xss,
            Severity::High,
            ScanScope::Content,
            &[r"(?i)javascript\s*:", r"(?i)vbscript\s*:"],
        ),
        SignatureCategory::new(
            SignatureKind::EventHandler,
            ThreatType::Xss,
            Severity::Medium,
            ScanScope::Content,
            &[
                r"(?i)<[a-z][^>]*\bon[a-z]+\s*=",
                r#"(?i)["'\s]on(load|error|click|mouseover|focus|submit)\s*="#,
            ],
        ),
        SignatureCategory::new(
            SignatureKind::SqlInjection,
            ThreatType::Injection,
            Severity::Critical,
            ScanScope::Content,
            &[
                r"(?i)\bunion\b[\s\S]*\bselect\b",
                r#"(?i)['"]\s*(or|and)\s+['"]?\w+['"]?\s*=\s*['"]?\w+"#,
                r"(?i)\b(or|and)\b\s+\d+\s*=\s*\d+",
                r"(?i)'\s*;\s*(drop|delete|update|insert|truncate)\b",
                r"(?i);\s*(drop|truncate)\s+(table|database)\b",
                r"'\s*--",
                r"(?i)'\s*/\*",
                r"(?i)\b(benchmark|sleep|waitfor\s+delay)\s*\(",
                r"(?i)\b(xp_cmdshell|sp_executesql)\b",
            ],
        ),
        SignatureCategory::new(
            SignatureKind::PathTraversal,
            ThreatType::PathTraversal,
            Severity::High,
            ScanScope::Content,
            &[
                r"\.\./",
                r"\.\.\\",
                r"(?i)%2e%2e(%2f|%5c|/|\\)",
                r"(?i)%252e%252e",
                r"(?i)%c0%ae%c0%ae",
                r"%00",
                r"(?i)/etc/(passwd|shadow)",
                r"(?i)c:\\windows",
            ],
        ),
        SignatureCategory::new(
            SignatureKind::ExploitCall,
            ThreatType::Injection,
            Severity::High,
            ScanScope::Content,
            &[
                r"(?i)\beval\s*\(",
                r"(?i)\bnew\s+Function\s*\(",
                r"(?i)\bsetTimeout\s*\(\s*['\x22]",
                r"(?i)\bdocument\.(cookie|write)\b",
                r"(?i)\b(exec|system|passthru|shell_exec|popen)\s*\(",
                r"(?i)\brequire\s*\(\s*['\x22]child_process",
                r"(?i)__proto__",
                r"(?i)\bexpression\s*\(",
            ],
        ),
        SignatureCategory::new(
            SignatureKind::CommandInjection,
            ThreatType::Injection,
            Severity::High,
            ScanScope::Content,
            &[
                r"\$\(\s*\w",
                r"`[^`]+`",
                r"(?i)(;|&&|\|)\s*(cat|ls|rm|wget|curl|nc|bash|sh|whoami|id|uname)\b",
                r"(?i)/bin/(sh|bash|zsh|dash)",
                r"(?i)cmd\.exe",
            ],
        ),
        SignatureCategory::new(
            SignatureKind::SuspiciousHeader,
            ThreatType::SuspiciousHeader,
            Severity::Medium,
            ScanScope::Headers,
            &[
                concat!(
                    r"(?i)^user-agent:.*\b(sqlmap|nikto|nmap|masscan|acunetix|nessus",
                    r"|dirbuster|gobuster|wpscan|w3af|arachni)\b",
                ),
                r"(?i)^x-forwarded-host:.*[<>'\x22]",
                r"(?i)^x-original-url:",
                r"(?i)^x-rewrite-url:",
                r"(?i)^[a-z0-9-]+:.*\$\{jndi:",
            ],
        ),
    ]
});
