use crate::config::HeadersConfig;

/// Hardening headers attached to every processed request, allowed or not.
#[derive(Debug, Clone)]
pub struct SecurityHeaders {
    headers: Vec<(String, String)>,
}

impl SecurityHeaders {
    pub fn from_config(config: &HeadersConfig) -> Self {
        let mut headers = vec![
            (
                "Content-Security-Policy".to_string(),
                build_csp(config),
            ),
            ("Strict-Transport-Security".to_string(), build_hsts(config)),
            ("X-Frame-Options".to_string(), "DENY".to_string()),
            ("X-Content-Type-Options".to_string(), "nosniff".to_string()),
            ("X-XSS-Protection".to_string(), "1; mode=block".to_string()),
            (
                "Referrer-Policy".to_string(),
                "strict-origin-when-cross-origin".to_string(),
            ),
            (
                "Cross-Origin-Opener-Policy".to_string(),
                "same-origin".to_string(),
            ),
            (
                "Cross-Origin-Resource-Policy".to_string(),
                "same-origin".to_string(),
            ),
            (
                "Cross-Origin-Embedder-Policy".to_string(),
                "require-corp".to_string(),
            ),
        ];

        if !config.permissions_policy.is_empty() {
            headers.push((
                "Permissions-Policy".to_string(),
                config.permissions_policy.join(", "),
            ));
        }

        Self { headers }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn to_vec(&self) -> Vec<(String, String)> {
        self.headers.clone()
    }
}

impl Default for SecurityHeaders {
    fn default() -> Self {
        Self::from_config(&HeadersConfig::default())
    }
}

fn build_csp(config: &HeadersConfig) -> String {
    config
        .csp
        .iter()
        .map(|d| {
            if d.sources.is_empty() {
                d.name.clone()
            } else {
                format!("{} {}", d.name, d.sources.join(" "))
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn build_hsts(config: &HeadersConfig) -> String {
    let mut value = format!("max-age={}", config.hsts_max_age);
    if config.hsts_include_subdomains {
        value.push_str("; includeSubDomains");
    }
    if config.hsts_preload {
        value.push_str("; preload");
    }
    value
}
