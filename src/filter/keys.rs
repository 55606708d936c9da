//! Authorization keys and app scopes.
//!
//! A [`Key`] is one rule that can permit a flow. Every variant carries an
//! [`AppScope`]; a key only matches when both its predicate holds for the
//! flow AND its scope permits the originating app.
//!
//! # Matching
//!
//! - `domain`: exact hostname equality (case-insensitive)
//! - `anySubdomain`: the domain itself or any dot-boundary subdomain.
//!   `example.com` matches `www.example.com` but NOT `evilexample.com`
//! - `domainRegex`: anchored, case-insensitive regex on the hostname
//! - `ipAddress`: exact string equality on the remote IP
//! - `path`: `host/path` against the flow URL; a trailing `*` turns the
//!   path into a literal prefix, otherwise the URL path must be equal.
//!   Query and fragment are ignored
//! - `skeleton`: no predicate, gated purely by scope
//!
//! Keys arrive in wire form and are compiled once into [`CompiledKey`] when
//! pushed, so the per-flow hot path never parses or compiles anything.

use super::error::{FilterError, FilterResult};
use super::model::{AppDescriptor, Flow};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one specific app.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SingleAppScope {
    /// Exact bundle id.
    BundleId(String),
    /// Manifest slug.
    Identified(String),
}

/// Which apps a key (or suspension) applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum AppScope {
    /// Any app.
    Unrestricted,
    /// Apps in the `browser` category.
    WebBrowsers,
    /// One specific app.
    Single(SingleAppScope),
}

impl AppScope {
    /// Whether this scope covers the given app.
    pub fn permits(&self, app: &AppDescriptor) -> bool {
        match self {
            AppScope::Unrestricted => true,
            AppScope::WebBrowsers => app.is_browser(),
            AppScope::Single(SingleAppScope::BundleId(id)) => app.bundle_id == *id,
            AppScope::Single(SingleAppScope::Identified(slug)) => {
                app.slug.as_deref() == Some(slug.as_str())
            }
        }
    }
}

/// One authorization rule in wire form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Key {
    /// Exact hostname.
    Domain {
        /// Hostname to match.
        domain: String,
        /// Apps the key applies to.
        scope: AppScope,
    },
    /// Hostname or any of its subdomains.
    AnySubdomain {
        /// Parent domain.
        domain: String,
        /// Apps the key applies to.
        scope: AppScope,
    },
    /// Regular expression over the hostname.
    DomainRegex {
        /// Regex source, anchored at compile time.
        pattern: String,
        /// Apps the key applies to.
        scope: AppScope,
    },
    /// Exact remote IP.
    IpAddress {
        /// IP address as text.
        ip_address: String,
        /// Apps the key applies to.
        scope: AppScope,
    },
    /// Host plus URL path.
    Path {
        /// `host/path`, optionally ending in `*`.
        path: String,
        /// Apps the key applies to.
        scope: AppScope,
    },
    /// Any destination, for the scoped app.
    Skeleton {
        /// Apps the key applies to.
        scope: AppScope,
    },
}

impl Key {
    /// The key's app scope.
    pub fn scope(&self) -> &AppScope {
        match self {
            Key::Domain { scope, .. }
            | Key::AnySubdomain { scope, .. }
            | Key::DomainRegex { scope, .. }
            | Key::IpAddress { scope, .. }
            | Key::Path { scope, .. }
            | Key::Skeleton { scope } => scope,
        }
    }
}

/// A key with its id, as stored for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterKey {
    /// Backend id of the key.
    pub id: Uuid,
    /// The rule itself.
    pub key: Key,
}

#[derive(Debug, Clone)]
enum Predicate {
    Domain(String),
    AnySubdomain(String),
    DomainRegex(Regex),
    IpAddress(String),
    Path { host: String, path: PathRule },
    Skeleton,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathRule {
    Exact(String),
    Prefix(String),
}

/// A key prepared for the per-flow hot path.
#[derive(Debug, Clone)]
pub struct CompiledKey {
    /// Backend id of the key.
    pub id: Uuid,
    scope: AppScope,
    predicate: Predicate,
}

impl CompiledKey {
    /// Compile a wire key.
    ///
    /// # Errors
    ///
    /// Returns an error for empty domains, for regexes that don't compile
    /// and for path keys without a host.
    pub fn compile(key: &FilterKey) -> FilterResult<Self> {
        let predicate = match &key.key {
            Key::Domain { domain, .. } => Predicate::Domain(non_empty_domain(domain, domain)?),
            Key::AnySubdomain { domain, .. } => Predicate::AnySubdomain(non_empty_domain(
                domain,
                domain.trim_start_matches("*."),
            )?),
            Key::DomainRegex { pattern, .. } => {
                let regex = RegexBuilder::new(&format!("^(?:{})$", pattern))
                    .case_insensitive(true)
                    .build()
                    .map_err(|source| FilterError::InvalidRegex {
                        pattern: pattern.clone(),
                        source,
                    })?;
                Predicate::DomainRegex(regex)
            }
            Key::IpAddress { ip_address, .. } => Predicate::IpAddress(ip_address.trim().to_string()),
            Key::Path { path, .. } => parse_path_key(path)?,
            Key::Skeleton { .. } => Predicate::Skeleton,
        };

        Ok(Self {
            id: key.id,
            scope: key.key.scope().clone(),
            predicate,
        })
    }

    /// Whether this key permits the flow from the given app.
    ///
    /// `hostname` is the flow's normalized hostname, computed once per
    /// flow by the caller.
    pub fn matches(&self, flow: &Flow, hostname: Option<&str>, app: &AppDescriptor) -> bool {
        self.predicate_holds(flow, hostname) && self.scope.permits(app)
    }

    /// The key's app scope.
    pub fn scope(&self) -> &AppScope {
        &self.scope
    }

    fn predicate_holds(&self, flow: &Flow, hostname: Option<&str>) -> bool {
        match &self.predicate {
            Predicate::Domain(domain) => hostname == Some(domain.as_str()),
            Predicate::AnySubdomain(domain) => {
                hostname.is_some_and(|h| matches_any_subdomain(domain, h))
            }
            Predicate::DomainRegex(regex) => hostname.is_some_and(|h| regex.is_match(h)),
            Predicate::IpAddress(ip) => flow.ip_address.as_deref() == Some(ip.as_str()),
            Predicate::Path { host, path } => {
                flow.url.as_deref().is_some_and(|url| matches_path(host, path, url))
            }
            Predicate::Skeleton => true,
        }
    }
}

fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_lowercase()
}

fn non_empty_domain(raw: &str, domain: &str) -> FilterResult<String> {
    let normalized = normalize_host(domain);
    if normalized.is_empty() {
        return Err(FilterError::InvalidDomain(raw.to_string()));
    }
    Ok(normalized)
}

/// Dot-boundary suffix match.
///
/// `example.com` matches `example.com`, `www.example.com` and
/// `a.b.example.com`, but not `evilexample.com`.
fn matches_any_subdomain(domain: &str, hostname: &str) -> bool {
    if hostname == domain {
        return true;
    }
    match hostname.strip_suffix(domain) {
        Some(prefix) => prefix.len() > 1 && prefix.ends_with('.'),
        None => false,
    }
}

fn parse_path_key(raw: &str) -> FilterResult<Predicate> {
    let trimmed = raw
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let (host, path) = match trimmed.find('/') {
        Some(idx) => (&trimmed[..idx], &trimmed[idx..]),
        None => return Err(FilterError::InvalidPath(raw.to_string())),
    };
    if host.is_empty() {
        return Err(FilterError::InvalidPath(raw.to_string()));
    }

    let path = match path.strip_suffix('*') {
        Some(prefix) => PathRule::Prefix(prefix.to_string()),
        None => PathRule::Exact(path.to_string()),
    };

    Ok(Predicate::Path {
        host: normalize_host(host),
        path,
    })
}

fn matches_path(host: &str, rule: &PathRule, url: &str) -> bool {
    let Ok(parsed) = url::Url::parse(url) else {
        return false;
    };
    let Some(url_host) = parsed.host_str() else {
        return false;
    };
    if normalize_host(url_host) != host {
        return false;
    }

    let url_path = parsed.path();
    match rule {
        PathRule::Exact(expected) => url_path == expected,
        PathRule::Prefix(prefix) => url_path.starts_with(prefix.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::model::BROWSER_CATEGORY;

    fn compile(key: Key) -> CompiledKey {
        CompiledKey::compile(&FilterKey {
            id: Uuid::new_v4(),
            key,
        })
        .unwrap()
    }

    fn any_app() -> AppDescriptor {
        AppDescriptor::unidentified("com.example.app")
    }

    fn matches_host(key: &CompiledKey, host: &str) -> bool {
        let flow = Flow::for_hostname(host);
        let hostname = flow.normalized_hostname();
        key.matches(&flow, hostname.as_deref(), &any_app())
    }

    fn matches_url(key: &CompiledKey, url: &str) -> bool {
        let flow = Flow {
            url: Some(url.to_string()),
            ..Default::default()
        };
        let hostname = flow.normalized_hostname();
        key.matches(&flow, hostname.as_deref(), &any_app())
    }

    #[test]
    fn test_domain_exact() {
        let key = compile(Key::Domain {
            domain: "Example.com".to_string(),
            scope: AppScope::Unrestricted,
        });
        assert!(matches_host(&key, "example.com"));
        assert!(matches_host(&key, "EXAMPLE.COM"));
        assert!(!matches_host(&key, "www.example.com"));
        assert!(!matches_host(&key, "example.com.evil.io"));
    }

    #[test]
    fn test_any_subdomain_dot_boundary() {
        let key = compile(Key::AnySubdomain {
            domain: "example.com".to_string(),
            scope: AppScope::Unrestricted,
        });
        assert!(matches_host(&key, "www.example.com"));
        assert!(matches_host(&key, "a.b.example.com"));
        assert!(matches_host(&key, "example.com"));
        assert!(!matches_host(&key, "evilexample.com"));
        assert!(!matches_host(&key, ".example.com.evil.io"));
        assert!(!matches_host(&key, "example.co"));
    }

    #[test]
    fn test_any_subdomain_rejects_bare_dot_prefix() {
        assert!(!matches_any_subdomain("example.com", ".example.com"));
        assert!(matches_any_subdomain("example.com", "x.example.com"));
    }

    #[test]
    fn test_domain_regex_is_anchored() {
        let key = compile(Key::DomainRegex {
            pattern: r"deploy-preview-\d+--site\.netlify\.app".to_string(),
            scope: AppScope::Unrestricted,
        });
        assert!(matches_host(&key, "deploy-preview-42--site.netlify.app"));
        assert!(!matches_host(&key, "deploy-preview-42--site.netlify.app.evil.io"));
        assert!(!matches_host(&key, "xdeploy-preview-42--site.netlify.app"));
    }

    #[test]
    fn test_invalid_regex_fails_to_compile() {
        let result = CompiledKey::compile(&FilterKey {
            id: Uuid::new_v4(),
            key: Key::DomainRegex {
                pattern: "(unclosed".to_string(),
                scope: AppScope::Unrestricted,
            },
        });
        assert!(matches!(result, Err(FilterError::InvalidRegex { .. })));
    }

    #[test]
    fn test_ip_address_exact() {
        let key = compile(Key::IpAddress {
            ip_address: "10.0.0.1".to_string(),
            scope: AppScope::Unrestricted,
        });
        let app = any_app();
        let flow = Flow {
            ip_address: Some("10.0.0.1".to_string()),
            ..Default::default()
        };
        assert!(key.matches(&flow, None, &app));

        let flow = Flow {
            ip_address: Some("10.0.0.10".to_string()),
            ..Default::default()
        };
        assert!(!key.matches(&flow, None, &app));
    }

    #[test]
    fn test_path_exact_and_prefix() {
        let exact = compile(Key::Path {
            path: "example.com/watch".to_string(),
            scope: AppScope::Unrestricted,
        });
        assert!(matches_url(&exact, "https://example.com/watch?v=1"));
        assert!(!matches_url(&exact, "https://example.com/watchlist"));
        assert!(!matches_url(&exact, "https://example.com/watch/1"));

        let prefix = compile(Key::Path {
            path: "example.com/docs/*".to_string(),
            scope: AppScope::Unrestricted,
        });
        assert!(matches_url(&prefix, "https://example.com/docs/intro"));
        assert!(matches_url(&prefix, "https://EXAMPLE.com/docs/"));
        assert!(!matches_url(&prefix, "https://example.com/docsevil"));
        assert!(!matches_url(&prefix, "https://example.com.evil.io/docs/intro"));
        assert!(!matches_url(&prefix, "https://evil.io/example.com/docs/intro"));
    }

    #[test]
    fn test_path_needs_url() {
        let key = compile(Key::Path {
            path: "example.com/docs/*".to_string(),
            scope: AppScope::Unrestricted,
        });
        assert!(!matches_host(&key, "example.com"));
        assert!(!matches_url(&key, "not a url"));
    }

    #[test]
    fn test_path_without_host_is_invalid() {
        for raw in ["/docs", "example.com", ""] {
            let result = CompiledKey::compile(&FilterKey {
                id: Uuid::new_v4(),
                key: Key::Path {
                    path: raw.to_string(),
                    scope: AppScope::Unrestricted,
                },
            });
            assert!(matches!(result, Err(FilterError::InvalidPath(_))), "{raw}");
        }
    }

    #[test]
    fn test_empty_domain_is_invalid() {
        let keys = [
            Key::Domain {
                domain: String::new(),
                scope: AppScope::Unrestricted,
            },
            Key::Domain {
                domain: ".".to_string(),
                scope: AppScope::Unrestricted,
            },
            Key::AnySubdomain {
                domain: "*.".to_string(),
                scope: AppScope::Unrestricted,
            },
        ];
        for key in keys {
            let result = CompiledKey::compile(&FilterKey {
                id: Uuid::new_v4(),
                key: key.clone(),
            });
            assert!(matches!(result, Err(FilterError::InvalidDomain(_))), "{key:?}");
        }
    }

    #[test]
    fn test_scope_gates_match() {
        let key = compile(Key::Domain {
            domain: "example.com".to_string(),
            scope: AppScope::WebBrowsers,
        });
        let flow = Flow::for_hostname("example.com");
        let host = flow.normalized_hostname();

        let mut browser = AppDescriptor::unidentified("org.mozilla.firefox");
        browser.categories.insert(BROWSER_CATEGORY.to_string());
        assert!(key.matches(&flow, host.as_deref(), &browser));
        assert!(!key.matches(&flow, host.as_deref(), &any_app()));
    }

    #[test]
    fn test_single_scope() {
        let mut app = AppDescriptor::unidentified("com.tinyspeck.slackmacgap");
        app.slug = Some("slack".to_string());

        assert!(AppScope::Single(SingleAppScope::BundleId("com.tinyspeck.slackmacgap".into())).permits(&app));
        assert!(AppScope::Single(SingleAppScope::Identified("slack".into())).permits(&app));
        assert!(!AppScope::Single(SingleAppScope::Identified("zoom".into())).permits(&app));
        assert!(!AppScope::Single(SingleAppScope::BundleId("com.slack".into())).permits(&app));
    }

    #[test]
    fn test_skeleton_matches_only_scoped_app() {
        let key = compile(Key::Skeleton {
            scope: AppScope::Single(SingleAppScope::BundleId("com.example.app".into())),
        });
        assert!(matches_host(&key, "anything.io"));

        let flow = Flow::for_hostname("anything.io");
        let other = AppDescriptor::unidentified("com.other.app");
        assert!(!key.matches(&flow, Some("anything.io"), &other));
    }

    #[test]
    fn test_key_wire_format() {
        let key = FilterKey {
            id: Uuid::nil(),
            key: Key::IpAddress {
                ip_address: "1.2.3.4".to_string(),
                scope: AppScope::Single(SingleAppScope::Identified("zoom".to_string())),
            },
        };
        let json = serde_json::to_string(&key).unwrap();
        assert!(json.contains("\"type\":\"ipAddress\""));
        assert!(json.contains("\"ipAddress\":\"1.2.3.4\""));
        assert!(json.contains("\"scope\":{\"type\":\"single\",\"value\":{\"identified\":\"zoom\"}}"));

        let parsed: FilterKey = serde_json::from_str(
            r#"{"id":"00000000-0000-0000-0000-000000000000","key":{"type":"anySubdomain","domain":"example.com","scope":{"type":"webBrowsers"}}}"#,
        )
        .unwrap();
        assert_eq!(
            parsed.key,
            Key::AnySubdomain {
                domain: "example.com".to_string(),
                scope: AppScope::WebBrowsers,
            }
        );
    }
}
