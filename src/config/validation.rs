//! Configuration validation with detailed error reporting.
//!
//! The [`validate`] function checks a parsed [`Config`] for structural
//! errors such as a malformed upstream, unusable custom headers,
//! impossible upload limits, invalid route paths, duplicate routes and
//! bad HTTP methods. Returns a list of [`ValidationError`] values with
//! per-field suggestions.

use axum::http::{HeaderName, HeaderValue};
use url::Url;

use super::model::Config;
use crate::error::ValidationError;

pub const VALID_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS", "*",
];

/// Request headers the gateway sets itself.
pub const RESERVED_HEADERS: &[&str] = &[
    "gatehouse",
    "gatehouse-proxy-start",
    "gatehouse-multipart-fields",
    "host",
    "content-length",
    "content-type",
];

pub const MAX_CLAIM_TTL_SECS: u64 = 3600;

const ROOT: &str = "(root)";

fn error(scope: impl Into<String>, field: impl Into<String>, message: impl Into<String>) -> ValidationError {
    ValidationError {
        scope: scope.into(),
        field: field.into(),
        message: message.into(),
        suggestion: None,
    }
}

/// Validate a single route path. Returns `Ok(())` or a human-readable error.
pub fn validate_path(path: &str) -> Result<(), String> {
    if path.is_empty() {
        return Err("path cannot be empty".into());
    }
    if !path.starts_with('/') && path != "*" {
        return Err(format!(
            "path must start with '/' or be '*' (did you mean '/{path}'?)"
        ));
    }
    Ok(())
}

/// Validate the upstream URL. Returns `Ok(())` or a human-readable error.
pub fn validate_upstream(url: &str) -> Result<(), String> {
    match Url::parse(url) {
        Ok(parsed) => {
            let scheme = parsed.scheme();
            if scheme != "http" && scheme != "https" {
                Err(format!(
                    "unsupported scheme '{scheme}' (expected http or https)"
                ))
            } else if parsed.host_str().is_none() {
                Err(format!("'{url}' has no host"))
            } else if parsed.query().is_some() || parsed.fragment().is_some() {
                Err("upstream cannot carry a query or fragment".into())
            } else {
                Ok(())
            }
        }
        Err(_) => Err(format!("'{url}' is not a valid URL")),
    }
}

/// Validate an HTTP method string. Returns `Ok(())` or a human-readable error.
pub fn validate_method(method: &str) -> Result<(), String> {
    let upper = method.to_uppercase();
    if VALID_METHODS.contains(&upper.as_str()) {
        Ok(())
    } else {
        Err(format!("'{method}' is not a valid HTTP method"))
    }
}

pub fn validate(config: &Config) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if let Some(upstream) = &config.upstream {
        if let Err(msg) = validate_upstream(upstream) {
            let mut e = error(ROOT, "upstream", msg);
            if !upstream.contains("://") {
                e.suggestion = Some(format!("did you mean 'http://{upstream}'?"));
            }
            errors.push(e);
        }
    }

    if let Some(version) = &config.version {
        if version.is_empty() || HeaderValue::from_str(version).is_err() {
            errors.push(error(
                ROOT,
                "version",
                "version must be a non-empty, printable header value",
            ));
        }
    }

    for (name, value) in &config.headers {
        let field = format!("headers.{name}");
        match name.parse::<HeaderName>() {
            Ok(parsed) if RESERVED_HEADERS.contains(&parsed.as_str()) => {
                errors.push(error(ROOT, field.clone(), "header is set by the gateway itself"));
            }
            Ok(_) => {}
            Err(_) => errors.push(error(ROOT, field.clone(), format!("'{name}' is not a valid header name"))),
        }
        if HeaderValue::from_str(value).is_err() {
            errors.push(error(ROOT, field, "value is not a valid header value"));
        }
    }

    validate_uploads(config, &mut errors);
    validate_routes(config, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_uploads(config: &Config, errors: &mut Vec<ValidationError>) {
    let uploads = &config.uploads;
    if uploads.max_files == 0 {
        errors.push(error(ROOT, "uploads.max_files", "must allow at least one file"));
    }
    if uploads.max_file_size == 0 {
        errors.push(error(ROOT, "uploads.max_file_size", "must be greater than zero"));
    }
    if uploads.max_request_size == 0 {
        errors.push(error(ROOT, "uploads.max_request_size", "must be greater than zero"));
    } else if uploads.max_request_size < uploads.max_file_size {
        errors.push(ValidationError {
            scope: ROOT.into(),
            field: "uploads.max_request_size".into(),
            message: "smaller than uploads.max_file_size".into(),
            suggestion: Some(format!("raise it to at least {}", uploads.max_file_size)),
        });
    }
    if uploads.timeout == 0 {
        errors.push(error(ROOT, "uploads.timeout", "must be greater than zero"));
    }
    if uploads.claim_ttl == 0 || uploads.claim_ttl > MAX_CLAIM_TTL_SECS {
        errors.push(error(
            ROOT,
            "uploads.claim_ttl",
            format!("must be between 1 and {MAX_CLAIM_TTL_SECS} seconds"),
        ));
    }
    if uploads.storage_dir.as_os_str().is_empty() {
        errors.push(error(ROOT, "uploads.storage_dir", "cannot be empty"));
    }
}

fn validate_routes(config: &Config, errors: &mut Vec<ValidationError>) {
    let mut seen = std::collections::HashSet::new();

    for (i, route) in config.routes.iter().enumerate() {
        let route_id = if route.path.is_empty() {
            format!("routes[{i}]")
        } else {
            route.path.clone()
        };

        if let Err(msg) = validate_path(&route.path) {
            errors.push(ValidationError {
                scope: route_id.clone(),
                field: "path".into(),
                message: msg,
                suggestion: if !route.path.is_empty() && !route.path.starts_with('/') {
                    Some(format!("did you mean '/{}'?", route.path))
                } else {
                    None
                },
            });
        }

        if route.methods.is_empty() {
            errors.push(error(route_id.clone(), "methods", "at least one method must be listed"));
        }

        for method in &route.methods {
            if let Err(msg) = validate_method(method) {
                errors.push(error(route_id.clone(), "methods", msg));
            }
            if !seen.insert((route.path.as_str(), method.to_uppercase())) {
                errors.push(error(
                    route_id.clone(),
                    "path",
                    format!("duplicate route for method {method}"),
                ));
            }
        }
    }
}

#[must_use]
pub fn format_validation_report(path: &str, config: &Config) -> String {
    let upstream = config.upstream.as_deref().unwrap_or("http://localhost (default)");
    let mut lines = vec![
        format!("  upstream: {upstream}"),
        format!("  version: {}", config.version_string()),
        format!(
            "  uploads: max {} files, {} bytes per file, {} bytes per request, {}ms timeout",
            config.uploads.max_files,
            config.uploads.max_file_size,
            config.uploads.max_request_size,
            config.uploads.timeout
        ),
        format!(
            "  {} routes, {} upload routes\n",
            config.routes.len(),
            config.upload_routes()
        ),
    ];

    for route in &config.routes {
        let kind = route
            .upload
            .map_or_else(|| "forward".to_string(), |k| k.to_string());
        lines.push(format!("  {}  -> {}", route.path, kind));
        lines.push(format!("    methods: {}", route.methods.join(", ")));
    }

    format!("{} is valid\n{}", path, lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::{Route, UploadKind, UploadSettings};

    fn minimal_config() -> Config {
        Config {
            upstream: Some("http://backend:8080".into()),
            version: None,
            force_target_host_header: false,
            allow_response_buffering: true,
            headers: Default::default(),
            secret_file: None,
            uploads: UploadSettings::default(),
            routes: vec![Route {
                path: "/uploads".into(),
                methods: vec!["POST".into()],
                upload: Some(UploadKind::Attachments),
            }],
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(validate(&minimal_config()).is_ok());
    }

    #[test]
    fn routes_are_optional() {
        let mut config = minimal_config();
        config.routes.clear();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn upstream_without_scheme_gets_a_suggestion() {
        let mut config = minimal_config();
        config.upstream = Some("backend:8080".into());
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "upstream"));
    }

    #[test]
    fn invalid_upstream_fails() {
        let mut config = minimal_config();
        config.upstream = Some("not a url".into());
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("not a valid URL")));
        assert_eq!(
            errors[0].suggestion.as_deref(),
            Some("did you mean 'http://not a url'?")
        );
    }

    #[test]
    fn ftp_upstream_fails() {
        let mut config = minimal_config();
        config.upstream = Some("ftp://files".into());
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("unsupported scheme")));
    }

    #[test]
    fn reserved_and_invalid_headers_fail() {
        let mut config = minimal_config();
        config
            .headers
            .insert("Gatehouse-Multipart-Fields".into(), "x".into());
        config.headers.insert("bad header".into(), "x".into());
        config.headers.insert("x-ok".into(), "line\nbreak".into());
        let errors = validate(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.message.contains("set by the gateway")));
    }

    #[test]
    fn impossible_limits_fail() {
        let mut config = minimal_config();
        config.uploads.max_files = 0;
        config.uploads.max_file_size = 10;
        config.uploads.max_request_size = 5;
        config.uploads.claim_ttl = MAX_CLAIM_TTL_SECS + 1;
        let errors = validate(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"uploads.max_files"));
        assert!(fields.contains(&"uploads.max_request_size"));
        assert!(fields.contains(&"uploads.claim_ttl"));
    }

    #[test]
    fn path_without_slash_fails() {
        let mut config = minimal_config();
        config.routes[0].path = "uploads".into();
        let errors = validate(&config).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.suggestion.as_deref() == Some("did you mean '/uploads'?")));
    }

    #[test]
    fn invalid_method_fails() {
        let mut config = minimal_config();
        config.routes[0].methods = vec!["INVALID".into()];
        let errors = validate(&config).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.message.contains("not a valid HTTP method")));
    }

    #[test]
    fn duplicate_route_fails() {
        let mut config = minimal_config();
        config.routes.push(Route {
            path: "/uploads".into(),
            methods: vec!["post".into()],
            upload: Some(UploadKind::Artifacts),
        });
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("duplicate route")));
    }

    #[test]
    fn same_path_different_methods_is_fine() {
        let mut config = minimal_config();
        config.routes.push(Route {
            path: "/uploads".into(),
            methods: vec!["PUT".into()],
            upload: None,
        });
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn report_lists_routes() {
        let report = format_validation_report("gatehouse.yaml", &minimal_config());
        assert!(report.starts_with("gatehouse.yaml is valid"));
        assert!(report.contains("/uploads  -> attachments"));
        assert!(report.contains("upstream: http://backend:8080"));
    }
}
