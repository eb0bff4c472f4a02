//! Request rewriting and forwarding: steps 5-8 of the pipeline, applied
//! once a route and a healthy backend have been chosen.

use hyper::header::{HeaderName, HeaderValue};
use hyper::{Body, Client, Request, Response, Uri};
use std::net::IpAddr;
use std::str::FromStr;

use warren_control::model::IngressPath;

use crate::error::IngressError;
use crate::route::Backend;

pub fn rewrite_path(path: &IngressPath, request_path: &str) -> String {
    if let Some(replace) = &path.replace_path {
        return replace.clone();
    }
    if let Some(prefix) = &path.strip_prefix {
        if let Some(rest) = request_path.strip_prefix(prefix.as_str()) {
            return if rest.is_empty() { "/".to_string() } else { rest.to_string() };
        }
    }
    request_path.to_string()
}

pub fn apply_header_ops(headers: &mut hyper::HeaderMap, path: &IngressPath) {
    for (name, value) in &path.headers.add {
        if let (Ok(n), Ok(v)) = (HeaderName::from_str(name), HeaderValue::from_str(value)) {
            if !headers.contains_key(&n) {
                headers.insert(n, v);
            }
        }
    }
    for (name, value) in &path.headers.set {
        if let (Ok(n), Ok(v)) = (HeaderName::from_str(name), HeaderValue::from_str(value)) {
            headers.insert(n, v);
        }
    }
    for name in &path.headers.remove {
        if let Ok(n) = HeaderName::from_str(name) {
            headers.remove(n);
        }
    }
}

pub fn apply_forwarded_headers(headers: &mut hyper::HeaderMap, remote: IpAddr, host: &str, https: bool) {
    headers.insert("x-real-ip", HeaderValue::from_str(&remote.to_string()).unwrap());
    headers.insert("x-forwarded-proto", HeaderValue::from_static(if https { "https" } else { "http" }));
    if let Ok(v) = HeaderValue::from_str(host) {
        headers.insert("x-forwarded-host", v);
    }

    let existing = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()).map(|s| s.to_string());
    let appended = match existing {
        Some(prior) => format!("{prior}, {remote}"),
        None => remote.to_string(),
    };
    if let Ok(v) = HeaderValue::from_str(&appended) {
        headers.insert("x-forwarded-for", v);
    }
}

pub async fn forward(
    client: &Client<hyper::client::HttpConnector>,
    mut request: Request<Body>,
    backend: &Backend,
    rewritten_path: &str,
) -> Result<Response<Body>, IngressError> {
    let query = request.uri().query().map(|q| format!("?{q}")).unwrap_or_default();
    let uri: Uri = format!("http://{}:{}{}{}", backend.host, backend.port, rewritten_path, query)
        .parse()
        .map_err(|_| IngressError::NoBackend(backend.host.clone()))?;
    *request.uri_mut() = uri;
    client.request(request).await.map_err(IngressError::Backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use warren_control::model::{HeaderOps, PathType};

    fn path(strip: Option<&str>, replace: Option<&str>) -> IngressPath {
        IngressPath {
            path: "/api".into(),
            path_type: PathType::Prefix,
            backend_service: "api".into(),
            backend_port: 80,
            strip_prefix: strip.map(|s| s.to_string()),
            replace_path: replace.map(|s| s.to_string()),
            headers: HeaderOps { add: BTreeMap::new(), set: BTreeMap::new(), remove: Vec::new() },
            rate_limit: None,
            access_control: None,
        }
    }

    #[test]
    fn strips_prefix() {
        let p = path(Some("/api"), None);
        assert_eq!(rewrite_path(&p, "/api/v1/users"), "/v1/users");
    }

    #[test]
    fn replace_path_wins_over_strip_prefix() {
        let p = path(Some("/api"), Some("/v2"));
        assert_eq!(rewrite_path(&p, "/api/v1/users"), "/v2");
    }

    #[test]
    fn no_rewrite_passes_through() {
        let p = path(None, None);
        assert_eq!(rewrite_path(&p, "/api/v1/users"), "/api/v1/users");
    }
}
