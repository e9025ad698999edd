use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::header::{HeaderMap, HeaderValue, AUTHORIZATION, WWW_AUTHENTICATE};
use hyper::{Response, StatusCode};

use super::json_response;

/// Checks the Basic credentials on a request against the configured pair.
pub fn authorized(headers: &HeaderMap, user: &str, password: &str) -> bool {
    let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(credentials) = String::from_utf8(decoded) else {
        return false;
    };
    match credentials.split_once(':') {
        Some((u, p)) => u == user && p == password,
        None => false,
    }
}

pub fn challenge() -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = json_response(
        StatusCode::UNAUTHORIZED,
        serde_json::json!({"error": "unauthorized"}),
    );
    response.headers_mut().insert(
        WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"minutely\""),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn accepts_matching_credentials() {
        // "ingest:secret"
        let headers = headers_with(&format!("Basic {}", STANDARD.encode("ingest:secret")));
        assert!(authorized(&headers, "ingest", "secret"));
    }

    #[test]
    fn rejects_wrong_password() {
        let headers = headers_with(&format!("Basic {}", STANDARD.encode("ingest:wrong")));
        assert!(!authorized(&headers, "ingest", "secret"));
    }

    #[test]
    fn rejects_missing_header() {
        assert!(!authorized(&HeaderMap::new(), "ingest", "secret"));
    }

    #[test]
    fn rejects_non_basic_schemes_and_garbage() {
        assert!(!authorized(
            &headers_with("Bearer abc"),
            "ingest",
            "secret"
        ));
        assert!(!authorized(
            &headers_with("Basic !!!not-base64!!!"),
            "ingest",
            "secret"
        ));
    }

    #[test]
    fn challenge_carries_the_www_authenticate_header() {
        let response = challenge();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(WWW_AUTHENTICATE));
    }
}
