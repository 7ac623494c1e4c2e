// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Request capability interface implemented by instrumentation adapters.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref URI_PATH: Regex =
        Regex::new(r"^(https?://.*?)?(/[^?]*)").expect("failed creating regex");
}

/// Narrow view of an inbound request. Adapters expose whichever accessors
/// their framework supports; everything defaults to absent.
pub trait RequestInfo {
    /// Full path, possibly including a query string.
    fn path(&self) -> Option<String> {
        None
    }

    /// Absolute URL of the request.
    fn url(&self) -> Option<String> {
        None
    }

    fn referer(&self) -> Option<String> {
        None
    }
}

/// Path of the request without host and query string. Falls back to `/`
/// when the request exposes something that isn't a path.
pub fn uri_from_request(request: &dyn RequestInfo) -> Option<String> {
    let approximate = request.path().or_else(|| request.url())?;
    let path = URI_PATH
        .captures(&approximate)
        .and_then(|caps| caps.get(2))
        .map_or("/", |m| m.as_str());
    Some(path.to_string())
}

/// Referer of the request with its query string removed.
pub fn referer_from_request(request: &dyn RequestInfo) -> Option<String> {
    let referer = request.referer()?;
    let without_query = referer.split('?').next().unwrap_or_default();
    Some(without_query.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeRequest {
        path: Option<&'static str>,
        url: Option<&'static str>,
        referer: Option<&'static str>,
    }

    impl RequestInfo for FakeRequest {
        fn path(&self) -> Option<String> {
            self.path.map(str::to_string)
        }

        fn url(&self) -> Option<String> {
            self.url.map(str::to_string)
        }

        fn referer(&self) -> Option<String> {
            self.referer.map(str::to_string)
        }
    }

    #[test]
    fn test_uri_strips_query_string() {
        let request = FakeRequest {
            path: Some("/users/1?debug=true"),
            ..Default::default()
        };
        assert_eq!(uri_from_request(&request).as_deref(), Some("/users/1"));
    }

    #[test]
    fn test_uri_strips_host_from_url() {
        let request = FakeRequest {
            url: Some("https://example.com/orders/7?page=2"),
            ..Default::default()
        };
        assert_eq!(uri_from_request(&request).as_deref(), Some("/orders/7"));
    }

    #[test]
    fn test_path_preferred_over_url() {
        let request = FakeRequest {
            path: Some("/from-path"),
            url: Some("http://example.com/from-url"),
            ..Default::default()
        };
        assert_eq!(uri_from_request(&request).as_deref(), Some("/from-path"));
    }

    #[test]
    fn test_uri_falls_back_to_root() {
        let request = FakeRequest {
            path: Some("not a path"),
            ..Default::default()
        };
        assert_eq!(uri_from_request(&request).as_deref(), Some("/"));
    }

    #[test]
    fn test_missing_accessors() {
        let request = FakeRequest::default();
        assert!(uri_from_request(&request).is_none());
        assert!(referer_from_request(&request).is_none());
    }

    #[test]
    fn test_referer_strips_query_string() {
        let request = FakeRequest {
            referer: Some("https://example.com/search?q=rust"),
            ..Default::default()
        };
        assert_eq!(
            referer_from_request(&request).as_deref(),
            Some("https://example.com/search")
        );
    }
}
