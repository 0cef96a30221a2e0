//! An in-process stand-in for a registry, for tests.
//!
//! Responses are keyed by request path. Paths with no response answer `404`,
//! the way a registry reports a missing manifest or blob.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use http::header::HeaderValue;
use http::{response, StatusCode};

/// A canned response.
#[derive(Debug, Clone)]
pub struct MockResponse {
    status: StatusCode,
    headers: http::HeaderMap,
    body: Vec<u8>,
}

impl MockResponse {
    #[allow(missing_docs)]
    pub fn new(status: StatusCode, headers: http::HeaderMap, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }
}

#[derive(Debug, Clone)]
struct RequiredAuthorization {
    authorization: HeaderValue,
    challenge: HeaderValue,
}

/// A `tower::Service` standing in for a registry's HTTP client connection.
#[derive(Debug, Default, Clone)]
pub struct MockService {
    responses: HashMap<String, MockResponse>,
    public: HashSet<String>,
    required: Option<RequiredAuthorization>,
}

impl MockService {
    /// A service that answers every request with `404`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer requests for `path` with the given response.
    pub fn add(&mut self, path: &str, status: StatusCode, headers: http::HeaderMap, body: Vec<u8>) {
        let response = MockResponse::new(status, headers, body);
        self.responses.insert(path.to_owned(), response);
    }

    /// Add a response that is served without authorization, such as a token
    /// endpoint.
    pub fn add_public(
        &mut self,
        path: &str,
        status: StatusCode,
        headers: http::HeaderMap,
        body: Vec<u8>,
    ) {
        self.add(path, status, headers, body);
        self.public.insert(path.to_owned());
    }

    /// Answer `401` with `challenge` unless requests carry exactly
    /// `authorization`.
    pub fn require_authorization(&mut self, authorization: &str, challenge: &str) {
        self.required = Some(RequiredAuthorization {
            authorization: HeaderValue::from_str(authorization)
                .expect("authorization is a valid header value"),
            challenge: HeaderValue::from_str(challenge).expect("challenge is a valid header value"),
        });
    }

    fn respond(&self, req: &http::Request<hyperdriver::Body>) -> MockResponse {
        let path = req.uri().path();

        if let Some(required) = &self.required {
            let authorized = req.headers().get(http::header::AUTHORIZATION)
                == Some(&required.authorization);

            if !authorized && !self.public.contains(path) {
                let mut headers = http::HeaderMap::new();
                headers.insert(http::header::WWW_AUTHENTICATE, required.challenge.clone());
                return MockResponse::new(StatusCode::UNAUTHORIZED, headers, Vec::new());
            }
        }

        self.responses.get(path).cloned().unwrap_or_else(|| {
            MockResponse::new(
                StatusCode::NOT_FOUND,
                http::HeaderMap::new(),
                format!("no response configured for path: {path}").into_bytes(),
            )
        })
    }
}

impl tower::Service<http::Request<hyperdriver::Body>> for MockService {
    type Response = http::Response<hyperdriver::Body>;
    type Error = hyperdriver::client::Error;
    type Future = std::future::Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<hyperdriver::Body>) -> Self::Future {
        let response = self.respond(&req);

        let mut builder = response::Builder::new()
            .status(response.status)
            .version(http::Version::HTTP_11);

        for (key, value) in response.headers.iter() {
            builder = builder.header(key, value);
        }

        let response = builder
            .body(hyperdriver::Body::from(Bytes::from(response.body)))
            .expect("mock response is valid");

        std::future::ready(Ok(response))
    }
}
