//! HTTP request header handling.
//!
//! [`RequestHeader`] keeps the decoded request line and header block of one
//! request, detached from any body. The body intake layer reads two things
//! from it: whether the client expects a `100 Continue` invitation, and the
//! length advertised by `Content-Length`.

use http::header::{CONTENT_LENGTH, EXPECT, TRANSFER_ENCODING};
use http::request::Parts;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Uri, Version};

/// The header section of one HTTP request.
///
/// Stored as bare `http::request::Parts` so the request line and header map
/// are owned here while the body lives its own life in the intake layer.
/// Reattach a body with [`RequestHeader::into_request`] once one exists.
#[derive(Debug)]
pub struct RequestHeader {
    parts: Parts,
}

impl RequestHeader {
    /// Builds a header from a parse that ran to completion.
    ///
    /// Missing request-line fields fall back to the `http` crate defaults;
    /// header names or values the `http` types reject fail the conversion.
    pub fn from_parsed(src: httparse::Request<'_, '_>) -> Result<Self, http::Error> {
        let mut request = Request::new(());

        if let Some(method) = src.method {
            *request.method_mut() = method.parse::<Method>()?;
        }
        if let Some(path) = src.path {
            *request.uri_mut() = path.parse::<Uri>()?;
        }
        if let Some(0) = src.version {
            *request.version_mut() = Version::HTTP_10;
        }

        let headers = request.headers_mut();
        headers.reserve(src.headers.len());
        for header in src.headers.iter() {
            let name = HeaderName::from_bytes(header.name.as_bytes())?;
            let value = HeaderValue::from_bytes(header.value)?;
            headers.append(name, value);
        }

        let (parts, ()) = request.into_parts();
        Ok(Self { parts })
    }

    /// Reunites the header with a body into a full `http::Request`.
    pub fn into_request<T>(self, body: T) -> Request<T> {
        Request::from_parts(self.parts, body)
    }

    pub fn method(&self) -> &Method {
        &self.parts.method
    }

    pub fn uri(&self) -> &Uri {
        &self.parts.uri
    }

    pub fn version(&self) -> Version {
        self.parts.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    /// Whether a request with this method is expected to carry a body.
    pub fn need_body(&self) -> bool {
        match self.parts.method {
            Method::GET | Method::HEAD | Method::DELETE | Method::OPTIONS | Method::CONNECT => false,
            _ => true,
        }
    }

    /// True iff the request carries `Expect: 100-continue`.
    pub fn expects_continue(&self) -> bool {
        self.parts
            .headers
            .get(EXPECT)
            .is_some_and(|value| value.as_bytes().starts_with(b"100-"))
    }

    /// The body length advertised by the `Content-Length` header, or `-1`
    /// when the header is absent, unparsable, or the request is
    /// chunked-encoded.
    pub fn advertised_content_length(&self) -> i64 {
        if self.parts.headers.contains_key(TRANSFER_ENCODING) {
            return -1;
        }

        self.parts
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|s| s.parse::<i64>().ok())
            .filter(|len| *len >= 0)
            .unwrap_or(-1)
    }
}

impl From<Parts> for RequestHeader {
    fn from(parts: Parts) -> Self {
        Self { parts }
    }
}

impl From<Request<()>> for RequestHeader {
    fn from(request: Request<()>) -> Self {
        let (parts, ()) = request.into_parts();
        Self { parts }
    }
}
