use std::borrow::Cow;
use std::mem;
use std::str::FromStr;

use http::request::Parts;
use http::uri::Authority;
use http::uri::PathAndQuery;
use http::uri::Scheme;
use http::HeaderMap;
use http::HeaderValue;
use http::Method;
use http::Uri;

use crate::Result;

/// Signing input assembled from the head of a request.
///
/// [`build`] moves the header map out of the request so a signer can work
/// on it without copying; [`apply`] moves it back together with the
/// canonicalized query and whatever headers the signer added.
///
/// [`build`]: SigningRequest::build
/// [`apply`]: SigningRequest::apply
#[derive(Debug)]
pub struct SigningRequest {
    /// HTTP method.
    pub method: Method,
    /// HTTP scheme, when the request URI carried one.
    pub scheme: Option<Scheme>,
    /// HTTP authority, when the request URI carried one.
    pub authority: Option<Authority>,
    /// HTTP path, as it appears on the wire.
    pub path: String,
    /// Decoded query parameters in request order.
    pub query: Vec<(String, String)>,
    /// HTTP headers, held while signing.
    pub headers: HeaderMap,
    /// Hex SHA256 digest of the request payload.
    pub payload_hash: String,
}

impl SigningRequest {
    /// Assemble the signing input from request parts and a payload digest.
    pub fn build(parts: &mut Parts, payload_hash: String) -> Self {
        let uri = mem::take(&mut parts.uri).into_parts();
        let paq = uri
            .path_and_query
            .unwrap_or_else(|| PathAndQuery::from_static("/"));

        SigningRequest {
            method: parts.method.clone(),
            scheme: uri.scheme,
            authority: uri.authority,
            path: paq.path().to_string(),
            query: paq
                .query()
                .map(|v| {
                    form_urlencoded::parse(v.as_bytes())
                        .map(|(k, v)| (k.into_owned(), v.into_owned()))
                        .collect()
                })
                .unwrap_or_default(),

            // Take the headers out of the request to avoid copy.
            // We will return them when the context is applied.
            headers: mem::take(&mut parts.headers),
            payload_hash,
        }
    }

    /// Write the signed headers and canonical query back to the request.
    pub fn apply(mut self, parts: &mut Parts) -> Result<()> {
        let query_size = self.query_size();

        // Return headers back.
        mem::swap(&mut parts.headers, &mut self.headers);
        parts.method = self.method;
        parts.uri = {
            let mut uri_parts = mem::take(&mut parts.uri).into_parts();
            uri_parts.scheme = self.scheme;
            uri_parts.authority = self.authority;
            // Build path and query.
            uri_parts.path_and_query = {
                let paq = if query_size == 0 {
                    self.path
                } else {
                    let mut s = self.path;
                    s.reserve(query_size + self.query.len() * 2);

                    s.push('?');
                    for (i, (k, v)) in self.query.iter().enumerate() {
                        if i > 0 {
                            s.push('&');
                        }

                        s.push_str(k);
                        if !v.is_empty() {
                            s.push('=');
                            s.push_str(v);
                        }
                    }

                    s
                };

                Some(PathAndQuery::from_str(&paq)?)
            };
            Uri::from_parts(uri_parts)?
        };

        Ok(())
    }

    /// Get the path percent decoded.
    pub fn path_percent_decoded(&self) -> Cow<'_, str> {
        percent_encoding::percent_decode_str(&self.path).decode_utf8_lossy()
    }

    /// Get query size.
    #[inline]
    pub fn query_size(&self) -> usize {
        self.query
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum::<usize>()
    }

    /// Normalize header value.
    pub fn header_value_normalize(v: &mut HeaderValue) {
        let bs = v.as_bytes();

        let starting_index = bs.iter().position(|b| *b != b' ').unwrap_or(0);
        let ending_offset = bs.iter().rev().position(|b| *b != b' ').unwrap_or(0);
        let ending_index = bs.len() - ending_offset;

        // This can't fail because we started with a valid HeaderValue and then only trimmed spaces
        *v = HeaderValue::from_bytes(&bs[starting_index..ending_index])
            .expect("invalid header value")
    }
}
