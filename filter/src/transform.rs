use std::mem;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use http::request::Parts;
use http::uri::PathAndQuery;
use http::{HeaderValue, Method, Uri};
use lambdafy_core::hash::Sha256Hasher;
use lambdafy_core::{Error, RequestHandle, Result, SigningRequest};
use log::debug;

use crate::constants::{X_AMZ_CONTENT_SHA_256, X_AMZ_INVOCATION_TYPE, X_AMZ_LOG_TYPE};
use crate::{Function, ResolveFunction, RouteContext, Signer};

/// Where a transform is in the request lifecycle.
///
/// Phases only move forward; a new request always starts a fresh
/// transform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// No function matched; the request passes through untouched.
    Idle,
    /// A function is bound and the request line is rewritten; waiting for
    /// the body.
    Resolving,
    /// Body chunks are being hashed and buffered.
    Buffering,
    /// The invocation is signed and released. Terminal.
    Finalized,
}

/// Verdict returned to the host for a header event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeadersStatus {
    /// Forward the request.
    Continue,
    /// Hold the request until the transform releases it.
    StopIteration,
}

/// Verdict returned to the host for a body event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataStatus {
    /// Forward this chunk together with everything buffered before it.
    Continue,
    /// Hold the chunk; the payload is still incomplete.
    StopIterationAndBuffer,
}

/// Verdict returned to the host for a trailer event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrailersStatus {
    /// Forward the trailers.
    Continue,
}

/// Per-request transform that rewrites a routed request into a signed
/// Lambda invocation.
///
/// The host delivers header, body and trailer events serially for one
/// request. On the header event the transform resolves the target
/// function, rewrites the request line and suspends forwarding; body
/// chunks are hashed and buffered as they arrive. Once the end of the
/// payload is seen, on the last body event or on a trailer event, the
/// transform signs the invocation, injects the signature headers through
/// the held [`RequestHandle`] and releases the request.
///
/// Signing requires the digest of the complete payload, so the request
/// cannot be released before the last chunk has been hashed.
pub struct RequestTransform {
    resolver: Arc<dyn ResolveFunction>,

    phase: Phase,
    function: Option<Function>,
    handle: Option<RequestHandle>,
    hasher: Sha256Hasher,
    buffered: Vec<Bytes>,

    #[cfg(test)]
    time: Option<lambdafy_core::time::DateTime>,
}

impl RequestTransform {
    /// Create the transform for one request.
    pub fn new(resolver: Arc<dyn ResolveFunction>) -> Self {
        Self {
            resolver,
            phase: Phase::Idle,
            function: None,
            handle: None,
            hasher: Sha256Hasher::new(),
            buffered: Vec::new(),
            #[cfg(test)]
            time: None,
        }
    }

    /// Pin the signing time. Only used for testing.
    #[cfg(test)]
    pub fn with_time(mut self, time: lambdafy_core::time::DateTime) -> Self {
        self.time = Some(time);
        self
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Header event.
    ///
    /// Resolves the route to a function. Without a match the request is
    /// left untouched and passes through. With a match the request line is
    /// rewritten to the invoke path and, unless the request ends here, the
    /// host is told to hold it until the payload digest is known.
    pub fn on_headers(
        &mut self,
        handle: &RequestHandle,
        route: &RouteContext<'_>,
        end_of_stream: bool,
    ) -> Result<HeadersStatus> {
        if self.phase != Phase::Idle {
            return Err(Error::request_invalid(
                "header event delivered after the transform already started",
            ));
        }

        let Some(function) = self.resolver.resolve(route) else {
            debug!(
                "no function behind cluster {:?}, passing request through",
                route.cluster
            );
            return Ok(HeadersStatus::Continue);
        };

        debug!(
            "rewriting request into an invocation of {:?} (end_of_stream = {end_of_stream})",
            function.name
        );
        handle.with_mut(|parts| rewrite_request_line(parts, &function))?;

        self.function = Some(function);
        self.handle = Some(handle.clone());
        self.phase = Phase::Resolving;

        if end_of_stream {
            // Bodiless request: the payload digest is the empty digest, so
            // nothing stops us from signing right away.
            self.finalize()?;
            return Ok(HeadersStatus::Continue);
        }

        Ok(HeadersStatus::StopIteration)
    }

    /// Body event.
    ///
    /// Chunks are hashed in strict arrival order, exactly once. The bytes
    /// themselves are kept in the replay buffer until the request is
    /// released; see [`take_buffered_body`].
    ///
    /// [`take_buffered_body`]: RequestTransform::take_buffered_body
    pub fn on_body(&mut self, chunk: Bytes, end_of_stream: bool) -> Result<DataStatus> {
        if matches!(self.phase, Phase::Idle | Phase::Finalized) {
            return Ok(DataStatus::Continue);
        }

        debug!(
            "hashing body chunk of {} bytes (end_of_stream = {end_of_stream})",
            chunk.len()
        );
        self.hasher.update(&chunk);
        self.buffered.push(chunk);
        self.phase = Phase::Buffering;

        if end_of_stream {
            self.finalize()?;
            return Ok(DataStatus::Continue);
        }

        Ok(DataStatus::StopIterationAndBuffer)
    }

    /// Trailer event.
    ///
    /// A trailer event is the end-of-stream signal for bodies whose last
    /// chunk was not flagged as final. Harmless after the transform has
    /// already finalized.
    pub fn on_trailers(&mut self) -> Result<TrailersStatus> {
        if matches!(self.phase, Phase::Resolving | Phase::Buffering) {
            self.finalize()?;
        }

        Ok(TrailersStatus::Continue)
    }

    /// Release the buffered body chunks, in arrival order.
    ///
    /// The host drains this once the request is released and forwards the
    /// chunks unchanged. Draining moves the chunks out; a second call
    /// returns nothing.
    pub fn take_buffered_body(&mut self) -> Vec<Bytes> {
        mem::take(&mut self.buffered)
    }

    /// Teardown notification from the host.
    ///
    /// Safe at any phase: the held handle and descriptor are dropped and
    /// the request can no longer be touched through this transform.
    pub fn on_destroy(&mut self) {
        self.handle = None;
        self.function = None;
    }

    /// Sign the invocation and release the held request.
    ///
    /// Both the end-of-stream body path and the trailer path funnel here;
    /// the phase guard admits at most one real execution, so a second
    /// trigger can never produce a second signature.
    fn finalize(&mut self) -> Result<()> {
        if !matches!(self.phase, Phase::Resolving | Phase::Buffering) {
            return Ok(());
        }

        let handle = self.handle.take().ok_or_else(|| {
            Error::unexpected("request torn down before the transform finalized")
        })?;
        let function = self
            .function
            .as_ref()
            .ok_or_else(|| Error::unexpected("transform active without a bound function"))?;

        let payload_hash = mem::take(&mut self.hasher).finalize_hex();
        debug!(
            "signing invocation of {:?} with payload digest {payload_hash}",
            function.name
        );

        handle.with_mut(|parts| -> Result<()> {
            parts.headers.insert(
                X_AMZ_INVOCATION_TYPE,
                HeaderValue::from_static(function.mode.as_header_value()),
            );
            parts
                .headers
                .insert(X_AMZ_LOG_TYPE, HeaderValue::from_static("None"));
            parts
                .headers
                .insert(http::header::HOST, HeaderValue::from_str(&function.host)?);
            parts.headers.insert(
                X_AMZ_CONTENT_SHA_256,
                HeaderValue::from_str(&payload_hash)?,
            );

            let mut req = SigningRequest::build(parts, payload_hash);

            let signer = Signer::new("lambda", &function.region);
            #[cfg(test)]
            let signer = match self.time {
                Some(time) => signer.with_time(time),
                None => signer,
            };
            signer.sign(&mut req, &function.credential)?;

            req.apply(parts)
        })?;

        self.phase = Phase::Finalized;

        Ok(())
    }
}

fn rewrite_request_line(parts: &mut Parts, function: &Function) -> Result<()> {
    parts.method = Method::POST;

    let mut uri_parts = mem::take(&mut parts.uri).into_parts();
    uri_parts.path_and_query = Some(PathAndQuery::from_str(&function.invoke_path())?);
    parts.uri = Uri::from_parts(uri_parts)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Credential, InvocationMode, StaticFunctionMap};
    use chrono::TimeZone;
    use chrono::Utc;
    use http::header;
    use lambdafy_core::time::DateTime;
    use lambdafy_core::ErrorKind;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    /// SHA256 of the empty byte sequence.
    const EMPTY_SHA256: &str =
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    const CLUSTER: &str = "lambda-cluster";

    fn fixed_time() -> DateTime {
        Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap()
    }

    fn function() -> Function {
        Function {
            name: "echo".to_string(),
            qualifier: None,
            host: "lambda.us-east-1.amazonaws.com".to_string(),
            region: "us-east-1".to_string(),
            mode: InvocationMode::Sync,
            credential: Credential {
                access_key_id: "access_key_id".to_string(),
                secret_access_key: "secret_access_key".to_string(),
                session_token: None,
            },
        }
    }

    fn transform_for(function: Function) -> RequestTransform {
        let mut map = StaticFunctionMap::new();
        map.insert(CLUSTER, function);
        RequestTransform::new(Arc::new(map)).with_time(fixed_time())
    }

    fn transform() -> RequestTransform {
        transform_for(function())
    }

    fn route() -> RouteContext<'static> {
        RouteContext {
            route: "api",
            cluster: CLUSTER,
            metadata: None,
        }
    }

    fn handle() -> RequestHandle {
        let _ = env_logger::builder().is_test(true).try_init();

        let parts = http::Request::builder()
            .method(Method::GET)
            .uri("/getsomething")
            .body(())
            .expect("request must be valid")
            .into_parts()
            .0;
        RequestHandle::new(parts)
    }

    fn header(handle: &RequestHandle, name: &str) -> Option<String> {
        let name = name.to_string();
        handle.with(|parts| {
            parts
                .headers
                .get(name.as_str())
                .map(|v| v.to_str().expect("header must be ascii").to_string())
        })
    }

    #[test]
    fn test_signs_on_headers_end_stream() {
        let mut transform = transform();
        let handle = handle();

        let status = transform
            .on_headers(&handle, &route(), true)
            .expect("headers must succeed");

        assert_eq!(status, HeadersStatus::Continue);
        assert_eq!(transform.phase(), Phase::Finalized);

        // Bodiless requests sign the digest of the empty byte sequence.
        assert_eq!(
            header(&handle, "x-amz-content-sha256").as_deref(),
            Some(EMPTY_SHA256)
        );
        assert!(header(&handle, "authorization").is_some());
        handle.with(|parts| {
            assert_eq!(parts.method, Method::POST);
            assert_eq!(parts.uri.path(), "/2015-03-31/functions/echo/invocations");
        });
    }

    #[test]
    fn test_signs_on_body_end_stream() {
        let mut transform = transform();
        let handle = handle();

        assert_eq!(
            transform
                .on_headers(&handle, &route(), false)
                .expect("headers must succeed"),
            HeadersStatus::StopIteration
        );
        assert!(header(&handle, "authorization").is_none());

        assert_eq!(
            transform
                .on_body(Bytes::from_static(b"data"), true)
                .expect("body must succeed"),
            DataStatus::Continue
        );

        assert!(header(&handle, "authorization").is_some());
        assert_eq!(
            header(&handle, "x-amz-content-sha256"),
            Some(lambdafy_core::hash::hex_sha256(b"data"))
        );
    }

    #[test]
    fn test_signs_on_trailers() {
        let mut transform = transform();
        let handle = handle();

        assert_eq!(
            transform
                .on_headers(&handle, &route(), false)
                .expect("headers must succeed"),
            HeadersStatus::StopIteration
        );
        assert_eq!(
            transform
                .on_body(Bytes::from_static(b"data"), false)
                .expect("body must succeed"),
            DataStatus::StopIterationAndBuffer
        );
        assert!(header(&handle, "authorization").is_none());

        assert_eq!(
            transform.on_trailers().expect("trailers must succeed"),
            TrailersStatus::Continue
        );

        assert!(header(&handle, "authorization").is_some());
        assert_eq!(transform.phase(), Phase::Finalized);
    }

    #[test_case(&["data"]; "single chunk")]
    #[test_case(&["da", "ta"]; "two chunks")]
    #[test_case(&["d", "a", "t", "a"]; "byte at a time")]
    fn test_signature_is_split_invariant(chunks: &[&str]) {
        // Baseline: the whole payload in one chunk.
        let mut baseline = transform();
        let baseline_handle = handle();
        baseline
            .on_headers(&baseline_handle, &route(), false)
            .expect("headers must succeed");
        baseline
            .on_body(Bytes::from_static(b"data"), true)
            .expect("body must succeed");

        let mut transform = transform();
        let handle = handle();
        transform
            .on_headers(&handle, &route(), false)
            .expect("headers must succeed");
        for (i, chunk) in chunks.iter().enumerate() {
            let end_of_stream = i == chunks.len() - 1;
            transform
                .on_body(Bytes::copy_from_slice(chunk.as_bytes()), end_of_stream)
                .expect("body must succeed");
        }

        assert_eq!(
            header(&handle, "x-amz-content-sha256"),
            header(&baseline_handle, "x-amz-content-sha256")
        );
        assert_eq!(
            header(&handle, "authorization"),
            header(&baseline_handle, "authorization")
        );
    }

    #[test]
    fn test_passes_through_when_unresolved() {
        let mut transform = RequestTransform::new(Arc::new(StaticFunctionMap::new()));
        let handle = handle();

        assert_eq!(
            transform
                .on_headers(&handle, &route(), false)
                .expect("headers must succeed"),
            HeadersStatus::Continue
        );
        assert_eq!(
            transform
                .on_body(Bytes::from_static(b"data"), false)
                .expect("body must succeed"),
            DataStatus::Continue
        );
        assert_eq!(
            transform.on_trailers().expect("trailers must succeed"),
            TrailersStatus::Continue
        );

        assert_eq!(transform.phase(), Phase::Idle);
        assert!(transform.take_buffered_body().is_empty());
        assert!(header(&handle, "authorization").is_none());
        handle.with(|parts| {
            assert_eq!(parts.method, Method::GET);
            assert_eq!(parts.uri.path(), "/getsomething");
        });
    }

    #[test_case(InvocationMode::Sync, "RequestResponse")]
    #[test_case(InvocationMode::Async, "Event")]
    fn test_invocation_mode_header(mode: InvocationMode, expected: &str) {
        let mut f = function();
        f.mode = mode;
        let mut transform = transform_for(f);
        let handle = handle();

        transform
            .on_headers(&handle, &route(), true)
            .expect("headers must succeed");

        assert_eq!(
            header(&handle, "x-amz-invocation-type").as_deref(),
            Some(expected)
        );
        assert_eq!(header(&handle, "x-amz-log-type").as_deref(), Some("None"));
        assert_eq!(
            header(&handle, "host").as_deref(),
            Some("lambda.us-east-1.amazonaws.com")
        );
    }

    #[test_case(None, "/2015-03-31/functions/echo/invocations"; "absent")]
    #[test_case(Some(""), "/2015-03-31/functions/echo/invocations"; "empty")]
    #[test_case(Some("v3"), "/2015-03-31/functions/echo/invocations?Qualifier=v3"; "present")]
    fn test_qualifier_in_rewritten_path(qualifier: Option<&str>, expected: &str) {
        let mut f = function();
        f.qualifier = qualifier.map(str::to_string);
        let mut transform = transform_for(f);
        let handle = handle();

        transform
            .on_headers(&handle, &route(), true)
            .expect("headers must succeed");

        handle.with(|parts| {
            assert_eq!(
                parts
                    .uri
                    .path_and_query()
                    .expect("path must be present")
                    .as_str(),
                expected
            );
        });
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let mut transform = transform();
        let handle = handle();

        transform
            .on_headers(&handle, &route(), false)
            .expect("headers must succeed");
        transform
            .on_body(Bytes::from_static(b"data"), true)
            .expect("body must succeed");

        let authorization = header(&handle, "authorization");
        let digest = header(&handle, "x-amz-content-sha256");

        // The host may still deliver a trailer event after the last body
        // chunk already carried the end-of-stream flag.
        assert_eq!(
            transform.on_trailers().expect("trailers must succeed"),
            TrailersStatus::Continue
        );

        assert_eq!(header(&handle, "authorization"), authorization);
        assert_eq!(header(&handle, "x-amz-content-sha256"), digest);
        handle.with(|parts| {
            assert_eq!(parts.headers.get_all(header::AUTHORIZATION).iter().count(), 1);
        });
    }

    #[test]
    fn test_buffered_body_released_in_order() {
        let mut transform = transform();
        let handle = handle();

        transform
            .on_headers(&handle, &route(), false)
            .expect("headers must succeed");
        transform
            .on_body(Bytes::from_static(b"alpha"), false)
            .expect("body must succeed");
        transform
            .on_body(Bytes::from_static(b"beta"), false)
            .expect("body must succeed");
        transform
            .on_body(Bytes::from_static(b"gamma"), true)
            .expect("body must succeed");

        assert_eq!(
            transform.take_buffered_body(),
            vec![
                Bytes::from_static(b"alpha"),
                Bytes::from_static(b"beta"),
                Bytes::from_static(b"gamma"),
            ]
        );
        // The buffer is drained, not copied.
        assert!(transform.take_buffered_body().is_empty());
    }

    #[test]
    fn test_missing_credentials_fail_the_request() {
        let mut f = function();
        f.credential = Credential::default();
        let mut transform = transform_for(f);
        let handle = handle();

        let err = transform
            .on_headers(&handle, &route(), true)
            .expect_err("unsigned invocation must not be released");

        assert_eq!(err.kind(), ErrorKind::CredentialInvalid);
        assert!(header(&handle, "authorization").is_none());
    }

    #[test]
    fn test_headers_twice_is_rejected() {
        let mut transform = transform();
        let handle = handle();

        transform
            .on_headers(&handle, &route(), false)
            .expect("headers must succeed");
        let err = transform
            .on_headers(&handle, &route(), false)
            .expect_err("second header event must be rejected");

        assert_eq!(err.kind(), ErrorKind::RequestInvalid);
    }

    #[test]
    fn test_teardown_is_safe_at_any_phase() {
        // Idle.
        let mut idle = RequestTransform::new(Arc::new(StaticFunctionMap::new()));
        idle.on_destroy();

        // Suspended with a held handle and a half-hashed body.
        let mut buffering = transform();
        let handle = handle();
        buffering
            .on_headers(&handle, &route(), false)
            .expect("headers must succeed");
        buffering
            .on_body(Bytes::from_static(b"data"), false)
            .expect("body must succeed");
        buffering.on_destroy();
        drop(buffering);

        // The host still owns the request head after the transform is gone.
        assert!(handle.into_parts().is_some());

        // Finalized.
        let mut finalized = transform();
        let handle = self::handle();
        finalized
            .on_headers(&handle, &route(), true)
            .expect("headers must succeed");
        finalized.on_destroy();
    }

    #[test]
    fn test_body_passes_through_after_finalize() {
        let mut transform = transform();
        let handle = handle();

        transform
            .on_headers(&handle, &route(), true)
            .expect("headers must succeed");

        // A chunk surfacing after release is none of our business anymore.
        assert_eq!(
            transform
                .on_body(Bytes::from_static(b"late"), true)
                .expect("body must succeed"),
            DataStatus::Continue
        );
        assert_eq!(
            header(&handle, "x-amz-content-sha256").as_deref(),
            Some(EMPTY_SHA256)
        );
    }
}
