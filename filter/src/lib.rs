//! Lambda invoke filter for a reverse-proxy data path.
//!
//! Rewrites a routed HTTP request into a signed AWS Lambda `Invoke` call:
//! the [`RequestTransform`] state machine accumulates the body across
//! delivery events, hashes it incrementally and, once the full payload is
//! known, signs the call with [`Signer`].

mod constants;

mod credential;
pub use credential::Credential;

mod function;
pub use function::Function;
pub use function::InvocationMode;
pub use function::ResolveFunction;
pub use function::RouteContext;
pub use function::StaticFunctionMap;

mod sign;
pub use sign::Signer;

mod transform;
pub use transform::DataStatus;
pub use transform::HeadersStatus;
pub use transform::Phase;
pub use transform::RequestTransform;
pub use transform::TrailersStatus;
