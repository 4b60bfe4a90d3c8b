use std::collections::HashMap;

use percent_encoding::utf8_percent_encode;
use serde::Deserialize;

use crate::constants::{AWS_QUERY_ENCODE_SET, INVOKE_API_VERSION};
use crate::Credential;

/// Lambda invocation semantics for a routed function.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationMode {
    /// Invoke synchronously and wait for the function result.
    #[default]
    Sync,
    /// Invoke asynchronously; the function result is discarded.
    Async,
}

impl InvocationMode {
    /// Value carried by the `x-amz-invocation-type` header.
    pub fn as_header_value(&self) -> &'static str {
        match self {
            InvocationMode::Sync => "RequestResponse",
            InvocationMode::Async => "Event",
        }
    }
}

/// Resolved invocation target for one request.
#[derive(Clone, Debug, Deserialize)]
pub struct Function {
    /// Function name.
    pub name: String,
    /// Version or alias selector, appended to the invoke path only when
    /// present and non-empty.
    #[serde(default)]
    pub qualifier: Option<String>,
    /// Hostname of the regional Lambda endpoint.
    pub host: String,
    /// Signing region.
    pub region: String,
    /// Invocation semantics.
    #[serde(default)]
    pub mode: InvocationMode,
    /// Credentials used to sign the invocation.
    pub credential: Credential,
}

impl Function {
    /// Invoke path for this function.
    pub fn invoke_path(&self) -> String {
        let mut path = format!(
            "/{}/functions/{}/invocations",
            INVOKE_API_VERSION,
            utf8_percent_encode(&self.name, &AWS_QUERY_ENCODE_SET)
        );

        match self.qualifier.as_deref() {
            Some(q) if !q.is_empty() => {
                path.push_str("?Qualifier=");
                path.extend(utf8_percent_encode(q, &AWS_QUERY_ENCODE_SET));
            }
            _ => {}
        }

        path
    }
}

/// Route information available to the resolver at header time.
#[derive(Clone, Copy, Debug)]
pub struct RouteContext<'a> {
    /// Name of the matched route.
    pub route: &'a str,
    /// Name of the upstream cluster the route targets.
    pub cluster: &'a str,
    /// Function metadata the host attached to the route, if any.
    pub metadata: Option<&'a serde_json::Value>,
}

/// Maps a routed request to its target function.
pub trait ResolveFunction {
    /// Returns the invocation target for this route, or `None` when the
    /// route does not point at a function. Called once per request at
    /// header time; `None` is a normal skip, not an error.
    fn resolve(&self, route: &RouteContext<'_>) -> Option<Function>;
}

/// Cluster-name-keyed function table.
///
/// The reference [`ResolveFunction`] implementation, deserializable from a
/// host's own configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(transparent)]
pub struct StaticFunctionMap {
    functions: HashMap<String, Function>,
}

impl StaticFunctionMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the function a cluster routes to.
    pub fn insert(&mut self, cluster: impl Into<String>, function: Function) {
        self.functions.insert(cluster.into(), function);
    }
}

impl ResolveFunction for StaticFunctionMap {
    fn resolve(&self, route: &RouteContext<'_>) -> Option<Function> {
        self.functions.get(route.cluster).cloned()
    }
}
