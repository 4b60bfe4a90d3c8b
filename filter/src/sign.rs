use std::fmt::Write;

use http::{header, HeaderValue};
use lambdafy_core::hash::{hex_hmac_sha256, hex_sha256, hmac_sha256};
use lambdafy_core::time::{format_date, format_iso8601, now, DateTime};
use lambdafy_core::{Error, Result, SigningRequest};
use log::debug;
use percent_encoding::utf8_percent_encode;

use crate::constants::{
    AWS_QUERY_ENCODE_SET, AWS_URI_ENCODE_SET, X_AMZ_DATE, X_AMZ_SECURITY_TOKEN,
};
use crate::Credential;

/// Request signer that implements AWS SigV4.
///
/// - [Signature Version 4 signing process](https://docs.aws.amazon.com/general/latest/gr/signature-version-4.html)
#[derive(Debug)]
pub struct Signer {
    service: String,
    region: String,

    time: Option<DateTime>,
}

impl Signer {
    /// Create a signer scoped to a service and region.
    pub fn new(service: &str, region: &str) -> Self {
        Self {
            service: service.into(),
            region: region.into(),

            time: None,
        }
    }

    /// Specify the signing time.
    ///
    /// # Note
    ///
    /// We should always take current time to sign requests.
    /// Only use this function for testing.
    #[cfg(test)]
    pub fn with_time(mut self, time: DateTime) -> Self {
        self.time = Some(time);
        self
    }

    /// Sign the request in place.
    ///
    /// Refuses with a credential error when the credential cannot
    /// authenticate the request; an unsigned invocation must never leave
    /// the proxy.
    pub fn sign(&self, req: &mut SigningRequest, cred: &Credential) -> Result<()> {
        if !cred.is_valid() {
            return Err(Error::credential_invalid(
                "an access key and a secret key are required to sign the invocation",
            ));
        }

        let now = self.time.unwrap_or_else(now);

        // canonicalize context
        canonicalize_header(req, cred, now)?;
        canonicalize_query(req);

        // build canonical request and string to sign.
        let creq = canonical_request_string(req)?;
        let encoded_req = hex_sha256(creq.as_bytes());

        // Scope: "20220313/<region>/<service>/aws4_request"
        let scope = format!(
            "{}/{}/{}/aws4_request",
            format_date(now),
            self.region,
            self.service
        );
        debug!("calculated scope: {scope}");

        // StringToSign:
        //
        // AWS4-HMAC-SHA256
        // 20220313T072004Z
        // 20220313/<region>/<service>/aws4_request
        // <hashed_canonical_request>
        let string_to_sign = {
            let mut f = String::new();
            writeln!(f, "AWS4-HMAC-SHA256")?;
            writeln!(f, "{}", format_iso8601(now))?;
            writeln!(f, "{}", &scope)?;
            write!(f, "{}", &encoded_req)?;
            f
        };
        debug!("calculated string to sign: {string_to_sign}");

        let signing_key =
            generate_signing_key(&cred.secret_access_key, now, &self.region, &self.service);
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let mut authorization = HeaderValue::from_str(&format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            cred.access_key_id,
            scope,
            signed_header_names(req).join(";"),
            signature
        ))?;
        authorization.set_sensitive(true);

        req.headers.insert(header::AUTHORIZATION, authorization);

        Ok(())
    }
}

/// Headers included in the signature: `host`, `content-type` when present,
/// and every `x-amz-*` header, sorted lexicographically. Downstream headers
/// outside this set stay unsigned.
fn signed_header_names(req: &SigningRequest) -> Vec<&str> {
    let mut names = req
        .headers
        .keys()
        .map(|k| k.as_str())
        .filter(|name| {
            *name == "host" || *name == "content-type" || name.starts_with("x-amz-")
        })
        .collect::<Vec<&str>>();
    names.sort_unstable();

    names
}

fn canonical_request_string(req: &SigningRequest) -> Result<String> {
    // 256 is specially chosen to avoid reallocation for most requests.
    let mut f = String::with_capacity(256);

    // Insert method
    writeln!(f, "{}", req.method)?;
    // Insert encoded path
    let path = req.path_percent_decoded();
    writeln!(f, "{}", utf8_percent_encode(&path, &AWS_URI_ENCODE_SET))?;
    // Insert query
    writeln!(
        f,
        "{}",
        req.query
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    )?;
    // Insert signed headers
    let signed_headers = signed_header_names(req);
    for name in signed_headers.iter() {
        let values = req
            .headers
            .get_all(*name)
            .iter()
            .map(|v| v.to_str())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        writeln!(f, "{}:{}", name, values.join(","))?;
    }
    writeln!(f)?;
    writeln!(f, "{}", signed_headers.join(";"))?;
    write!(f, "{}", req.payload_hash)?;

    Ok(f)
}

fn canonicalize_header(req: &mut SigningRequest, cred: &Credential, now: DateTime) -> Result<()> {
    // Header values are normalized before they become signing input.
    for (_, value) in req.headers.iter_mut() {
        SigningRequest::header_value_normalize(value)
    }

    // The transform pins HOST to the function endpoint before signing.
    if req.headers.get(header::HOST).is_none() {
        return Err(Error::request_invalid(
            "request must carry a host header before signing",
        ));
    }

    // Insert DATE header if not present.
    if req.headers.get(X_AMZ_DATE).is_none() {
        let date_header = HeaderValue::try_from(format_iso8601(now))?;
        req.headers.insert(X_AMZ_DATE, date_header);
    }

    // Insert X_AMZ_SECURITY_TOKEN header if security token exists.
    if let Some(token) = &cred.session_token {
        let mut value = HeaderValue::from_str(token)?;
        // Set token value sensitive to avoid leaking.
        value.set_sensitive(true);

        req.headers.insert(X_AMZ_SECURITY_TOKEN, value);
    }

    Ok(())
}

fn canonicalize_query(req: &mut SigningRequest) {
    if req.query.is_empty() {
        return;
    }

    // Sort by param name
    req.query.sort();

    req.query = req
        .query
        .iter()
        .map(|(k, v)| {
            (
                utf8_percent_encode(k, &AWS_QUERY_ENCODE_SET).to_string(),
                utf8_percent_encode(v, &AWS_QUERY_ENCODE_SET).to_string(),
            )
        })
        .collect();
}

fn generate_signing_key(secret: &str, time: DateTime, region: &str, service: &str) -> Vec<u8> {
    // Sign secret
    let secret = format!("AWS4{secret}");
    // Sign date
    let sign_date = hmac_sha256(secret.as_bytes(), format_date(time).as_bytes());
    // Sign region
    let sign_region = hmac_sha256(sign_date.as_slice(), region.as_bytes());
    // Sign service
    let sign_service = hmac_sha256(sign_region.as_slice(), service.as_bytes());
    // Sign request
    hmac_sha256(sign_service.as_slice(), "aws4_request".as_bytes())
}
