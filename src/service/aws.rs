//! AWS plumbing shared by the Glacier and SimpleDB clients: credentials,
//! request signing (V4 and V2), error classification and tiny XML helpers

use anyhow::{anyhow, Context, Result};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ServiceError;

type HmacSha256 = Hmac<Sha256>;

/// Everything except RFC 3986 unreserved characters gets escaped
const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// SHA-256 of an empty payload
pub const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

#[derive(Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    /// Environment variables first, then the shared credentials file
    pub fn load(profile: Option<&str>) -> Result<Self> {
        if let (Ok(id), Ok(secret)) = (
            std::env::var("AWS_ACCESS_KEY_ID"),
            std::env::var("AWS_SECRET_ACCESS_KEY"),
        ) {
            return Ok(Self {
                access_key_id: id,
                secret_access_key: secret,
                session_token: std::env::var("AWS_SESSION_TOKEN").ok(),
            });
        }

        let profile = profile
            .map(str::to_string)
            .or_else(|| std::env::var("AWS_PROFILE").ok())
            .unwrap_or_else(|| "default".to_string());
        let path = std::env::var("AWS_SHARED_CREDENTIALS_FILE")
            .map(PathBuf::from)
            .or_else(|_| {
                std::env::var("HOME").map(|h| PathBuf::from(h).join(".aws").join("credentials"))
            })
            .map_err(|_| anyhow!("no AWS credentials in environment and HOME is not set"))?;
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        parse_profile(&contents, &profile)
            .ok_or_else(|| anyhow!("profile [{profile}] not found in {}", path.display()))
    }
}

/// Pick one `[profile]` section out of an INI-style credentials file
fn parse_profile(contents: &str, profile: &str) -> Option<Credentials> {
    let mut in_section = false;
    let mut id = None;
    let mut secret = None;
    let mut token = None;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            in_section = name.trim() == profile;
            continue;
        }
        if !in_section {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            let v = v.trim().to_string();
            match k.trim() {
                "aws_access_key_id" => id = Some(v),
                "aws_secret_access_key" => secret = Some(v),
                "aws_session_token" => token = Some(v),
                _ => {}
            }
        }
    }
    Some(Credentials {
        access_key_id: id?,
        secret_access_key: secret?,
        session_token: token,
    })
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// RFC 3986 percent-encoding as both signature versions require
pub fn uri_encode(s: &str) -> String {
    utf8_percent_encode(s, UNRESERVED).to_string()
}

/// Blocking HTTP client with the timeouts used for every AWS call
pub fn http_client() -> Result<reqwest::blocking::Client, ServiceError> {
    reqwest::blocking::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        // Covers streaming a whole part body
        .timeout(Duration::from_secs(3600))
        .build()
        .map_err(|e| ServiceError::Protocol(format!("HTTP client: {e}")))
}

/// AWS Signature Version 4 for one service/region
pub struct SigV4 {
    creds: Credentials,
    region: String,
    service: String,
}

impl SigV4 {
    pub fn new(creds: Credentials, region: &str, service: &str) -> Self {
        Self {
            creds,
            region: region.to_string(),
            service: service.to_string(),
        }
    }

    fn signing_key(&self, date: &str) -> Vec<u8> {
        let k_secret = format!("AWS4{}", self.creds.secret_access_key);
        let k_date = hmac_sha256(k_secret.as_bytes(), date.as_bytes());
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, self.service.as_bytes());
        hmac_sha256(&k_service, b"aws4_request")
    }

    /// Adds `host`, `x-amz-date` (and the session token) to `headers` and
    /// returns the `Authorization` header value.
    ///
    /// `path` must already be URI-encoded; `query` is the canonical query string.
    pub fn sign(
        &self,
        method: &str,
        host: &str,
        path: &str,
        query: &str,
        headers: &mut Vec<(String, String)>,
        payload_sha256: &str,
        now: DateTime<Utc>,
    ) -> String {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        headers.push(("host".to_string(), host.to_string()));
        headers.push(("x-amz-date".to_string(), amz_date.clone()));
        if let Some(token) = &self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }

        let mut canonical: Vec<(String, String)> = headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.trim().to_string()))
            .collect();
        canonical.sort();
        let canonical_headers: String = canonical
            .iter()
            .map(|(k, v)| format!("{k}:{v}\n"))
            .collect();
        let signed_headers = canonical
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_request = format!(
            "{method}\n{path}\n{query}\n{canonical_headers}\n{signed_headers}\n{payload_sha256}"
        );
        let scope = format!("{date}/{}/{}/aws4_request", self.region, self.service);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            sha256_hex(canonical_request.as_bytes())
        );
        let signature = hex::encode(hmac_sha256(
            &self.signing_key(&date),
            string_to_sign.as_bytes(),
        ));
        format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.creds.access_key_id
        )
    }
}

/// AWS Signature Version 2 (query APIs such as SimpleDB).
///
/// Adds the auth parameters to `params` and returns the encoded form body.
pub fn sign_v2(
    creds: &Credentials,
    host: &str,
    params: &mut Vec<(String, String)>,
    now: DateTime<Utc>,
) -> String {
    params.push(("AWSAccessKeyId".into(), creds.access_key_id.clone()));
    params.push(("SignatureMethod".into(), "HmacSHA256".into()));
    params.push(("SignatureVersion".into(), "2".into()));
    params.push((
        "Timestamp".into(),
        now.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
    ));
    if let Some(token) = &creds.session_token {
        params.push(("SecurityToken".into(), token.clone()));
    }
    params.sort();
    let query = encode_params(params);
    let string_to_sign = format!("POST\n{}\n/\n{query}", host.to_ascii_lowercase());
    let signature = base64::engine::general_purpose::STANDARD.encode(hmac_sha256(
        creds.secret_access_key.as_bytes(),
        string_to_sign.as_bytes(),
    ));
    format!("{query}&Signature={}", uri_encode(&signature))
}

fn encode_params(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Map a failed exchange onto the service error taxonomy
pub fn classify_transport(op: &str, err: reqwest::Error) -> ServiceError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        ServiceError::Transient(format!("{op}: {err}"))
    } else {
        ServiceError::Protocol(format!("{op}: {err}"))
    }
}

/// Send a request, turning transport failures and non-2xx statuses into errors
pub fn send(
    op: &str,
    req: reqwest::blocking::RequestBuilder,
) -> Result<reqwest::blocking::Response, ServiceError> {
    let resp = req.send().map_err(|e| classify_transport(op, e))?;
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().unwrap_or_default();
    Err(classify_status(op, status.as_u16(), body.trim()))
}

pub fn classify_status(op: &str, code: u16, body: &str) -> ServiceError {
    let msg = format!("{op}: HTTP {code} {body}");
    match code {
        408 | 429 | 500..=599 => ServiceError::Transient(msg),
        404 => ServiceError::NotFound(msg),
        _ if body.to_ascii_lowercase().contains("checksum") => ServiceError::ChecksumMismatch(msg),
        _ => ServiceError::Rejected(msg),
    }
}

/// Inner text of every `<tag>...</tag>` in document order (no nesting of the same tag)
pub fn xml_elements<'a>(doc: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut out = Vec::new();
    let mut rest = doc;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        match after.find(&close) {
            Some(end) => {
                out.push(&after[..end]);
                rest = &after[end + close.len()..];
            }
            None => break,
        }
    }
    out
}

pub fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#13;", "\r")
        .replace("&#10;", "\n")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn example_creds() -> Credentials {
        Credentials {
            access_key_id: "AKIDEXAMPLE".into(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".into(),
            session_token: None,
        }
    }

    #[test]
    fn sigv4_matches_published_example() {
        // IAM ListUsers example from the AWS Signature Version 4 documentation
        let signer = SigV4::new(example_creds(), "us-east-1", "iam");
        let now = Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap();
        let mut headers = vec![(
            "Content-Type".to_string(),
            "application/x-www-form-urlencoded; charset=utf-8".to_string(),
        )];
        let auth = signer.sign(
            "GET",
            "iam.amazonaws.com",
            "/",
            "Action=ListUsers&Version=2010-05-08",
            &mut headers,
            EMPTY_PAYLOAD_SHA256,
            now,
        );
        assert_eq!(
            auth,
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/iam/aws4_request, \
             SignedHeaders=content-type;host;x-amz-date, \
             Signature=5d672d79c15b13162d9279b0855cfba6789a8edb4c82c400e06b5924a6f2b5d7"
        );
        assert!(headers.iter().any(|(k, v)| k == "x-amz-date" && v == "20150830T123600Z"));
    }

    #[test]
    fn signing_key_derivation() {
        let signer = SigV4::new(example_creds(), "us-east-1", "iam");
        assert_eq!(
            hex::encode(signer.signing_key("20150830")),
            "c4afb1cc5771d871763a393e44b703571b55cc28424d1a5e86da6ed3c154a4b9"
        );
    }

    #[test]
    fn sigv2_body_is_sorted_and_signed() {
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let mut params = vec![
            ("Version".to_string(), "2009-04-15".to_string()),
            ("Action".to_string(), "ListDomains".to_string()),
        ];
        let body = sign_v2(&example_creds(), "sdb.eu-west-1.amazonaws.com", &mut params, now);
        assert!(body.starts_with("AWSAccessKeyId=AKIDEXAMPLE&Action=ListDomains&"));
        assert!(body.contains("Timestamp=2024-01-02T03%3A04%3A05Z"));
        let signature = body.rsplit_once("&Signature=").unwrap().1;
        assert!(!signature.is_empty());
        assert!(!signature.contains('+') && !signature.contains('/'));
    }

    #[test]
    fn reads_named_profile() {
        let ini = "[default]\naws_access_key_id = A\naws_secret_access_key = B\n\n\
                   [backup]\naws_access_key_id=C\naws_secret_access_key=D\naws_session_token=E\n";
        let c = parse_profile(ini, "backup").unwrap();
        assert_eq!(c.access_key_id, "C");
        assert_eq!(c.session_token.as_deref(), Some("E"));
        assert_eq!(parse_profile(ini, "default").unwrap().secret_access_key, "B");
        assert!(parse_profile(ini, "missing").is_none());
    }

    #[test]
    fn status_classification() {
        assert!(classify_status("x", 503, "").is_transient());
        assert!(classify_status("x", 408, "").is_transient());
        assert!(matches!(classify_status("x", 404, ""), ServiceError::NotFound(_)));
        assert!(matches!(
            classify_status("x", 400, r#"{"message":"Checksum mismatch"}"#),
            ServiceError::ChecksumMismatch(_)
        ));
        assert!(!classify_status("x", 403, "denied").is_transient());
    }

    #[test]
    fn xml_extraction() {
        let doc = "<R><Attribute><Name>json.000</Name><Value>[{&quot;a&quot;:1}]</Value></Attribute>\
                   <Attribute><Name>json.001</Name><Value></Value></Attribute></R>";
        let attrs = xml_elements(doc, "Attribute");
        assert_eq!(attrs.len(), 2);
        assert_eq!(xml_elements(attrs[0], "Name"), vec!["json.000"]);
        assert_eq!(xml_unescape(xml_elements(attrs[0], "Value")[0]), r#"[{"a":1}]"#);
        assert_eq!(xml_elements(attrs[1], "Value"), vec![""]);
    }
}
