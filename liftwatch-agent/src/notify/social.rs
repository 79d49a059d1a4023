//! Social post sink
//!
//! Posts status updates through the v2 tweet endpoint, authenticated with
//! OAuth 1.0a user context (HMAC-SHA1 signature over the request).

use super::{Sink, SinkError};
use crate::config::{Secret, SinkKind, SocialConfig};
use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::header::AUTHORIZATION;
use sha1::Sha1;
use std::time::Duration;
use tracing::debug;

/// RFC 3986 unreserved characters stay as-is, everything else is encoded
const OAUTH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(Debug, Clone)]
pub struct OAuthCredentials {
    pub consumer_key: String,
    pub consumer_secret: Secret,
    pub token: String,
    pub token_secret: Secret,
}

pub fn percent_encode(raw: &str) -> String {
    utf8_percent_encode(raw, OAUTH_ENCODE_SET).to_string()
}

/// `Authorization` header value for one request.
///
/// `request_params` are the query/form parameters that take part in the
/// signature; JSON bodies do not, so the tweet endpoint passes none.
pub fn oauth1_authorization(
    method: &str,
    url: &str,
    request_params: &[(&str, &str)],
    credentials: &OAuthCredentials,
    nonce: &str,
    timestamp: i64,
) -> Result<String, SinkError> {
    let timestamp = timestamp.to_string();
    let oauth_params = [
        ("oauth_consumer_key", credentials.consumer_key.as_str()),
        ("oauth_nonce", nonce),
        ("oauth_signature_method", "HMAC-SHA1"),
        ("oauth_timestamp", timestamp.as_str()),
        ("oauth_token", credentials.token.as_str()),
        ("oauth_version", "1.0"),
    ];

    let mut encoded: Vec<(String, String)> = oauth_params
        .iter()
        .chain(request_params.iter())
        .map(|(k, v)| (percent_encode(k), percent_encode(v)))
        .collect();
    encoded.sort();

    let parameter_string = encoded
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    let base_string = format!(
        "{}&{}&{}",
        method.to_ascii_uppercase(),
        percent_encode(url),
        percent_encode(&parameter_string)
    );
    let signing_key = format!(
        "{}&{}",
        percent_encode(credentials.consumer_secret.expose()),
        percent_encode(credentials.token_secret.expose())
    );

    let mut mac = Hmac::<Sha1>::new_from_slice(signing_key.as_bytes())
        .map_err(|e| SinkError::Other(format!("invalid signing key: {e}")))?;
    mac.update(base_string.as_bytes());
    let signature = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

    let mut header_params: Vec<(&str, &str)> = oauth_params.to_vec();
    header_params.push(("oauth_signature", signature.as_str()));
    header_params.sort();

    let fields = header_params
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join(", ");
    Ok(format!("OAuth {fields}"))
}

pub struct SocialSink {
    client: reqwest::Client,
    api_url: String,
    credentials: OAuthCredentials,
}

impl SocialSink {
    pub fn new(config: &SocialConfig) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            credentials: OAuthCredentials {
                consumer_key: config.api_key.clone(),
                consumer_secret: config.api_secret.clone(),
                token: config.access_token.clone(),
                token_secret: config.access_token_secret.clone(),
            },
        })
    }
}

#[async_trait]
impl Sink for SocialSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Social
    }

    async fn deliver(&self, message: &str) -> Result<(), SinkError> {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let authorization = oauth1_authorization(
            "POST",
            &self.api_url,
            &[],
            &self.credentials,
            &nonce,
            chrono::Utc::now().timestamp(),
        )?;

        let response = self
            .client
            .post(&self.api_url)
            .header(AUTHORIZATION, authorization)
            .json(&serde_json::json!({ "text": message }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Rejected { status, body });
        }

        debug!("Status update posted ({})", status);
        Ok(())
    }
}
