//! EKS bearer tokens
//!
//! A token is a presigned STS `GetCallerIdentity` URL, encoded as unpadded
//! URL-safe base64 behind the `k8s-aws-v1.` prefix. The cluster's
//! authenticator replays the URL to learn the caller's identity. Tokens are
//! valid for as long as the presigned URL is, so they are never cached.

use crate::{
    errors::CredentialError,
    sts::{Presign, PresignRequest, SigningClient, CLUSTER_NAME_PARAM, GET_CALLER_IDENTITY},
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// The prefix recognized by the cluster's authenticator webhook.
pub const TOKEN_PREFIX: &str = "k8s-aws-v1.";

/// How long presigned URLs remain valid.
pub const URL_TIMEOUT: Duration = Duration::from_secs(60);

/// The expiration advertised to clients in an [`ExecCredential`], in minutes.
pub const TOKEN_EXPIRATION_MINS: i64 = 14;

/// Generates bearer tokens for a cluster
#[derive(Clone, Debug)]
pub struct TokenGenerator<P = SigningClient> {
    presigner: P,
}

/// A bearer token for the Kubernetes API of an EKS cluster
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken(String);

/// Indicates that a string is not a well-formed bearer token
#[derive(Debug, thiserror::Error)]
pub enum InvalidToken {
    /// The token does not start with [`TOKEN_PREFIX`]
    #[error("token does not start with {TOKEN_PREFIX}")]
    MissingPrefix,

    /// The token body is not unpadded URL-safe base64
    #[error("token is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The decoded token body is not UTF-8
    #[error("token does not encode a URL: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// A `client.authentication.k8s.io` credential, as printed by exec credential plugins
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecCredential {
    kind: &'static str,
    api_version: &'static str,
    spec: ExecCredentialSpec,
    status: ExecCredentialStatus,
}

#[derive(Clone, Debug, Serialize)]
struct ExecCredentialSpec {}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecCredentialStatus {
    expiration_timestamp: String,
    token: String,
}

// === impl TokenGenerator ===

impl<P: Presign> TokenGenerator<P> {
    /// Creates a generator that presigns with `presigner`
    pub fn new(presigner: P) -> Self {
        Self { presigner }
    }

    /// Generates a fresh token for `cluster_name`
    ///
    /// The presigned URL always expires after [`URL_TIMEOUT`].
    pub fn get_token(&self, cluster_name: &str) -> Result<BearerToken, CredentialError> {
        let url = self.presigner.generate_presigned_url(PresignRequest {
            operation: GET_CALLER_IDENTITY,
            params: [(CLUSTER_NAME_PARAM.to_string(), cluster_name.to_string())].into(),
            expires_in: URL_TIMEOUT,
            method: http::Method::GET,
        })?;
        tracing::debug!(cluster = %cluster_name, "Generated token");
        Ok(BearerToken::from_presigned_url(&url))
    }
}

// === impl BearerToken ===

impl BearerToken {
    /// Encodes a presigned URL as a token
    pub fn from_presigned_url(url: &str) -> Self {
        Self(format!("{TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(url)))
    }

    /// Parses a token string, checking that it encodes a URL
    pub fn parse(token: &str) -> Result<Self, InvalidToken> {
        let token = Self(token.to_string());
        token.presigned_url()?;
        Ok(token)
    }

    /// Decodes the presigned URL carried by the token
    pub fn presigned_url(&self) -> Result<String, InvalidToken> {
        let body = self
            .0
            .strip_prefix(TOKEN_PREFIX)
            .ok_or(InvalidToken::MissingPrefix)?;
        let bytes = URL_SAFE_NO_PAD.decode(body)?;
        Ok(String::from_utf8(bytes)?)
    }

    /// The token string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The value of an HTTP `Authorization` header carrying this token
    pub fn authorization(&self) -> String {
        format!("Bearer {}", self.0)
    }

    /// Wraps the token in an [`ExecCredential`] issued at `issued_at`
    pub fn exec_credential(&self, issued_at: DateTime<Utc>) -> ExecCredential {
        let expiration = issued_at + chrono::Duration::minutes(TOKEN_EXPIRATION_MINS);
        ExecCredential {
            kind: "ExecCredential",
            api_version: "client.authentication.k8s.io/v1beta1",
            spec: ExecCredentialSpec {},
            status: ExecCredentialStatus {
                expiration_timestamp: expiration
                    .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                token: self.0.clone(),
            },
        }
    }
}

impl std::fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BearerToken").field(&"<redacted>").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sts::{ClusterNameInterceptor, MockPresign};
    use aws_credential_types::Credentials;
    use chrono::TimeZone;
    use std::time::SystemTime;

    fn stub_presigner(url: &'static str) -> MockPresign {
        let mut presigner = MockPresign::new();
        presigner
            .expect_generate_presigned_url()
            .withf(|req| {
                req.operation == GET_CALLER_IDENTITY
                    && req.params.get(CLUSTER_NAME_PARAM).map(String::as_str) == Some("MyCluster")
                    && req.expires_in == Duration::from_secs(60)
                    && req.method == http::Method::GET
            })
            .returning(move |_| Ok(url.to_string()));
        presigner
    }

    #[test]
    fn token_has_no_padding() {
        let generator = TokenGenerator::new(stub_presigner("https://sts.amazonaws.com/"));
        let token = generator.get_token("MyCluster").expect("token");
        assert!(!token.as_str().contains('='));
        assert_eq!(
            token.as_str(),
            "k8s-aws-v1.aHR0cHM6Ly9zdHMuYW1hem9uYXdzLmNvbS8"
        );
    }

    #[test]
    fn token_decodes_to_presigned_url() {
        for url in [
            "https://sts.amazonaws.com/",
            "https://presignedurl.test.com",
            "https://sts.us-west-2.amazonaws.com/?Action=GetCallerIdentity&X-Amz-Expires=60",
        ] {
            let token = BearerToken::from_presigned_url(url);
            assert!(token.as_str().starts_with(TOKEN_PREFIX));
            assert!(!token.as_str().contains('='));
            assert_eq!(token.presigned_url().expect("decodes"), url);
        }
    }

    #[test]
    fn every_call_presigns_again() {
        let mut presigner = MockPresign::new();
        presigner
            .expect_generate_presigned_url()
            .times(2)
            .returning(|_| Ok("https://sts.amazonaws.com/".to_string()));
        let generator = TokenGenerator::new(presigner);
        generator.get_token("MyCluster").expect("first token");
        generator.get_token("MyCluster").expect("second token");
    }

    #[test]
    fn signing_errors_propagate() {
        let mut presigner = MockPresign::new();
        presigner
            .expect_generate_presigned_url()
            .returning(|_| Err(CredentialError::Signing("clock skew".to_string())));
        let err = TokenGenerator::new(presigner)
            .get_token("MyCluster")
            .expect_err("must fail");
        assert!(matches!(err, CredentialError::Signing(_)));
    }

    #[test]
    fn tokens_differ_across_instants() {
        let client = SigningClient::new(
            Credentials::new("ABCDEFGHIJKLMNOPQRST", "TSRQPONMLKJUHGFEDCBA", None, None, "test"),
            "us-west-2",
        )
        .with_interceptor(ClusterNameInterceptor);
        let token_at = |secs| {
            let t = SystemTime::UNIX_EPOCH + Duration::from_secs(secs);
            TokenGenerator::new(client.clone().with_time(t))
                .get_token("MyCluster")
                .expect("token")
        };

        let first = token_at(1_600_000_000);
        let second = token_at(1_600_000_060);
        assert_ne!(first, second);
        for token in [first, second] {
            let url = token.presigned_url().expect("decodes");
            assert!(url.contains("Action=GetCallerIdentity"), "{url}");
            assert!(url.contains("X-Amz-Expires=60"), "{url}");
        }
    }

    #[test]
    fn parse_rejects_malformed_tokens() {
        assert!(matches!(
            BearerToken::parse("aHR0cHM6Ly9zdHMuYW1hem9uYXdzLmNvbS8"),
            Err(InvalidToken::MissingPrefix)
        ));
        assert!(matches!(
            BearerToken::parse("k8s-aws-v1.aHR0cHM6Ly9zdHMuYW1hem9uYXdzLmNvbS8="),
            Err(InvalidToken::Base64(_))
        ));
        assert!(BearerToken::parse("k8s-aws-v1.aHR0cHM6Ly9zdHMuYW1hem9uYXdzLmNvbS8").is_ok());
    }

    #[test]
    fn debug_redacts_token() {
        let token = BearerToken::from_presigned_url("https://sts.amazonaws.com/");
        assert_eq!(format!("{token:?}"), "BearerToken(\"<redacted>\")");
        assert_eq!(
            token.authorization(),
            "Bearer k8s-aws-v1.aHR0cHM6Ly9zdHMuYW1hem9uYXdzLmNvbS8"
        );
    }

    #[test]
    fn exec_credential_expires_after_fourteen_minutes() {
        let token = BearerToken::from_presigned_url("https://sts.amazonaws.com/");
        let issued_at = Utc.with_ymd_and_hms(2020, 9, 13, 12, 26, 40).unwrap();
        let json = serde_json::to_value(token.exec_credential(issued_at)).expect("serializes");
        assert_eq!(
            json,
            serde_json::json!({
                "kind": "ExecCredential",
                "apiVersion": "client.authentication.k8s.io/v1beta1",
                "spec": {},
                "status": {
                    "expirationTimestamp": "2020-09-13T12:40:40Z",
                    "token": "k8s-aws-v1.aHR0cHM6Ly9zdHMuYW1hem9uYXdzLmNvbS8",
                },
            })
        );
    }
}
