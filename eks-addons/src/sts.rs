//! Signing clients for the AWS Security Token Service
//!
//! A [`SigningSessionFactory`] turns base credentials into a
//! [`SigningClient`], optionally exchanging them for the temporary
//! credentials of an assumed role first. Signing clients never send
//! requests; they only presign them.

use crate::errors::CredentialError;
use async_trait::async_trait;
use aws_credential_types::{
    provider::{error::CredentialsError, ProvideCredentials, SharedCredentialsProvider},
    Credentials,
};
use aws_sigv4::http_request::{SignableBody, SignableRequest, SignatureLocation, SigningSettings};
use aws_smithy_runtime_api::client::identity::Identity;
use aws_types::{region::Region, SdkConfig};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::{Duration, SystemTime},
};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// The header that carries the cluster name in the signed identity-assertion request.
pub const CLUSTER_NAME_HEADER: &str = "x-k8s-aws-id";

/// The out-of-band request parameter consumed by [`ClusterNameInterceptor`].
pub const CLUSTER_NAME_PARAM: &str = "ClusterName";

/// The session name used when assuming a role.
pub const ROLE_SESSION_NAME: &str = "EKSGetTokenAuth";

/// The STS operation presigned for cluster authentication.
pub const GET_CALLER_IDENTITY: &str = "GetCallerIdentity";

const STS_SERVICE: &str = "sts";
const STS_API_VERSION: &str = "2011-06-15";
const CLUSTER_CONTEXT_KEY: &str = "eks_cluster";

/// Exchanges base credentials for the temporary credentials of a role
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AssumeRole: Send + Sync {
    /// Assumes `role_arn` in `region`, returning the temporary credentials
    async fn assume_role(
        &self,
        region: &str,
        role_arn: &str,
        session_name: &str,
    ) -> Result<Credentials, CredentialError>;
}

/// Produces presigned URLs
#[cfg_attr(test, automock)]
pub trait Presign: Send + Sync {
    /// Presigns `request`, returning the URL
    fn generate_presigned_url(&self, request: PresignRequest) -> Result<String, CredentialError>;
}

/// Hooks into the lifecycle of a request before it is presigned
///
/// `read_params` runs first and may move parameters out of the request into
/// the per-request [`RequestContext`]. `modify_before_signing` runs just
/// before the signature is computed; headers added there are covered by the
/// signature.
pub trait Interceptor: std::fmt::Debug + Send + Sync {
    /// Inspects (and may remove) the logical request parameters
    fn read_params(
        &self,
        _operation: &str,
        _params: &mut BTreeMap<String, String>,
        _context: &mut RequestContext,
    ) {
    }

    /// Adds headers to the request before it is signed
    fn modify_before_signing(
        &self,
        _operation: &str,
        _context: &RequestContext,
        _headers: &mut Vec<(String, String)>,
    ) {
    }
}

/// Per-request state shared between interceptor hooks
#[derive(Clone, Debug, Default)]
pub struct RequestContext(HashMap<&'static str, String>);

/// Moves the `ClusterName` parameter of `GetCallerIdentity` into the signed
/// `x-k8s-aws-id` header
#[derive(Clone, Copy, Debug, Default)]
pub struct ClusterNameInterceptor;

/// A request to presign
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresignRequest {
    /// The STS operation name, e.g. `GetCallerIdentity`.
    pub operation: &'static str,

    /// Logical request parameters. Parameters left after the interceptors have
    /// run are encoded into the query string.
    pub params: BTreeMap<String, String>,

    /// How long the presigned URL remains valid.
    pub expires_in: Duration,

    /// The HTTP method of the presigned request.
    pub method: http::Method,
}

/// Presigns STS requests with a fixed set of credentials
///
/// Requests target the regional STS endpoint. Regions prefixed with `cn-`
/// resolve to the `amazonaws.com.cn` domain and all others to
/// `amazonaws.com`; other partitions are not recognized.
#[derive(Clone, Debug)]
pub struct SigningClient {
    credentials: Credentials,
    region: String,
    interceptors: Vec<Arc<dyn Interceptor>>,
    time: Option<SystemTime>,
}

/// Builds [`SigningClient`]s from base credentials
#[derive(Debug)]
pub struct SigningSessionFactory<R = StsAssumeRole> {
    base: SharedCredentialsProvider,
    sts: R,
}

/// Assumes roles through the STS API
#[derive(Clone, Debug)]
pub struct StsAssumeRole {
    config: SdkConfig,
}

// === impl RequestContext ===

impl RequestContext {
    /// Stores a value for later hooks
    pub fn insert(&mut self, key: &'static str, value: String) {
        self.0.insert(key, value);
    }

    /// Returns a value stored by an earlier hook
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

// === impl ClusterNameInterceptor ===

impl Interceptor for ClusterNameInterceptor {
    fn read_params(
        &self,
        operation: &str,
        params: &mut BTreeMap<String, String>,
        context: &mut RequestContext,
    ) {
        if operation != GET_CALLER_IDENTITY {
            return;
        }
        if let Some(cluster) = params.remove(CLUSTER_NAME_PARAM) {
            context.insert(CLUSTER_CONTEXT_KEY, cluster);
        }
    }

    fn modify_before_signing(
        &self,
        operation: &str,
        context: &RequestContext,
        headers: &mut Vec<(String, String)>,
    ) {
        if operation != GET_CALLER_IDENTITY {
            return;
        }
        if let Some(cluster) = context.get(CLUSTER_CONTEXT_KEY) {
            headers.push((CLUSTER_NAME_HEADER.to_string(), cluster.to_string()));
        }
    }
}

// === impl SigningClient ===

impl SigningClient {
    /// Creates a signing client without interceptors
    pub fn new(credentials: Credentials, region: impl Into<String>) -> Self {
        Self {
            credentials,
            region: region.into(),
            interceptors: Vec::new(),
            time: None,
        }
    }

    /// Registers an interceptor. Interceptors run in registration order.
    pub fn with_interceptor(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Fixes the signing clock. The system clock is used otherwise.
    pub fn with_time(mut self, time: SystemTime) -> Self {
        self.time = Some(time);
        self
    }

    /// The region requests are scoped to
    pub fn region(&self) -> &str {
        &self.region
    }

    /// The credentials requests are signed with
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    fn endpoint(&self) -> String {
        let domain = if self.region.starts_with("cn-") {
            "amazonaws.com.cn"
        } else {
            "amazonaws.com"
        };
        format!("https://{STS_SERVICE}.{}.{domain}/", self.region)
    }
}

impl Presign for SigningClient {
    fn generate_presigned_url(&self, request: PresignRequest) -> Result<String, CredentialError> {
        let PresignRequest {
            operation,
            mut params,
            expires_in,
            method,
        } = request;

        let mut context = RequestContext::default();
        for interceptor in &self.interceptors {
            interceptor.read_params(operation, &mut params, &mut context);
        }

        let query = [("Action", operation), ("Version", STS_API_VERSION)]
            .into_iter()
            .chain(params.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        let url = url::Url::parse_with_params(&self.endpoint(), query)
            .map_err(|e| CredentialError::Signing(e.to_string()))?;

        let mut headers = Vec::new();
        for interceptor in &self.interceptors {
            interceptor.modify_before_signing(operation, &context, &mut headers);
        }

        let mut settings = SigningSettings::default();
        settings.expires_in = Some(expires_in);
        settings.signature_location = SignatureLocation::QueryParams;

        let identity = Identity::from(self.credentials.clone());
        let params = aws_sigv4::sign::v4::SigningParams::builder()
            .identity(&identity)
            .region(&self.region)
            .name(STS_SERVICE)
            .time(self.time.unwrap_or_else(SystemTime::now))
            .settings(settings)
            .build()
            .map_err(|e| CredentialError::Signing(e.to_string()))?;

        let signable = SignableRequest::new(
            method.as_str(),
            url.as_str(),
            headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            SignableBody::Bytes(&[]),
        )
        .map_err(|e| CredentialError::Signing(e.to_string()))?;

        let (instructions, _signature) = aws_sigv4::http_request::sign(
            signable,
            &aws_sigv4::http_request::SigningParams::V4(params),
        )
        .map_err(|e| CredentialError::Signing(e.to_string()))?
        .into_parts();

        let mut req = http::Request::builder()
            .method(method)
            .uri(url.as_str())
            .body(())
            .map_err(|e| CredentialError::Signing(e.to_string()))?;
        instructions.apply_to_request_http1x(&mut req);

        Ok(req.uri().to_string())
    }
}

// === impl SigningSessionFactory ===

impl SigningSessionFactory<StsAssumeRole> {
    /// Uses the credentials provider of `config` as the base credentials
    pub fn from_sdk_config(config: &SdkConfig) -> Result<Self, CredentialError> {
        let base = config.credentials_provider().ok_or_else(|| {
            CredentialError::Provider(CredentialsError::not_loaded(
                "no credentials provider is configured",
            ))
        })?;
        Ok(Self::new(base, StsAssumeRole::new(config.clone())))
    }
}

impl<R: AssumeRole> SigningSessionFactory<R> {
    /// Creates a factory from base credentials and a role-assumption client
    pub fn new(base: SharedCredentialsProvider, sts: R) -> Self {
        Self { base, sts }
    }

    /// Returns a signing client scoped to `region`
    ///
    /// When `role_arn` is set, the base credentials are exchanged for the
    /// role's temporary credentials, which the client then signs with.
    /// Otherwise no STS call is made and the base credentials are used
    /// directly. Either way the client carries the [`ClusterNameInterceptor`].
    pub async fn get_signing_client(
        &self,
        region: &str,
        role_arn: Option<&str>,
    ) -> Result<SigningClient, CredentialError> {
        let credentials = match role_arn {
            Some(role_arn) => {
                debug!(%role_arn, %region, "Assuming role");
                self.sts
                    .assume_role(region, role_arn, ROLE_SESSION_NAME)
                    .await?
            }
            None => self
                .base
                .provide_credentials()
                .await
                .map_err(CredentialError::Provider)?,
        };

        Ok(SigningClient::new(credentials, region).with_interceptor(ClusterNameInterceptor))
    }
}

// === impl StsAssumeRole ===

impl StsAssumeRole {
    /// Assumes roles with the credentials of `config`
    pub fn new(config: SdkConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl AssumeRole for StsAssumeRole {
    async fn assume_role(
        &self,
        region: &str,
        role_arn: &str,
        session_name: &str,
    ) -> Result<Credentials, CredentialError> {
        let config = aws_sdk_sts::config::Builder::from(&self.config)
            .region(Region::new(region.to_string()))
            .build();
        let output = aws_sdk_sts::Client::from_conf(config)
            .assume_role()
            .role_arn(role_arn)
            .role_session_name(session_name)
            .send()
            .await
            .map_err(|e| CredentialError::AssumeRole {
                role_arn: role_arn.to_string(),
                message: aws_sdk_sts::error::DisplayErrorContext(&e).to_string(),
            })?;

        let creds = output
            .credentials()
            .ok_or_else(|| CredentialError::MissingCredentials(role_arn.to_string()))?;
        let expiry = SystemTime::try_from(*creds.expiration()).ok();
        Ok(Credentials::new(
            creds.access_key_id(),
            creds.secret_access_key(),
            Some(creds.session_token().to_string()),
            expiry,
            "AssumeRole",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    const REGION: &str = "us-west-2";
    const ROLE_ARN: &str = "arn:aws:iam::012345678910:role/RoleArn";

    fn base_credentials() -> Credentials {
        Credentials::new(
            "ABCDEFGHIJKLMNOPQRST",
            "TSRQPONMLKJUHGFEDCBA",
            None,
            None,
            "test",
        )
    }

    fn role_credentials() -> Credentials {
        Credentials::new(
            "ASIATEMPORARYACCESS1",
            "temporary-secret",
            Some("temporary-session-token".to_string()),
            None,
            "AssumeRole",
        )
    }

    fn factory(sts: MockAssumeRole) -> SigningSessionFactory<MockAssumeRole> {
        SigningSessionFactory::new(SharedCredentialsProvider::new(base_credentials()), sts)
    }

    fn caller_identity(cluster: &str) -> PresignRequest {
        PresignRequest {
            operation: GET_CALLER_IDENTITY,
            params: [(CLUSTER_NAME_PARAM.to_string(), cluster.to_string())].into(),
            expires_in: Duration::from_secs(60),
            method: http::Method::GET,
        }
    }

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[tokio::test]
    async fn without_role_uses_base_credentials() {
        let mut sts = MockAssumeRole::new();
        sts.expect_assume_role().never();

        let client = factory(sts)
            .get_signing_client(REGION, None)
            .await
            .expect("signing client");
        assert_eq!(client.credentials().access_key_id(), "ABCDEFGHIJKLMNOPQRST");
        assert_eq!(client.credentials().session_token(), None);
        assert_eq!(client.region(), REGION);
    }

    #[tokio::test]
    async fn with_role_assumes_exactly_once() {
        let mut sts = MockAssumeRole::new();
        sts.expect_assume_role()
            .with(eq(REGION), eq(ROLE_ARN), eq(ROLE_SESSION_NAME))
            .times(1)
            .returning(|_, _, _| Ok(role_credentials()));

        let client = factory(sts)
            .get_signing_client(REGION, Some(ROLE_ARN))
            .await
            .expect("signing client");
        assert_eq!(client.credentials().access_key_id(), "ASIATEMPORARYACCESS1");
        assert_eq!(client.credentials().secret_access_key(), "temporary-secret");
        assert_eq!(
            client.credentials().session_token(),
            Some("temporary-session-token")
        );

        let url = client
            .with_time(at(1_600_000_000))
            .generate_presigned_url(caller_identity("MyCluster"))
            .expect("presigned url");
        assert!(url.contains("X-Amz-Credential=ASIATEMPORARYACCESS1"), "{url}");
        assert!(url.contains("X-Amz-Security-Token="), "{url}");
    }

    #[tokio::test]
    async fn role_assumption_failure_propagates() {
        let mut sts = MockAssumeRole::new();
        sts.expect_assume_role().times(1).returning(|_, role_arn, _| {
            Err(CredentialError::AssumeRole {
                role_arn: role_arn.to_string(),
                message: "AccessDenied".to_string(),
            })
        });

        let err = factory(sts)
            .get_signing_client(REGION, Some(ROLE_ARN))
            .await
            .expect_err("assume role must fail");
        assert!(matches!(err, CredentialError::AssumeRole { .. }));
    }

    #[test]
    fn presigns_caller_identity_with_cluster_header() {
        let client = SigningClient::new(base_credentials(), REGION)
            .with_interceptor(ClusterNameInterceptor)
            .with_time(at(1_600_000_000));
        let url = client
            .generate_presigned_url(caller_identity("MyCluster"))
            .expect("presigned url");

        assert!(
            url.starts_with("https://sts.us-west-2.amazonaws.com/?"),
            "{url}"
        );
        assert!(url.contains("Action=GetCallerIdentity"), "{url}");
        assert!(url.contains("Version=2011-06-15"), "{url}");
        assert!(url.contains("X-Amz-Expires=60"), "{url}");
        assert!(url.contains("X-Amz-Signature="), "{url}");
        assert!(url.contains(CLUSTER_NAME_HEADER), "{url}");
        assert!(!url.contains("ClusterName"), "{url}");
        assert!(!url.contains("X-Amz-Security-Token"), "{url}");
    }

    #[test]
    fn china_regions_use_the_china_domain() {
        let url = SigningClient::new(base_credentials(), "cn-north-1")
            .with_interceptor(ClusterNameInterceptor)
            .with_time(at(1_600_000_000))
            .generate_presigned_url(caller_identity("MyCluster"))
            .expect("presigned url");
        assert!(
            url.starts_with("https://sts.cn-north-1.amazonaws.com.cn/?"),
            "{url}"
        );
        assert!(url.contains("%2Fcn-north-1%2Fsts%2Faws4_request"), "{url}");
    }

    #[test]
    fn without_interceptor_cluster_name_stays_a_parameter() {
        let client = SigningClient::new(base_credentials(), REGION).with_time(at(1_600_000_000));
        let url = client
            .generate_presigned_url(caller_identity("MyCluster"))
            .expect("presigned url");
        assert!(url.contains("ClusterName=MyCluster"), "{url}");
        assert!(!url.contains(CLUSTER_NAME_HEADER), "{url}");
    }

    #[test]
    fn signature_depends_on_clock() {
        let client = SigningClient::new(base_credentials(), REGION)
            .with_interceptor(ClusterNameInterceptor);
        let sign_at = |secs| {
            client
                .clone()
                .with_time(at(secs))
                .generate_presigned_url(caller_identity("MyCluster"))
                .expect("presigned url")
        };
        assert_eq!(sign_at(1_600_000_000), sign_at(1_600_000_000));
        assert_ne!(sign_at(1_600_000_000), sign_at(1_600_000_001));
    }

    #[test]
    fn interceptor_ignores_other_operations() {
        let mut params: BTreeMap<_, _> =
            [(CLUSTER_NAME_PARAM.to_string(), "MyCluster".to_string())].into();
        let mut context = RequestContext::default();
        ClusterNameInterceptor.read_params("AssumeRole", &mut params, &mut context);
        assert!(params.contains_key(CLUSTER_NAME_PARAM));
        assert_eq!(context.get(CLUSTER_CONTEXT_KEY), None);

        ClusterNameInterceptor.read_params(GET_CALLER_IDENTITY, &mut params, &mut context);
        assert!(params.is_empty());
        let mut headers = Vec::new();
        ClusterNameInterceptor.modify_before_signing(GET_CALLER_IDENTITY, &context, &mut headers);
        assert_eq!(
            headers,
            vec![(CLUSTER_NAME_HEADER.to_string(), "MyCluster".to_string())]
        );
    }
}
