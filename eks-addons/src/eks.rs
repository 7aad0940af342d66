//! Cluster connection metadata from the EKS control plane

use crate::errors::EksClusterError;
use async_trait::async_trait;
use aws_types::SdkConfig;

#[cfg(test)]
use mockall::automock;

/// The raw fields of a describe-cluster response
///
/// Every field is optional because the control plane omits fields it has
/// not populated yet, e.g. while the cluster is still being created.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterDescription {
    /// The API server endpoint.
    pub endpoint: Option<String>,

    /// Base64-encoded certificate authority data.
    pub certificate_authority_data: Option<String>,

    /// The cluster ARN.
    pub arn: Option<String>,

    /// The cluster status, e.g. `ACTIVE` or `CREATING`.
    pub status: Option<String>,
}

/// The connection details of a cluster's Kubernetes API
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterConnectionInfo {
    /// The API server endpoint.
    pub endpoint: String,

    /// Base64-encoded certificate authority data.
    pub certificate_authority_data: String,

    /// The cluster ARN.
    pub arn: String,

    /// The cluster status as reported by the control plane. It is not
    /// checked here; callers that require an `ACTIVE` cluster must check it.
    pub status: Option<String>,
}

/// Describes clusters
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DescribeCluster: Send + Sync {
    /// Describes the named cluster. `Ok(None)` means the response carried no cluster.
    async fn describe_cluster(
        &self,
        name: &str,
    ) -> Result<Option<ClusterDescription>, EksClusterError>;
}

/// Resolves [`ClusterConnectionInfo`]
#[derive(Clone, Debug)]
pub struct ClusterMetadataResolver<D = EksClient> {
    client: D,
}

/// Describes clusters through the EKS API
#[derive(Clone, Debug)]
pub struct EksClient(aws_sdk_eks::Client);

// === impl ClusterMetadataResolver ===

impl<D: DescribeCluster> ClusterMetadataResolver<D> {
    /// Creates a resolver that describes clusters with `client`
    pub fn new(client: D) -> Self {
        Self { client }
    }

    /// Describes `cluster_id` once and extracts its connection details
    ///
    /// Nothing is cached: each call describes the cluster again.
    pub async fn get_cluster_info(
        &self,
        cluster_id: &str,
    ) -> Result<ClusterConnectionInfo, EksClusterError> {
        let cluster = self
            .client
            .describe_cluster(cluster_id)
            .await?
            .ok_or_else(|| EksClusterError::NotFound(cluster_id.to_string()))?;

        let info = ClusterConnectionInfo {
            endpoint: cluster
                .endpoint
                .ok_or(EksClusterError::MissingField("endpoint"))?,
            certificate_authority_data: cluster
                .certificate_authority_data
                .ok_or(EksClusterError::MissingField("certificateAuthority.data"))?,
            arn: cluster.arn.ok_or(EksClusterError::MissingField("arn"))?,
            status: cluster.status,
        };
        tracing::debug!(
            arn = %info.arn,
            endpoint = %info.endpoint,
            status = ?info.status,
            "Described cluster"
        );
        Ok(info)
    }
}

// === impl EksClient ===

impl EksClient {
    /// Creates an EKS client from `config`
    pub fn new(config: &SdkConfig) -> Self {
        Self(aws_sdk_eks::Client::new(config))
    }
}

#[async_trait]
impl DescribeCluster for EksClient {
    async fn describe_cluster(
        &self,
        name: &str,
    ) -> Result<Option<ClusterDescription>, EksClusterError> {
        let rsp = self
            .0
            .describe_cluster()
            .name(name)
            .send()
            .await
            .map_err(|e| EksClusterError::Describe {
                cluster: name.to_string(),
                message: aws_sdk_eks::error::DisplayErrorContext(&e).to_string(),
            })?;

        Ok(rsp.cluster().map(|cluster| ClusterDescription {
            endpoint: cluster.endpoint().map(str::to_string),
            certificate_authority_data: cluster
                .certificate_authority()
                .and_then(|ca| ca.data())
                .map(str::to_string),
            arn: cluster.arn().map(str::to_string),
            status: cluster.status().map(|s| s.as_str().to_string()),
        }))
    }
}
