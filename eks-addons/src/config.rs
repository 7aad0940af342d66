//! Assembles a Kubernetes client configuration for an EKS cluster

use crate::{
    eks::{ClusterConnectionInfo, ClusterMetadataResolver, DescribeCluster, EksClient},
    errors::{CredentialError, EksClusterError, KubeconfigError},
    kubeconfig::{self, ClusterAccessConfig},
    sts::{AssumeRole, SigningSessionFactory, StsAssumeRole},
    token::{BearerToken, TokenGenerator},
};
use aws_types::SdkConfig;
use kube_client::config::{KubeConfigOptions, Kubeconfig};
use std::path::PathBuf;

/// Identifies the cluster to configure a client for
#[derive(Clone, Debug)]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
pub struct ClusterArgs {
    /// The name of the EKS cluster.
    #[cfg_attr(feature = "clap", clap(long, env = "EKS_CLUSTER_NAME"))]
    pub cluster_name: String,

    /// The region the cluster runs in.
    #[cfg_attr(feature = "clap", clap(long, env = "AWS_DEFAULT_REGION"))]
    pub region: String,

    /// A role to assume before signing the cluster token.
    #[cfg_attr(feature = "clap", clap(long, env = "EKS_AUTH_ROLE_ARN"))]
    pub role_arn: Option<String>,

    /// Where the generated kubeconfig is written.
    #[cfg_attr(
        feature = "clap",
        clap(long, env = "KUBECONFIG_PATH", default_value = kubeconfig::DEFAULT_PATH)
    )]
    pub kubeconfig_path: PathBuf,
}

/// Builds [`ApiClientConfiguration`]s for one cluster
#[derive(Debug)]
pub struct ClientConfigAssembler<D = EksClient, R = StsAssumeRole> {
    args: ClusterArgs,
    resolver: ClusterMetadataResolver<D>,
    sessions: SigningSessionFactory<R>,
}

/// A Kubernetes API client configuration authenticated with a bearer token
///
/// The token expires shortly after it is issued, so a configuration should
/// be used for a single invocation and then discarded.
#[derive(Clone, Debug)]
pub struct ApiClientConfiguration {
    kubeconfig: Kubeconfig,
    context: String,
    token: BearerToken,
    cluster_status: Option<String>,
}

/// Indicates that a client configuration could not be assembled
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A bearer token could not be produced
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// Cluster metadata could not be resolved
    #[error(transparent)]
    Cluster(#[from] EksClusterError),

    /// The kubeconfig could not be written or loaded
    #[error(transparent)]
    Kubeconfig(#[from] KubeconfigError),
}

// === impl ClusterArgs ===

impl ClusterArgs {
    /// Configures a cluster with the default kubeconfig path and no role
    pub fn new(cluster_name: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            region: region.into(),
            role_arn: None,
            kubeconfig_path: kubeconfig::DEFAULT_PATH.into(),
        }
    }

    /// Builds an assembler that uses the AWS clients and base credentials of `config`
    pub fn into_assembler(
        self,
        config: &SdkConfig,
    ) -> Result<ClientConfigAssembler, CredentialError> {
        let sessions = SigningSessionFactory::from_sdk_config(config)?;
        let resolver = ClusterMetadataResolver::new(EksClient::new(config));
        Ok(ClientConfigAssembler::new(self, resolver, sessions))
    }
}

// === impl ClientConfigAssembler ===

impl<D: DescribeCluster, R: AssumeRole> ClientConfigAssembler<D, R> {
    /// Creates an assembler from its collaborators
    pub fn new(
        args: ClusterArgs,
        resolver: ClusterMetadataResolver<D>,
        sessions: SigningSessionFactory<R>,
    ) -> Self {
        Self {
            args,
            resolver,
            sessions,
        }
    }

    /// Returns a client configuration, or `None` if any step failed
    ///
    /// Failures are logged here and not returned: callers without a
    /// configuration cannot act on the cluster and must not try to.
    pub async fn get_config(&self) -> Option<ApiClientConfiguration> {
        match self.update_kubeconfig().await {
            Ok(config) => Some(config),
            Err(error) => {
                tracing::error!(
                    %error,
                    cluster = %self.args.cluster_name,
                    "Could not get cluster configuration"
                );
                None
            }
        }
    }

    /// Rewrites the kubeconfig and loads it
    ///
    /// Resolves cluster metadata, obtains a signing client, generates a fresh
    /// token, writes the kubeconfig document over any previous file, and loads
    /// it back. A failure at any step aborts the remaining steps.
    pub async fn update_kubeconfig(&self) -> Result<ApiClientConfiguration, Error> {
        let ClusterArgs {
            cluster_name,
            region,
            role_arn,
            kubeconfig_path,
        } = &self.args;

        let info = self.resolver.get_cluster_info(cluster_name).await?;
        let signer = self
            .sessions
            .get_signing_client(region, role_arn.as_deref())
            .await?;
        let token = TokenGenerator::new(signer).get_token(cluster_name)?;

        let doc = Self::generate_kubeconfig(&info, &token);
        doc.write(kubeconfig_path).await?;
        let kubeconfig = kubeconfig::load(kubeconfig_path).await?;

        tracing::info!(arn = %info.arn, path = %kubeconfig_path.display(), "Updated kubeconfig");
        Ok(ApiClientConfiguration {
            kubeconfig,
            context: doc.current_context().to_string(),
            token,
            cluster_status: info.status,
        })
    }

    /// Builds the kubeconfig document for a cluster
    pub fn generate_kubeconfig(
        info: &ClusterConnectionInfo,
        token: &BearerToken,
    ) -> ClusterAccessConfig {
        ClusterAccessConfig::new(info, token)
    }
}

// === impl ApiClientConfiguration ===

impl ApiClientConfiguration {
    /// The loaded kubeconfig
    pub fn kubeconfig(&self) -> &Kubeconfig {
        &self.kubeconfig
    }

    /// The kubeconfig context the client uses
    pub fn context(&self) -> &str {
        &self.context
    }

    /// The bearer token
    pub fn token(&self) -> &BearerToken {
        &self.token
    }

    /// The value of the `Authorization` header, i.e. `Bearer <token>`
    pub fn authorization(&self) -> String {
        self.token.authorization()
    }

    /// The cluster status reported when the configuration was assembled
    pub fn cluster_status(&self) -> Option<&str> {
        self.cluster_status.as_deref()
    }

    /// Converts the configuration into a kube-rs [`kube_client::Config`]
    pub async fn to_kube_config(&self) -> Result<kube_client::Config, KubeconfigError> {
        let options = KubeConfigOptions {
            context: Some(self.context.clone()),
            ..Default::default()
        };
        Ok(kube_client::Config::from_custom_kubeconfig(self.kubeconfig.clone(), &options).await?)
    }

    /// Builds a Kubernetes client
    pub async fn try_client(&self) -> Result<kube_client::Client, KubeconfigError> {
        let config = self.to_kube_config().await?;
        Ok(kube_client::Client::try_from(config)?)
    }
}
