//! The on-disk cluster access configuration
//!
//! The document is a kubeconfig with exactly one cluster, one context and one
//! user, all named by the cluster ARN. It is rewritten from scratch on every
//! invocation and never merged with an existing file.

use crate::{eks::ClusterConnectionInfo, errors::KubeconfigError, token::BearerToken};
use kube_client::config::Kubeconfig;
use serde::Serialize;
use std::{collections::BTreeMap, path::Path};

/// The default location of the kubeconfig document.
pub const DEFAULT_PATH: &str = "/tmp/kubeconfig";

/// A single-cluster kubeconfig document
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClusterAccessConfig {
    #[serde(rename = "apiVersion")]
    api_version: &'static str,
    clusters: Vec<NamedCluster>,
    contexts: Vec<NamedContext>,
    #[serde(rename = "current-context")]
    current_context: String,
    kind: &'static str,
    preferences: BTreeMap<String, String>,
    users: Vec<NamedUser>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
struct NamedCluster {
    cluster: ClusterEntry,
    name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
struct ClusterEntry {
    #[serde(rename = "certificate-authority-data")]
    certificate_authority_data: String,
    server: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
struct NamedContext {
    context: ContextEntry,
    name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
struct ContextEntry {
    cluster: String,
    user: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
struct NamedUser {
    name: String,
    user: UserEntry,
}

#[derive(Clone, PartialEq, Eq, Serialize)]
struct UserEntry {
    token: String,
}

// === impl ClusterAccessConfig ===

impl ClusterAccessConfig {
    /// Builds the document for a cluster, authenticating with `token`
    pub fn new(info: &ClusterConnectionInfo, token: &BearerToken) -> Self {
        let arn = &info.arn;
        Self {
            api_version: "v1",
            clusters: vec![NamedCluster {
                cluster: ClusterEntry {
                    certificate_authority_data: info.certificate_authority_data.clone(),
                    server: info.endpoint.clone(),
                },
                name: arn.clone(),
            }],
            contexts: vec![NamedContext {
                context: ContextEntry {
                    cluster: arn.clone(),
                    user: arn.clone(),
                },
                name: arn.clone(),
            }],
            current_context: arn.clone(),
            kind: "Config",
            preferences: BTreeMap::new(),
            users: vec![NamedUser {
                name: arn.clone(),
                user: UserEntry {
                    token: token.as_str().to_string(),
                },
            }],
        }
    }

    /// The name of the current context, which is the cluster ARN
    pub fn current_context(&self) -> &str {
        &self.current_context
    }

    /// Renders the document as block-style YAML
    pub fn to_yaml(&self) -> Result<String, KubeconfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Writes the document to `path`, replacing any previous content
    pub async fn write(&self, path: impl AsRef<Path>) -> Result<(), KubeconfigError> {
        let yaml = self.to_yaml()?;
        tokio::fs::write(path.as_ref(), yaml).await?;
        tracing::debug!(path = %path.as_ref().display(), "Wrote kubeconfig");
        Ok(())
    }
}

/// Reads a kubeconfig document from `path`
pub async fn load(path: impl AsRef<Path>) -> Result<Kubeconfig, KubeconfigError> {
    let yaml = tokio::fs::read_to_string(path).await?;
    Ok(Kubeconfig::from_yaml(&yaml)?)
}

impl std::fmt::Debug for UserEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserEntry")
            .field("token", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eks::tests::{ARN, CA_DATA, ENDPOINT};

    fn info() -> ClusterConnectionInfo {
        ClusterConnectionInfo {
            endpoint: ENDPOINT.to_string(),
            certificate_authority_data: CA_DATA.to_string(),
            arn: ARN.to_string(),
            status: Some("ACTIVE".to_string()),
        }
    }

    fn token() -> BearerToken {
        BearerToken::from_presigned_url("https://presignedurl.test.com")
    }

    #[test]
    fn renders_block_style_document() {
        let yaml = ClusterAccessConfig::new(&info(), &token())
            .to_yaml()
            .expect("yaml");
        let expected = format!(
            "apiVersion: v1
clusters:
- cluster:
    certificate-authority-data: {CA_DATA}
    server: {ENDPOINT}
  name: {ARN}
contexts:
- context:
    cluster: {ARN}
    user: {ARN}
  name: {ARN}
current-context: {ARN}
kind: Config
preferences: {{}}
users:
- name: {ARN}
  user:
    token: {}
",
            token().as_str()
        );
        assert_eq!(yaml, expected);
    }

    #[tokio::test]
    async fn written_document_loads_into_kubeconfig() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("kubeconfig");
        std::fs::write(&path, "stale: content\nthat: is-longer-than-nothing\n").expect("write");

        ClusterAccessConfig::new(&info(), &token())
            .write(&path)
            .await
            .expect("write kubeconfig");
        let kubeconfig = load(&path).await.expect("load kubeconfig");

        assert_eq!(kubeconfig.current_context.as_deref(), Some(ARN));
        assert_eq!(kubeconfig.clusters.len(), 1);
        assert_eq!(kubeconfig.clusters[0].name, ARN);
        let cluster = kubeconfig.clusters[0].cluster.as_ref().expect("cluster");
        assert_eq!(cluster.server.as_deref(), Some(ENDPOINT));
        assert_eq!(cluster.certificate_authority_data.as_deref(), Some(CA_DATA));
        assert_eq!(kubeconfig.contexts.len(), 1);
        assert_eq!(kubeconfig.contexts[0].name, ARN);
        assert_eq!(kubeconfig.auth_infos.len(), 1);
        assert_eq!(kubeconfig.auth_infos[0].name, ARN);
        let user = kubeconfig.auth_infos[0].auth_info.as_ref().expect("user");
        assert!(user.token.is_some());
    }

    #[test]
    fn debug_redacts_token() {
        let doc = ClusterAccessConfig::new(&info(), &token());
        let debug = format!("{doc:?}");
        assert!(!debug.contains(token().as_str()));
        assert!(debug.contains("<redacted>"));
    }
}
