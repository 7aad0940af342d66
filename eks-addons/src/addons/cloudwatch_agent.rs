//! The CloudWatch agent collects Container Insights metrics from every node

use super::{
    config_map_volume, env, env_from_field, host_path_volume, metadata, mount, read_only_mount,
    resources, rule, string_map, Labels, CI_VERSION,
};
use crate::manifest::{Addon, Manifest};
use k8s_openapi::{
    api::{
        apps::v1::{DaemonSet, DaemonSetSpec},
        core::v1::{ConfigMap, Container, Namespace, PodSpec, PodTemplateSpec, ServiceAccount},
        rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule},
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta},
};

/// The default agent image.
pub const IMAGE: &str = "amazon/cloudwatch-agent:1.245315.0";

/// The config map holding the agent configuration.
pub const CONFIG_MAP: &str = "cwagentconfig";

/// The CloudWatch agent daemon set
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloudWatchAgent {
    /// Names the daemon set and service account.
    pub name: String,
    /// The namespace the agent runs in. It is created with the agent.
    pub namespace: String,
    /// The region metrics are published to.
    pub region: String,
    /// The cluster name attached to published metrics.
    pub cluster_name: String,
    /// The agent image.
    pub image: String,
}

impl CloudWatchAgent {
    /// Configures the agent with its default name, namespace and image
    pub fn new(region: impl Into<String>, cluster_name: impl Into<String>) -> Self {
        Self {
            name: "cloudwatch-agent".to_string(),
            namespace: "amazon-cloudwatch".to_string(),
            region: region.into(),
            cluster_name: cluster_name.into(),
            image: IMAGE.to_string(),
        }
    }

    fn labels(&self) -> Labels {
        string_map([("name", self.name.as_str())])
    }

    fn cluster_role_name(&self) -> String {
        format!("{}-role", self.name)
    }

    /// The agent's namespace
    pub fn namespace(&self) -> Namespace {
        super::namespace(&self.namespace)
    }

    /// One agent per node, with read-only access to the host's filesystems
    pub fn daemon_set(&self) -> DaemonSet {
        DaemonSet {
            metadata: metadata(&self.name, Some(&self.namespace)),
            spec: Some(DaemonSetSpec {
                selector: LabelSelector {
                    match_labels: Some(self.labels()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(self.labels()),
                        ..metadata(&self.name, None)
                    }),
                    spec: Some(PodSpec {
                        service_account_name: Some(self.name.clone()),
                        termination_grace_period_seconds: Some(60),
                        containers: vec![Container {
                            name: self.name.clone(),
                            image: Some(self.image.clone()),
                            resources: Some(resources(
                                &[("cpu", "200m"), ("memory", "200Mi")],
                                &[("cpu", "200m"), ("memory", "200Mi")],
                            )),
                            env: Some(vec![
                                env_from_field("HOST_IP", "status.hostIP"),
                                env_from_field("HOST_NAME", "spec.nodeName"),
                                env_from_field("K8S_NAMESPACE", "metadata.namespace"),
                                env("CI_VERSION", CI_VERSION),
                            ]),
                            volume_mounts: Some(vec![
                                mount("cwagentconfig", "/etc/cwagentconfig"),
                                read_only_mount("rootfs", "/rootfs"),
                                read_only_mount("dockersock", "/var/run/docker.sock"),
                                read_only_mount("varlibdocker", "/var/lib/docker"),
                                read_only_mount("sys", "/sys"),
                                read_only_mount("devdisk", "/dev/disk"),
                            ]),
                            ..Default::default()
                        }],
                        volumes: Some(vec![
                            config_map_volume("cwagentconfig", CONFIG_MAP),
                            host_path_volume("rootfs", "/"),
                            host_path_volume("dockersock", "/var/run/docker.sock"),
                            host_path_volume("varlibdocker", "/var/lib/docker"),
                            host_path_volume("sys", "/sys"),
                            host_path_volume("devdisk", "/dev/disk/"),
                        ]),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// The agent configuration, rendered as JSON
    pub fn agent_config(&self) -> String {
        serde_json::json!({
            "agent": {
                "region": self.region,
            },
            "logs": {
                "metrics_collected": {
                    "kubernetes": {
                        "cluster_name": self.cluster_name,
                        "metrics_collection_interval": 60,
                    },
                },
                "force_flush_interval": 5,
            },
        })
        .to_string()
    }

    /// The config map holding [`Self::agent_config`]
    pub fn config_map(&self) -> ConfigMap {
        ConfigMap {
            metadata: metadata(CONFIG_MAP, Some(&self.namespace)),
            data: Some(
                [("cwagentconfig.json".to_string(), self.agent_config())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        }
    }

    /// The agent's service account
    pub fn service_account(&self) -> ServiceAccount {
        super::service_account(metadata(&self.name, Some(&self.namespace)))
    }

    /// Read access to workloads and nodes, plus the leader-election config map
    pub fn cluster_role(&self) -> ClusterRole {
        ClusterRole {
            metadata: metadata(&self.cluster_role_name(), None),
            rules: Some(vec![
                rule(&[""], &["pods", "nodes", "endpoints"], &["list", "watch"]),
                rule(&["apps"], &["replicasets"], &["list", "watch"]),
                rule(&["batch"], &["jobs"], &["list", "watch"]),
                rule(&[""], &["nodes/proxy"], &["get"]),
                rule(&[""], &["nodes/stats", "configmaps", "events"], &["create"]),
                PolicyRule {
                    resource_names: Some(vec!["cwagent-clusterleader".to_string()]),
                    ..rule(&[""], &["configmaps"], &["get", "update"])
                },
            ]),
            ..Default::default()
        }
    }

    /// Binds the cluster role to the service account
    pub fn cluster_role_binding(&self) -> ClusterRoleBinding {
        super::cluster_role_binding(
            metadata(&format!("{}-role-binding", self.name), None),
            &self.cluster_role_name(),
            &self.name,
            &self.namespace,
        )
    }
}

impl Addon for CloudWatchAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn manifests(&self) -> Vec<Manifest> {
        vec![
            self.namespace().into(),
            self.daemon_set().into(),
            self.config_map().into(),
            self.service_account().into(),
            self.cluster_role().into(),
            self.cluster_role_binding().into(),
        ]
    }
}
