//! Fluentd ships container, dataplane and host logs to CloudWatch Logs

use super::{
    config_map_volume, empty_dir_volume, env, host_path_volume, metadata, mount, read_only_mount,
    resources, rule, string_map, Labels, CI_VERSION,
};
use crate::manifest::{Addon, Manifest};
use k8s_openapi::{
    api::{
        apps::v1::{DaemonSet, DaemonSetSpec},
        core::v1::{ConfigMap, Container, Namespace, PodSpec, PodTemplateSpec, ServiceAccount},
        rbac::v1::{ClusterRole, ClusterRoleBinding},
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta},
};
use sha2::{Digest, Sha256};

/// The default Fluentd image.
pub const IMAGE: &str = "fluent/fluentd-kubernetes-daemonset:v1.7.3-debian-cloudwatch-1.0";

const INIT_IMAGE: &str = "busybox";

/// The bundled Fluentd configuration files, keyed by file name.
pub const CONFIG_FILES: [(&str, &str); 4] = [
    ("fluent.conf", include_str!("fluentd/fluent.conf")),
    ("containers.conf", include_str!("fluentd/containers.conf")),
    ("systemd.conf", include_str!("fluentd/systemd.conf")),
    ("host.conf", include_str!("fluentd/host.conf")),
];

/// The Fluentd log shipper daemon set
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FluentdAgent {
    /// Names the daemon set and service account, and prefixes the other resources.
    pub name: String,
    /// The namespace the agent runs in. It is created with the agent.
    pub namespace: String,
    /// The region logs are shipped to.
    pub region: String,
    /// The cluster name used in log group names.
    pub cluster_name: String,
    /// The Fluentd image.
    pub image: String,
}

/// Hex-encoded SHA-256 of the bundled configuration files, in order
///
/// Pods are annotated with it so that a configuration change rolls the daemon set.
pub fn config_hash() -> String {
    let mut hasher = Sha256::new();
    for (_, contents) in CONFIG_FILES {
        hasher.update(contents.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

impl FluentdAgent {
    /// Configures the agent with its default name, namespace and image
    pub fn new(region: impl Into<String>, cluster_name: impl Into<String>) -> Self {
        Self {
            name: "fluentd".to_string(),
            namespace: "amazon-cloudwatch".to_string(),
            region: region.into(),
            cluster_name: cluster_name.into(),
            image: IMAGE.to_string(),
        }
    }

    fn labels(&self) -> Labels {
        string_map([("k8s-app", "fluentd-cloudwatch")])
    }

    fn config_map_name(&self) -> String {
        format!("{}-config", self.name)
    }

    fn cluster_role_name(&self) -> String {
        format!("{}-role", self.name)
    }

    /// The agent's namespace
    pub fn namespace(&self) -> Namespace {
        super::namespace(&self.namespace)
    }

    /// One agent per node
    ///
    /// An init container copies the configuration out of the config map
    /// volume into a writable directory.
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
                        annotations: Some(string_map([(
                            "configHash",
                            config_hash().as_str(),
                        )])),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        service_account_name: Some(self.name.clone()),
                        termination_grace_period_seconds: Some(30),
                        init_containers: Some(vec![
                            Container {
                                name: "copy-fluentd-config".to_string(),
                                image: Some(INIT_IMAGE.to_string()),
                                command: Some(vec![
                                    "sh".to_string(),
                                    "-c".to_string(),
                                    "cp /config-volume/..data/* /fluentd/etc".to_string(),
                                ]),
                                volume_mounts: Some(vec![
                                    mount("config-volume", "/config-volume"),
                                    mount("fluentdconf", "/fluentd/etc"),
                                ]),
                                ..Default::default()
                            },
                            Container {
                                name: "update-log-driver".to_string(),
                                image: Some(INIT_IMAGE.to_string()),
                                command: Some(vec![
                                    "sh".to_string(),
                                    "-c".to_string(),
                                    String::new(),
                                ]),
                                ..Default::default()
                            },
                        ]),
                        containers: vec![Container {
                            name: self.name.clone(),
                            image: Some(self.image.clone()),
                            resources: Some(resources(
                                &[("memory", "400Mi")],
                                &[("cpu", "100m"), ("memory", "200Mi")],
                            )),
                            env: Some(vec![
                                env("REGION", &self.region),
                                env("CLUSTER_NAME", &self.cluster_name),
                                env("CI_VERSION", CI_VERSION),
                            ]),
                            volume_mounts: Some(vec![
                                mount("config-volume", "/config-volume"),
                                mount("fluentdconf", "/fluentd/etc"),
                                read_only_mount(
                                    "varlibdockercontainers",
                                    "/var/lib/docker/containers",
                                ),
                                read_only_mount("runlogjournal", "/run/log/journal"),
                                read_only_mount("dmesg", "/var/log/dmesg"),
                            ]),
                            ..Default::default()
                        }],
                        volumes: Some(vec![
                            config_map_volume("config-volume", &self.config_map_name()),
                            empty_dir_volume("fluentdconf"),
                            host_path_volume("varlog", "/var/log"),
                            host_path_volume(
                                "varlibdockercontainers",
                                "/var/lib/docker/containers",
                            ),
                            host_path_volume("runlogjournal", "/run/log/journal"),
                            host_path_volume("dmesg", "/var/log/dmesg"),
                        ]),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// The config map holding [`CONFIG_FILES`]
    pub fn config_map(&self) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                labels: Some(self.labels()),
                ..metadata(&self.config_map_name(), Some(&self.namespace))
            },
            data: Some(
                CONFIG_FILES
                    .iter()
                    .map(|(name, contents)| (name.to_string(), contents.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    /// The agent's service account
    pub fn service_account(&self) -> ServiceAccount {
        super::service_account(metadata(&self.name, Some(&self.namespace)))
    }

    /// Read access to pods and namespaces for log metadata
    pub fn cluster_role(&self) -> ClusterRole {
        ClusterRole {
            metadata: metadata(&self.cluster_role_name(), None),
            rules: Some(vec![rule(
                &[""],
                &["namespaces", "pods", "pods/logs"],
                &["get", "list", "watch"],
            )]),
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

impl Addon for FluentdAgent {
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
