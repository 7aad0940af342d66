//! ExternalDNS publishes DNS records for services and ingresses to Route 53

use super::{metadata, rule, string_map, Labels};
use crate::manifest::{Addon, Manifest};
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy},
        core::v1::{Container, PodSecurityContext, PodSpec, PodTemplateSpec, ServiceAccount},
        rbac::v1::{ClusterRole, ClusterRoleBinding},
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta},
};

/// The default ExternalDNS image.
pub const IMAGE: &str = "registry.opensource.zalan.do/teapot/external-dns:latest";

/// The ExternalDNS controller
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExternalDns {
    /// Names the deployment, service account and cluster role.
    pub name: String,
    /// The namespace the controller runs in.
    pub namespace: String,
    /// The IAM role the controller's pods run as.
    pub role_arn: String,
    /// Restricts the controller to hosted zones of this domain.
    pub dns_domain: String,
    /// The controller image.
    pub image: String,
}

impl ExternalDns {
    /// Configures the controller with its default name, namespace and image
    pub fn new(role_arn: impl Into<String>, dns_domain: impl Into<String>) -> Self {
        Self {
            name: "external-dns".to_string(),
            namespace: "kube-system".to_string(),
            role_arn: role_arn.into(),
            dns_domain: dns_domain.into(),
            image: IMAGE.to_string(),
        }
    }

    fn labels(&self) -> Labels {
        string_map([("app", self.name.as_str())])
    }

    /// A single-replica deployment that is recreated rather than rolled
    pub fn deployment(&self) -> Deployment {
        Deployment {
            metadata: metadata(&self.name, Some(&self.namespace)),
            spec: Some(DeploymentSpec {
                selector: LabelSelector {
                    match_labels: Some(self.labels()),
                    ..Default::default()
                },
                strategy: Some(DeploymentStrategy {
                    type_: Some("Recreate".to_string()),
                    ..Default::default()
                }),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(self.labels()),
                        annotations: Some(string_map([(
                            "iam.amazonaws.com/role",
                            self.role_arn.as_str(),
                        )])),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        service_account_name: Some(self.name.clone()),
                        containers: vec![Container {
                            name: self.name.clone(),
                            image: Some(self.image.clone()),
                            args: Some(vec![
                                "--source=service".to_string(),
                                "--source=ingress".to_string(),
                                format!("--domain-filter={}", self.dns_domain),
                                "--provider=aws".to_string(),
                                "--registry=txt".to_string(),
                                "--txt-owner-id=hostedzone-identifier".to_string(),
                            ]),
                            ..Default::default()
                        }],
                        // Lets the controller read the projected web identity token.
                        security_context: Some(PodSecurityContext {
                            fs_group: Some(65534),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// The service account, annotated with the IAM role it assumes
    pub fn service_account(&self) -> ServiceAccount {
        super::service_account(ObjectMeta {
            annotations: Some(string_map([(
                "eks.amazonaws.com/role-arn",
                self.role_arn.as_str(),
            )])),
            ..metadata(&self.name, Some(&self.namespace))
        })
    }

    /// Read access to the resources that carry hostnames
    pub fn cluster_role(&self) -> ClusterRole {
        ClusterRole {
            metadata: metadata(&self.name, None),
            rules: Some(vec![
                rule(&[""], &["services", "endpoints", "pods"], &["get", "watch", "list"]),
                rule(
                    &["extensions", "networking.k8s.io"],
                    &["ingresses"],
                    &["get", "watch", "list"],
                ),
                rule(&[""], &["nodes"], &["list", "watch"]),
            ]),
            ..Default::default()
        }
    }

    /// Binds the cluster role to the service account
    pub fn cluster_role_binding(&self) -> ClusterRoleBinding {
        super::cluster_role_binding(
            metadata(&format!("{}-viewer", self.name), None),
            &self.name,
            &self.name,
            &self.namespace,
        )
    }
}

impl Addon for ExternalDns {
    fn name(&self) -> &str {
        &self.name
    }

    fn manifests(&self) -> Vec<Manifest> {
        vec![
            self.deployment().into(),
            self.service_account().into(),
            self.cluster_role().into(),
            self.cluster_role_binding().into(),
        ]
    }
}
