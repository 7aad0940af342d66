//! The AWS ALB ingress controller provisions application load balancers for ingresses

use super::{metadata, rule, string_map, Labels};
use crate::manifest::{Addon, Manifest};
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{Container, PodSpec, PodTemplateSpec, ServiceAccount},
        rbac::v1::{ClusterRole, ClusterRoleBinding},
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta},
};

/// The default controller image.
pub const IMAGE: &str = "docker.io/amazon/aws-alb-ingress-controller:v1.1.4";

/// The ALB ingress controller
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AlbIngress {
    /// Names every resource of the controller.
    pub name: String,
    /// The namespace the controller runs in.
    pub namespace: String,
    /// The IAM role the controller's service account assumes.
    pub role_arn: String,
    /// The cluster whose ingresses are served.
    pub cluster_name: String,
    /// The region load balancers are created in.
    pub region: String,
    /// The VPC load balancers are attached to.
    pub vpc_id: String,
    /// The controller image.
    pub image: String,
}

impl AlbIngress {
    /// Configures the controller with its default name, namespace and image
    pub fn new(
        role_arn: impl Into<String>,
        cluster_name: impl Into<String>,
        region: impl Into<String>,
        vpc_id: impl Into<String>,
    ) -> Self {
        Self {
            name: "alb-ingress-controller".to_string(),
            namespace: "kube-system".to_string(),
            role_arn: role_arn.into(),
            cluster_name: cluster_name.into(),
            region: region.into(),
            vpc_id: vpc_id.into(),
            image: IMAGE.to_string(),
        }
    }

    fn labels(&self) -> Labels {
        string_map([("app.kubernetes.io/name", self.name.as_str())])
    }

    fn metadata(&self, namespaced: bool) -> ObjectMeta {
        let namespace = namespaced.then_some(self.namespace.as_str());
        ObjectMeta {
            labels: Some(self.labels()),
            ..metadata(&self.name, namespace)
        }
    }

    /// The controller deployment
    pub fn deployment(&self) -> Deployment {
        Deployment {
            metadata: self.metadata(true),
            spec: Some(DeploymentSpec {
                selector: LabelSelector {
                    match_labels: Some(self.labels()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(self.labels()),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        service_account_name: Some(self.name.clone()),
                        containers: vec![Container {
                            name: self.name.clone(),
                            image: Some(self.image.clone()),
                            args: Some(vec![
                                "--ingress-class=alb".to_string(),
                                format!("--cluster-name={}", self.cluster_name),
                                format!("--aws-vpc-id={}", self.vpc_id),
                                format!("--aws-region={}", self.region),
                            ]),
                            ..Default::default()
                        }],
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
            ..self.metadata(true)
        })
    }

    /// The cluster role
    pub fn cluster_role(&self) -> ClusterRole {
        ClusterRole {
            metadata: self.metadata(false),
            rules: Some(vec![
                rule(
                    &["", "extensions"],
                    &[
                        "configmaps",
                        "endpoints",
                        "events",
                        "ingresses",
                        "ingresses/status",
                        "services",
                    ],
                    &["create", "get", "list", "update", "watch", "patch"],
                ),
                rule(
                    &["", "extensions"],
                    &["nodes", "pods", "secrets", "services", "namespaces"],
                    &["get", "list", "watch"],
                ),
            ]),
            ..Default::default()
        }
    }

    /// Binds the cluster role to the service account
    pub fn cluster_role_binding(&self) -> ClusterRoleBinding {
        super::cluster_role_binding(
            self.metadata(false),
            &self.name,
            &self.name,
            &self.namespace,
        )
    }
}

impl Addon for AlbIngress {
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
