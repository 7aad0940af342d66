//! Manifest builders for cluster add-ons
//!
//! Each builder produces its add-on's resources in creation order. Builders
//! never talk to the API themselves; see [`crate::manifest::apply_addon`].

mod alb_ingress;
mod cloudwatch_agent;
mod external_dns;
mod fluentd_agent;

pub use self::{
    alb_ingress::AlbIngress, cloudwatch_agent::CloudWatchAgent, external_dns::ExternalDns,
    fluentd_agent::FluentdAgent,
};

use k8s_openapi::{
    api::{
        core::v1::{
            ConfigMapVolumeSource, EmptyDirVolumeSource, EnvVar, EnvVarSource,
            HostPathVolumeSource, Namespace, ObjectFieldSelector, ResourceRequirements,
            ServiceAccount, Volume, VolumeMount,
        },
        rbac::v1::{ClusterRoleBinding, PolicyRule, RoleRef, Subject},
    },
    apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::ObjectMeta},
};
use std::collections::BTreeMap;

/// The CI version advertised to the CloudWatch agents.
pub(crate) const CI_VERSION: &str = "k8s/1.1.1";

const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

pub(crate) type Labels = BTreeMap<String, String>;

pub(crate) fn string_map<const N: usize>(pairs: [(&str, &str); N]) -> Labels {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub(crate) fn metadata(name: &str, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        ..Default::default()
    }
}

pub(crate) fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// A namespace labeled with its own name
pub(crate) fn namespace(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            labels: Some(string_map([("name", name)])),
            ..metadata(name, None)
        },
        ..Default::default()
    }
}

pub(crate) fn service_account(meta: ObjectMeta) -> ServiceAccount {
    ServiceAccount {
        metadata: meta,
        ..Default::default()
    }
}

/// Binds `role` to the service account `account` in `namespace`
pub(crate) fn cluster_role_binding(
    meta: ObjectMeta,
    role: &str,
    account: &str,
    namespace: &str,
) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: meta,
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name: role.to_string(),
        },
        subjects: Some(vec![Subject {
            api_group: None,
            kind: "ServiceAccount".to_string(),
            name: account.to_string(),
            namespace: Some(namespace.to_string()),
        }]),
    }
}

pub(crate) fn rule(api_groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(strings(api_groups)),
        resources: Some(strings(resources)),
        verbs: strings(verbs),
        ..Default::default()
    }
}

pub(crate) fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

/// An environment variable populated from a pod field
pub(crate) fn env_from_field(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn resources(
    limits: &[(&str, &str)],
    requests: &[(&str, &str)],
) -> ResourceRequirements {
    let quantities = |pairs: &[(&str, &str)]| {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
            .collect::<BTreeMap<_, _>>()
    };
    ResourceRequirements {
        limits: Some(quantities(limits)),
        requests: Some(quantities(requests)),
        ..Default::default()
    }
}

pub(crate) fn mount(name: &str, mount_path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: mount_path.to_string(),
        ..Default::default()
    }
}

pub(crate) fn read_only_mount(name: &str, mount_path: &str) -> VolumeMount {
    VolumeMount {
        read_only: Some(true),
        ..mount(name, mount_path)
    }
}

pub(crate) fn config_map_volume(name: &str, config_map: &str) -> Volume {
    Volume {
        name: name.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map.to_string().into(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn empty_dir_volume(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

pub(crate) fn host_path_volume(name: &str, path: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}
