//! Cluster add-on provisioning for Amazon EKS, built on [`kube`]
//!
//! This crate obtains short-lived bearer credentials for an EKS cluster's
//! Kubernetes API without a long-lived cluster token, and uses them to apply
//! the manifests of a small set of cluster add-ons.
//!
//! The credential bootstrap runs in a fixed sequence:
//!
//! 1. [`eks::ClusterMetadataResolver`] describes the cluster to obtain its
//!    endpoint, certificate authority and ARN.
//! 2. [`sts::SigningSessionFactory`] produces a [`sts::SigningClient`] from
//!    the base AWS credentials, optionally assuming a role first.
//! 3. [`token::TokenGenerator`] presigns an STS `GetCallerIdentity` request
//!    scoped to the cluster and encodes it as a [`token::BearerToken`].
//! 4. [`config::ClientConfigAssembler`] writes a kubeconfig document and
//!    loads it into an [`config::ApiClientConfiguration`].
//!
//! The [`addons`] module describes each add-on as an ordered set of typed
//! manifests that are applied through [`manifest::ResourceApi`], and
//! [`event::handle`] maps a provisioning [`LifecycleEvent`] onto those
//! manifests and decides the status reported back to the stack.
//!
//! # Crate Features
//!
//! - **clap**: Enables support for command-line argument parsing using
//!   [`clap`]. When this feature is enabled, [`ClusterArgs`] implements
//!   [`clap::Parser`].
//! - **rustls-tls**: Use [`rustls`] as the Kubernetes client's TLS
//!   implementation.
//! - **openssl-tls**: Use OpenSSL as the Kubernetes client's TLS
//!   implementation.
//!
//! [`kube`]: https://github.com/kube-rs/kube-rs
//! [`clap`]: https://crates.io/crates/clap
//! [`clap::Parser`]: https://docs.rs/clap/4/clap/trait.Parser.html
//! [`rustls`]: https://crates.io/crates/rustls

#![deny(warnings, rust_2018_idioms, missing_docs)]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod addons;
pub mod config;
pub mod eks;
pub mod errors;
pub mod event;
pub mod kubeconfig;
pub mod log;
pub mod manifest;
pub mod sts;
pub mod token;

pub use self::config::{ApiClientConfiguration, ClientConfigAssembler, ClusterArgs};
pub use self::errors::{CredentialError, EksClusterError, KubeconfigError};
pub use self::event::{EventError, LifecycleEvent, RequestType, Status, StatusResponse};
pub use self::log::{LogFilter, LogFormat, LogInitError};
pub use self::manifest::{Addon, BatchResult, KubeResourceApi, ResourceApi, Verb};
pub use self::token::{BearerToken, TokenGenerator};
