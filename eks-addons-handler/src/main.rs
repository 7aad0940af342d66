#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::Result;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use eks_addons::{
    addons::{AlbIngress, CloudWatchAgent, ExternalDns, FluentdAgent},
    event::{handle, EventError, Status, StatusResponse},
    sts::SigningSessionFactory,
    Addon, ClientConfigAssembler, ClusterArgs, KubeResourceApi, LifecycleEvent, TokenGenerator,
};
use std::{ffi::OsString, path::PathBuf};

#[derive(Clone, clap::Parser)]
#[clap(version)]
struct Args {
    /// The tracing filter used for logs
    #[arg(
        long,
        env = "EKS_ADDONS_LOG",
        default_value = "eks_addons=info,eks_addons_handler=info,warn"
    )]
    log_level: eks_addons::LogFilter,

    /// The logging format
    #[arg(long, env = "EKS_ADDONS_LOG_FORMAT", default_value = "plain")]
    log_format: eks_addons::LogFormat,

    #[clap(flatten)]
    cluster: ClusterArgs,

    #[clap(flatten)]
    event: EventArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, clap::Parser)]
enum Command {
    /// Print a client.authentication.k8s.io ExecCredential for the cluster
    Token,

    /// Handle a lifecycle event for ExternalDNS
    ExternalDns {
        /// The IAM role the controller runs as
        #[arg(long, env = "EXTERNAL_DNS_CONTROLLER_ROLE_ARN")]
        controller_role_arn: String,

        /// The domain whose hosted zones the controller manages
        #[arg(long, env = "DNS_DOMAIN")]
        dns_domain: String,
    },

    /// Handle a lifecycle event for the ALB ingress controller
    AlbIngress {
        /// The IAM role the controller runs as
        #[arg(long, env = "ALB_INGRESS_CONTROLLER_ROLE_ARN")]
        controller_role_arn: String,

        /// The VPC the cluster runs in
        #[arg(long, env = "VPC_ID")]
        vpc_id: String,
    },

    /// Handle a lifecycle event for the CloudWatch agent
    CloudwatchAgent,

    /// Handle a lifecycle event for Fluentd
    Fluentd,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, clap::Args)]
struct EventArgs {
    /// Read the lifecycle event from a file instead of stdin
    #[arg(long, global = true)]
    event: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    use clap::Parser;

    let Args {
        log_level,
        log_format,
        cluster,
        event,
        command,
    } = match Args::try_parse() {
        Ok(args) => args,
        Err(error) => return reject(error).await,
    };

    if let Err(error) = log_format.try_init(log_level) {
        eprintln!("failed to initialize logging: {error}");
    }

    // Base credentials come from the environment's default provider chain.
    let sdk = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(cluster.region.clone()))
        .load()
        .await;

    let addon: Box<dyn Addon> = match command {
        Command::Token => return print_token(&sdk, &cluster).await,
        Command::ExternalDns {
            controller_role_arn,
            dns_domain,
        } => Box::new(ExternalDns::new(controller_role_arn, dns_domain)),
        Command::AlbIngress {
            controller_role_arn,
            vpc_id,
        } => Box::new(AlbIngress::new(
            controller_role_arn,
            &cluster.cluster_name,
            &cluster.region,
            vpc_id,
        )),
        Command::CloudwatchAgent => {
            Box::new(CloudWatchAgent::new(&cluster.region, &cluster.cluster_name))
        }
        Command::Fluentd => Box::new(FluentdAgent::new(&cluster.region, &cluster.cluster_name)),
    };

    // Without a readable event there is nowhere to report a status.
    let event = event.read().await?;
    tracing::info!(
        request_type = %event.request_type,
        request_id = %event.request_id,
        logical_resource_id = %event.logical_resource_id,
        "Received event"
    );

    let api = match cluster.into_assembler(&sdk) {
        Ok(assembler) => connect(&assembler).await,
        Err(error) => {
            tracing::error!(%error, "Could not load base credentials");
            None
        }
    };

    let rsp = handle(&event, api.as_ref(), addon.as_ref()).await;
    rsp.send(&reqwest::Client::new(), &event.response_url).await?;
    Ok(())
}

/// Answers the event with a failed status when the arguments are invalid,
/// then exits with clap's exit code
async fn reject(error: clap::Error) -> Result<()> {
    if !error.use_stderr() {
        error.exit();
    }
    error.print()?;

    if let Some(source) = EventArgs::recover(std::env::args_os()) {
        let event = source.read().await?;
        let rsp = rejection(&event, &error);
        rsp.send(&reqwest::Client::new(), &event.response_url).await?;
    }
    std::process::exit(error.exit_code());
}

fn rejection(event: &LifecycleEvent, error: &clap::Error) -> StatusResponse {
    // Keep the message and drop the usage text that follows it.
    let rendered = error.to_string();
    let message = rendered.split("\n\n").next().unwrap_or_default();
    let reason = message.split_whitespace().collect::<Vec<_>>().join(" ");
    event.response(Status::Failed, reason)
}

async fn connect(assembler: &ClientConfigAssembler) -> Option<KubeResourceApi> {
    let config = assembler.get_config().await?;
    if let Some(status) = config.cluster_status().filter(|s| *s != "ACTIVE") {
        tracing::warn!(%status, "Cluster is not active");
    }
    match config.try_client().await {
        Ok(client) => Some(KubeResourceApi::new(client)),
        Err(error) => {
            tracing::error!(%error, "Could not build Kubernetes client");
            None
        }
    }
}

async fn print_token(sdk: &SdkConfig, cluster: &ClusterArgs) -> Result<()> {
    let signer = SigningSessionFactory::from_sdk_config(sdk)?
        .get_signing_client(&cluster.region, cluster.role_arn.as_deref())
        .await?;
    let token = TokenGenerator::new(signer).get_token(&cluster.cluster_name)?;
    let credential = token.exec_credential(chrono::Utc::now());
    println!("{}", serde_json::to_string(&credential)?);
    Ok(())
}

// === impl EventArgs ===

impl EventArgs {
    async fn read(&self) -> Result<LifecycleEvent, EventError> {
        match &self.event {
            Some(path) => LifecycleEvent::read_file(path).await,
            None => LifecycleEvent::read(tokio::io::stdin()).await,
        }
    }

    /// Finds the event source in arguments that failed validation
    ///
    /// Returns `None` when no add-on subcommand was given, since only those
    /// handle an event.
    fn recover<I, T>(argv: I) -> Option<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        use clap::{CommandFactory, FromArgMatches};

        let matches = Args::command()
            .ignore_errors(true)
            .try_get_matches_from(argv)
            .ok()?;
        let (name, sub) = matches.subcommand()?;
        if name == "token" {
            return None;
        }

        let event = |m: &clap::ArgMatches| Self::from_arg_matches(m).ok().and_then(|a| a.event);
        Some(Self {
            event: event(sub).or_else(|| event(&matches)),
        })
    }
}
