//! strato-operator - CloudFormation stack operator for Kubernetes.
//!
//! Watches `Stack` resources, converges them against AWS CloudFormation,
//! and exposes health endpoints:
//!
//! - `GET /health` - Health check
//! - `GET /ready` - Readiness check

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::{watcher, Controller};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use strato_api::Stack;
use strato_cfn::AwsCloudFormation;
use strato_operator::{
    error_policy, follower, KubeStackStore, OperatorConfig, StackFollower, StackReconciler,
};

/// CloudFormation stack operator for Kubernetes.
#[derive(Parser, Debug)]
#[command(name = "strato-operator", version, about)]
struct Args {
    /// The AWS region to use.
    #[arg(long, env = "AWS_REGION")]
    region: Option<String>,

    /// Assume this AWS role when defined. Useful for stacks in another
    /// AWS account; specify the full ARN.
    #[arg(long = "assume-role")]
    assume_role: Option<String>,

    /// Tag to apply to all stacks by default, as KEY=VALUE. Repeatable.
    #[arg(long = "tag", value_parser = strato_operator::config::parse_key_value)]
    tags: Vec<(String, String)>,

    /// CloudFormation capability to enable, e.g. CAPABILITY_IAM.
    /// Repeatable.
    #[arg(long = "capability")]
    capabilities: Vec<String>,

    /// If set, don't issue any mutating provider calls; log intended
    /// actions instead.
    #[arg(long = "dry-run")]
    dry_run: bool,

    /// The Kubernetes namespace to watch. Empty watches all namespaces.
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Address for the health and readiness endpoints.
    #[arg(long, default_value = "0.0.0.0:8081")]
    listen_addr: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        service: "strato-operator",
    })
}

async fn ready_handler() -> impl IntoResponse {
    (StatusCode::OK, "ready")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,strato=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = OperatorConfig {
        region: args.region,
        assume_role: args.assume_role,
        default_tags: args.tags.into_iter().collect(),
        default_capabilities: args.capabilities,
        dry_run: args.dry_run,
        namespace: args.namespace,
    };

    tracing::info!(
        region = config.region.as_deref().unwrap_or("<default>"),
        namespace = config.namespace.as_deref().unwrap_or("<all>"),
        dry_run = config.dry_run,
        "starting strato-operator"
    );

    let cfn = Arc::new(
        AwsCloudFormation::connect(config.region.clone(), config.assume_role.clone()).await,
    );

    let client = kube::Client::try_default().await?;
    let store = Arc::new(KubeStackStore::new(client.clone()));
    tracing::info!("connected to Kubernetes cluster");

    // Follower: two background tasks sharing the tracking registry.
    let (handle, submissions) = follower::channel();
    let stack_follower = Arc::new(StackFollower::new(Arc::clone(&store), Arc::clone(&cfn)));
    tokio::spawn({
        let stack_follower = Arc::clone(&stack_follower);
        async move {
            stack_follower.run(submissions).await;
        }
    });
    tracing::info!("started stack follower");

    let reconciler = Arc::new(StackReconciler::new(
        Arc::clone(&store),
        Arc::clone(&cfn),
        config.clone(),
        handle,
    ));

    let stacks: Api<Stack> = match config.namespace.as_deref().filter(|ns| !ns.is_empty()) {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    };

    let controller = Controller::new(stacks, watcher::Config::default())
        .shutdown_on_signal()
        .run(
            |stack, reconciler| async move { reconciler.reconcile(stack).await },
            error_policy,
            reconciler,
        )
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => tracing::debug!(object = %object, "reconciled"),
                Err(e) => tracing::warn!(error = %e, "reconciliation error"),
            }
        });

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler));
    let listener = tokio::net::TcpListener::bind(&args.listen_addr).await?;
    tracing::info!(listen_addr = %args.listen_addr, "starting probe server");
    let probes = async move { axum::serve(listener, app).await };

    tokio::select! {
        () = controller => {
            tracing::info!("controller stream ended, shutting down");
        }
        served = probes => {
            served?;
        }
    }

    Ok(())
}
