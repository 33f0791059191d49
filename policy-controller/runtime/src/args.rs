use crate::{
    core::{ReconcileMetrics, Reconciler, Task, Terms},
    events::KubeEvents,
    index::{Index, IndexMetrics, Reader},
    k8s, lease,
    leadership::Leadership,
    ovn,
    queue::{
        worker::{self, Handler},
        QueueMetrics, RateLimit, WorkQueue,
    },
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::{path::PathBuf, sync::Arc};
use tokio::time::Duration;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "netpol-controller",
    about = "Programs NetworkPolicies into OVN port groups, address sets and ACLs"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "netpol_controller=info,warn",
        env = "NETPOL_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The namespace in which the controller runs and holds its Lease.
    #[clap(long, default_value = "kube-system")]
    controller_namespace: String,

    /// The Deployment that owns the controller's Lease.
    #[clap(long, default_value = "netpol-controller")]
    controller_deployment_name: String,

    /// The number of policies reconciled concurrently.
    #[clap(long, default_value = "2")]
    workers: usize,

    /// The delay before a policy's first retry. Each further retry doubles it.
    #[clap(long, default_value = "5")]
    retry_base_delay_ms: u64,

    #[clap(long, default_value = "1000")]
    retry_max_delay_secs: u64,

    /// The sustained rate at which tasks may be queued across all policies.
    #[clap(long, default_value = "10")]
    queue_qps: f64,

    #[clap(long, default_value = "100")]
    queue_burst: u32,

    #[clap(long, default_value = "ovn-nbctl")]
    ovn_nbctl_path: PathBuf,

    /// The OVN northbound database, e.g. `tcp:10.0.0.1:6641`.
    #[clap(long)]
    ovn_nb_db: Option<String>,

    #[clap(long)]
    ovn_nbctl_timeout_secs: Option<u64>,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            controller_namespace,
            controller_deployment_name,
            workers,
            retry_base_delay_ms,
            retry_max_delay_secs,
            queue_qps,
            queue_burst,
            ovn_nbctl_path,
            ovn_nb_db,
            ovn_nbctl_timeout_secs,
        } = self;

        if workers == 0 {
            bail!("--workers must be at least 1");
        }

        let mut prom = <Registry>::default();
        let queue_metrics = QueueMetrics::register(prom.sub_registry_with_prefix("workqueue"));
        let reconcile_metrics =
            ReconcileMetrics::register(prom.sub_registry_with_prefix("reconcile"));
        let index_metrics = IndexMetrics::register(prom.sub_registry_with_prefix("index"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let hostname =
            std::env::var("HOSTNAME").context("failed to fetch `HOSTNAME` environment variable")?;

        // Tasks are only admitted while this replica holds a write token.
        let (terms, gate) = Terms::new(&hostname);
        let queue = WorkQueue::new(
            RateLimit {
                base_delay: Duration::from_millis(retry_base_delay_ms),
                max_delay: Duration::from_secs(retry_max_delay_secs),
                qps: queue_qps,
                burst: queue_burst,
            },
            queue_metrics,
        );
        let index = Index::shared(gate, queue.clone(), index_metrics);

        let claims = lease::init(
            &runtime,
            &controller_namespace,
            &controller_deployment_name,
            &hostname,
        )
        .await?;
        tokio::spawn(
            Leadership::new(terms, hostname.clone(), index.clone())
                .run(claims)
                .instrument(info_span!("leadership")),
        );

        let policies = runtime.watch_all::<k8s::NetworkPolicy>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), policies)
                .instrument(info_span!("networkpolicies")),
        );

        let sdn = ovn::Nbctl::new(ovn::Config {
            path: ovn_nbctl_path,
            db: ovn_nb_db,
            timeout: ovn_nbctl_timeout_secs.map(Duration::from_secs),
        });
        let events = KubeEvents::new(runtime.client(), &hostname);
        let reconciler = Reconciler::new(Reader::new(index), sdn, events, reconcile_metrics);

        tokio::spawn(
            run_workers(
                queue,
                Arc::new(reconciler),
                workers,
                runtime.shutdown_handle(),
            )
            .instrument(info_span!("workers")),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

/// Runs workers until shutdown, then lets in-flight reconciliations finish
/// before releasing the drain handle.
async fn run_workers<H>(
    queue: Arc<WorkQueue<Task>>,
    handler: Arc<H>,
    workers: usize,
    drain: drain::Watch,
) where
    H: Handler<Task> + 'static,
{
    let tasks = (0..workers)
        .map(|id| {
            tokio::spawn(
                worker::run(queue.clone(), handler.clone()).instrument(info_span!("worker", id)),
            )
        })
        .collect::<Vec<_>>();
    info!(workers, "Started workers");

    let release = drain.signaled().await;
    info!("Shutting down workers");
    queue.shut_down();
    release
        .release_after(async move {
            for task in tasks {
                if let Err(error) = task.await {
                    tracing::error!(%error, "Worker failed");
                }
            }
        })
        .await;
}
