//! Enclave syncer - bi-directional resource sync for virtual clusters

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::api::DynamicObject;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use enclave_common::config::SyncerConfig;
use enclave_common::constants::OWNER_SET_UID_ANNOTATION;
use enclave_common::translate::Translator;

use enclave_syncer::cache::{run_informer, InformerScope, KindCache};
use enclave_syncer::client::KubeCluster;
use enclave_syncer::context::SyncContext;
use enclave_syncer::kinds::{registry, Direction, KindSyncer};
use enclave_syncer::mappings::MappingStore;
use enclave_syncer::runtime::leader::LeaderElection;
use enclave_syncer::runtime::queue::WorkQueue;
use enclave_syncer::runtime::spawn_workers;
use enclave_syncer::sync::machine::KindController;
use enclave_syncer::types::ObjKey;

/// Enclave syncer - projects virtual-cluster workloads onto a host cluster
#[derive(Parser, Debug)]
#[command(name = "enclave-syncer", version, about, long_about = None)]
struct Cli {
    /// Name of this virtual cluster; written into every marker
    #[arg(long, env = "VCLUSTER_NAME")]
    name: String,

    /// Host namespace this virtual cluster owns
    #[arg(long, env = "TARGET_NAMESPACE")]
    target_namespace: String,

    /// Syncer configuration file
    #[arg(long, env = "SYNCER_CONFIG", default_value = "/var/lib/enclave/config.yaml")]
    config: PathBuf,

    /// Kubeconfig for the in-pod virtual API server
    #[arg(long, env = "VIRTUAL_KUBECONFIG", default_value = "/data/enclave/admin.kubeconfig")]
    virtual_kubeconfig: PathBuf,

    /// Base URL of the virtual API server for the hook passthrough
    #[arg(long, default_value = "https://127.0.0.1:6443")]
    virtual_upstream: String,

    /// CA bundle of the virtual API server
    #[arg(long)]
    virtual_ca: Option<PathBuf>,

    /// ClusterIP of the `kubernetes` service inside the virtual cluster
    #[arg(long, default_value = "10.96.0.1")]
    virtual_service_ip: String,

    /// Hook server listen address
    #[arg(long, default_value = "0.0.0.0:8443")]
    hooks_addr: SocketAddr,

    /// Reconcile workers per kind
    #[arg(long, default_value = "4")]
    workers: usize,

    /// Unique identity for leader election (pod name)
    #[arg(long, env = "POD_NAME", default_value = "enclave-syncer-0")]
    identity: String,

    /// Run without leader election (single replica)
    #[arg(long)]
    no_leader_election: bool,

    /// Shutdown drain timeout in seconds
    #[arg(long, default_value = "15")]
    drain_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    tracing::info!(
        name = %cli.name,
        target_namespace = %cli.target_namespace,
        "enclave syncer starting"
    );

    let config = Arc::new(if cli.config.exists() {
        SyncerConfig::load(&cli.config)?
    } else {
        tracing::warn!(path = %cli.config.display(), "no config file, using defaults");
        SyncerConfig::default()
    });

    // host client from the in-cluster environment
    let host_kube = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create host client: {}", e))?;

    // virtual client from the control plane's kubeconfig on localhost
    let virtual_kube = client_from_kubeconfig(&cli.virtual_kubeconfig).await?;

    let translator = Arc::new(
        Translator::new(&cli.name, &cli.target_namespace)
            .with_multi_namespace(config.sync.to_host.namespaces.enabled),
    );

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    // leader election gates all writes; followers only keep caches warm
    let leadership = cancel.child_token();
    if cli.no_leader_election {
        tracing::info!("leader election disabled");
    } else {
        let election = LeaderElection::new(
            host_kube.clone(),
            &cli.target_namespace,
            "enclave-syncer",
            &cli.identity,
        );
        if !election.acquire(&cancel).await? {
            tracing::info!("cancelled before acquiring leadership");
            return Ok(());
        }
        let keep_cancel = cancel.clone();
        let lost = leadership.clone();
        tokio::spawn(async move {
            election.keep(keep_cancel, lost).await;
        });
    }

    let virtual_cluster = Arc::new(KubeCluster::new(virtual_kube.clone(), &cli.identity));
    let host_cluster = Arc::new(KubeCluster::new(host_kube.clone(), &cli.identity));

    let mappings = Arc::new(MappingStore::new());
    mappings
        .load(host_cluster.as_ref(), &cli.target_namespace)
        .await?;
    tokio::spawn(mappings.clone().run_persistence(
        host_cluster.clone(),
        cli.target_namespace.clone(),
        leadership.clone(),
    ));

    let ctx = Arc::new(SyncContext::new(
        virtual_cluster.clone(),
        host_cluster.clone(),
        translator.clone(),
        mappings,
        config.clone(),
        cli.target_namespace.clone(),
        leadership.clone(),
    ));

    // hook server runs regardless of leadership and of headless mode
    let hooks = start_hooks(&cli, host_kube.clone(), translator.clone(), cancel.clone()).await?;

    // one controller per kind: queue, two informers, worker pool
    let kinds = registry(&config);
    tracing::info!(kinds = kinds.len(), "starting per-kind controllers");
    let mut worker_handles = Vec::new();

    for kind in kinds {
        let queue = Arc::new(WorkQueue::new());
        ctx.register_queue(&kind.gvk(), queue.clone());

        start_informers(
            &cli,
            &config,
            virtual_kube.clone(),
            host_kube.clone(),
            &virtual_cluster,
            &host_cluster,
            &ctx,
            &kind,
            queue.clone(),
        );

        // fatal per-kind errors cancel this token without stopping others
        let kind_cancel = leadership.child_token();
        let controller = Arc::new(KindController::new(ctx.clone(), kind));
        worker_handles.extend(spawn_workers(cli.workers, queue, controller, kind_cancel));
    }

    cancel.cancelled().await;
    tracing::info!("shutting down, draining reconciles");

    let drain = async {
        for handle in worker_handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(cli.drain_timeout_secs), drain)
        .await
        .is_err()
    {
        tracing::warn!("drain timeout exceeded, abandoning in-flight reconciles");
    }

    if let Some(hooks) = hooks {
        let _ = hooks.await;
    }

    tracing::info!("enclave syncer stopped");
    Ok(())
}

/// Create a kube client from the virtual control plane's kubeconfig
async fn client_from_kubeconfig(path: &std::path::Path) -> anyhow::Result<Client> {
    let kubeconfig = Kubeconfig::read_from(path)
        .map_err(|e| anyhow::anyhow!("failed to read kubeconfig {}: {}", path.display(), e))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| anyhow::anyhow!("failed to load kubeconfig: {}", e))?;
    Client::try_from(config).map_err(|e| anyhow::anyhow!("failed to create client: {}", e))
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received shutdown signal");
            cancel.cancel();
        }
    });
}

/// Start the hook server in front of the virtual API server
async fn start_hooks(
    cli: &Cli,
    host_kube: Client,
    translator: Arc<Translator>,
    cancel: CancellationToken,
) -> anyhow::Result<Option<tokio::task::JoinHandle<()>>> {
    // first boot learns the host service CIDR so the virtual control plane
    // allocates ClusterIPs the host will accept
    match enclave_hooks::cidr::ensure_service_cidr(host_kube.clone(), &cli.target_namespace).await
    {
        Ok(cidr) => tracing::info!(cidr = %cidr, "host service CIDR"),
        Err(e) => tracing::warn!(error = %e, "service CIDR detection failed"),
    }

    let ca_pem = match &cli.virtual_ca {
        Some(path) => Some(tokio::fs::read(path).await.map_err(|e| {
            anyhow::anyhow!("failed to read virtual CA {}: {}", path.display(), e)
        })?),
        None => None,
    };

    let upstream = enclave_hooks::proxy::ReqwestUpstream::new(
        cli.virtual_upstream.clone(),
        ca_pem.as_deref(),
    )?;
    let host_view = enclave_hooks::KubeHostView::new(
        host_kube.clone(),
        &cli.target_namespace,
        &translator,
    );

    let state = Arc::new(enclave_hooks::HookState {
        translator: (*translator).clone(),
        host_client: host_kube,
        host: Arc::new(host_view),
        upstream: Arc::new(upstream),
        virtual_upstream: cli.virtual_upstream.clone(),
        virtual_service_ip: cli.virtual_service_ip.clone(),
        api_port: 443,
    });

    let addr = cli.hooks_addr;
    Ok(Some(tokio::spawn(async move {
        if let Err(e) = enclave_hooks::serve(addr, state, cancel).await {
            tracing::error!(error = %e, "hook server failed");
        }
    })))
}

/// Wire the virtual and host informers for one kind into its queue
#[allow(clippy::too_many_arguments)]
fn start_informers(
    cli: &Cli,
    config: &SyncerConfig,
    virtual_kube: Client,
    host_kube: Client,
    virtual_cluster: &Arc<KubeCluster>,
    host_cluster: &Arc<KubeCluster>,
    ctx: &Arc<SyncContext>,
    kind: &Arc<dyn KindSyncer>,
    queue: Arc<WorkQueue>,
) {
    let gvk = kind.gvk();
    let cancel = ctx.cancel.clone();

    match kind.direction() {
        Direction::Hostward => {
            // virtual side: all namespaces, unfiltered
            let v_cache = Arc::new(KindCache::new());
            virtual_cluster.register_cache(&gvk, v_cache.clone());
            {
                let queue = queue.clone();
                let enqueue = Arc::new(move |obj: &DynamicObject| {
                    queue.enqueue(ObjKey {
                        namespace: obj.metadata.namespace.clone(),
                        name: obj.name_any(),
                    });
                });
                tokio::spawn(run_informer(
                    virtual_kube,
                    InformerScope {
                        gvk: gvk.clone(),
                        namespace: None,
                        label_selector: None,
                    },
                    v_cache.clone(),
                    enqueue,
                    cancel.clone(),
                ));
            }

            // host side: the owned namespace, filtered by our marker
            let p_cache = Arc::new(KindCache::new());
            host_cluster.register_cache(&gvk, p_cache.clone());
            let host_namespace = if kind.cluster_scoped() || config.sync.to_host.namespaces.enabled
            {
                None
            } else {
                Some(cli.target_namespace.clone())
            };
            {
                let queue = queue.clone();
                let translator = ctx.translator.clone();
                let mappings = ctx.mappings.clone();
                let needs_mapping = kind.needs_mapping();
                let reverse_gvk = gvk.clone();
                let enqueue = Arc::new(move |obj: &DynamicObject| {
                    // reverse translation: owner UID first, encoded name
                    // as the legacy fallback, mapping store for pinned
                    // identities; unmarked objects are never claimed
                    if let Some(uid) = obj
                        .metadata
                        .annotations
                        .as_ref()
                        .and_then(|a| a.get(OWNER_SET_UID_ANNOTATION))
                    {
                        if let Some(v_obj) = v_cache.get_by_uid(uid) {
                            queue.enqueue(ObjKey {
                                namespace: v_obj.metadata.namespace.clone(),
                                name: v_obj.name_any(),
                            });
                            return;
                        }
                    }
                    if let Some((namespace, name)) = translator.parse_host_name(&obj.name_any()) {
                        queue.enqueue(ObjKey::namespaced(namespace, name));
                        return;
                    }
                    if needs_mapping {
                        let host_key = ObjKey {
                            namespace: obj.metadata.namespace.clone(),
                            name: obj.name_any(),
                        };
                        if let Some(v_key) = mappings.get_by_host(&reverse_gvk, &host_key) {
                            queue.enqueue(v_key);
                        }
                    }
                });
                tokio::spawn(run_informer(
                    host_kube,
                    InformerScope {
                        gvk,
                        namespace: host_namespace,
                        label_selector: Some(ctx.translator.managed_by_selector()),
                    },
                    p_cache,
                    enqueue,
                    cancel,
                ));
            }
        }
        Direction::Virtualward | Direction::Mirror => {
            // host-originated kinds are cluster-scoped and unmarked
            let p_cache = Arc::new(KindCache::new());
            host_cluster.register_cache(&gvk, p_cache.clone());
            {
                let queue = queue.clone();
                let enqueue = Arc::new(move |obj: &DynamicObject| {
                    queue.enqueue(ObjKey::cluster(obj.name_any()));
                });
                tokio::spawn(run_informer(
                    host_kube,
                    InformerScope {
                        gvk: gvk.clone(),
                        namespace: None,
                        label_selector: None,
                    },
                    p_cache,
                    enqueue,
                    cancel.clone(),
                ));
            }

            // the virtual side watch catches tenant edits and deletions
            let v_cache = Arc::new(KindCache::new());
            virtual_cluster.register_cache(&gvk, v_cache.clone());
            {
                let enqueue = Arc::new(move |obj: &DynamicObject| {
                    queue.enqueue(ObjKey::cluster(obj.name_any()));
                });
                tokio::spawn(run_informer(
                    virtual_kube,
                    InformerScope {
                        gvk,
                        namespace: None,
                        label_selector: None,
                    },
                    v_cache,
                    enqueue,
                    cancel,
                ));
            }
        }
    }
}
