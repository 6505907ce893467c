use fabriclink::{
    CommConfig, Communicator, LoopbackFabric, LoopbackIpc, Platform, Rank, get_unique_id,
};
use std::future::Future;
use std::sync::Arc;

/// Backends shared by every rank of one test.
#[derive(Clone)]
pub struct Node {
    pub ipc: LoopbackIpc,
    pub fabric: LoopbackFabric,
    pub platform: Platform,
}

impl Node {
    pub fn new() -> Self {
        let ipc = LoopbackIpc::new();
        let fabric = LoopbackFabric::default();
        let platform = Platform::new(Arc::new(ipc.clone()), Arc::new(fabric.clone()));
        Self {
            ipc,
            fabric,
            platform,
        }
    }
}

/// Run `f` once per rank, each on its own task with its own communicator.
/// Returns the per-rank outputs in rank order.
pub async fn run_ranks<F, Fut, T>(nranks: u32, f: F) -> Vec<T>
where
    F: Fn(Communicator, Node) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    run_ranks_with(nranks, |_| CommConfig::default(), f).await
}

/// Like [`run_ranks`], with a per-rank config (e.g. a distinct `host_id`
/// to place ranks on different simulated hosts).
pub async fn run_ranks_with<C, F, Fut, T>(nranks: u32, config_for: C, f: F) -> Vec<T>
where
    C: Fn(Rank) -> CommConfig,
    F: Fn(Communicator, Node) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let node = Node::new();
    let id = get_unique_id(&CommConfig::default()).await.unwrap();
    let f = Arc::new(f);
    let mut handles = Vec::new();
    for rank in 0..nranks {
        let f = Arc::clone(&f);
        let node = node.clone();
        let config = config_for(rank);
        handles.push(tokio::spawn(async move {
            let comm =
                Communicator::from_unique_id(nranks, &id, rank, node.platform.clone(), config)
                    .await
                    .unwrap();
            f(comm, node).await
        }));
    }
    let mut out = Vec::with_capacity(handles.len());
    for h in handles {
        out.push(h.await.unwrap());
    }
    out
}

/// A config placing the rank on host `host`.
pub fn on_host(host: &str) -> CommConfig {
    CommConfig {
        host_id: Some(host.to_string()),
        ..CommConfig::default()
    }
}

/// A loopback address with a port that was free a moment ago.
pub fn free_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}
