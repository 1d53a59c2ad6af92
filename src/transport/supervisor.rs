use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use super::{Advertise, ReconcileReport, Transport, TransportFactory};
use crate::{
    state::Event,
    types::{ContactAddr, Protocol},
};

struct Running {
    endpoint: ContactAddr,
    advertise: Advertise,
    transport: Box<dyn Transport>,
}

/// Owns the running transports and converges them on a desired set.
pub struct TransportSupervisor {
    factory: Arc<dyn TransportFactory>,
    running: BTreeMap<Protocol, Running>,
}

impl TransportSupervisor {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            running: BTreeMap::new(),
        }
    }

    pub fn listening(&self) -> BTreeMap<Protocol, Advertise> {
        self.running
            .iter()
            .map(|(p, r)| (*p, r.advertise.clone()))
            .collect()
    }

    pub async fn reconcile(&mut self, desired: &BTreeMap<Protocol, ContactAddr>) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let stale: Vec<Protocol> = self
            .running
            .iter()
            .filter(|(protocol, running)| match desired.get(protocol) {
                None => true,
                Some(endpoint) => *endpoint != running.endpoint || !running.transport.probe(),
            })
            .map(|(p, _)| *p)
            .collect();

        for protocol in stale {
            if let Some(mut running) = self.running.remove(&protocol) {
                running.transport.stop().await;
                info!(%protocol, endpoint = %running.endpoint, "transport stopped");
                report.stopped.push(protocol);
            }
        }

        for (&protocol, endpoint) in desired {
            if self.running.contains_key(&protocol) {
                continue;
            }
            let mut transport = self.factory.create(protocol);
            match transport.start(endpoint).await {
                Ok(advertise) => {
                    info!(%protocol, %endpoint, ?advertise, "transport started");
                    self.running.insert(
                        protocol,
                        Running {
                            endpoint: endpoint.clone(),
                            advertise,
                            transport,
                        },
                    );
                    report.started.push(protocol);
                }
                Err(e) => {
                    warn!(%protocol, %endpoint, error = %e, "transport failed to start");
                    report.failed.push((protocol, e));
                }
            }
        }

        report.listening = self.listening();
        report
    }

    pub async fn stop_all(&mut self) {
        for (protocol, mut running) in std::mem::take(&mut self.running) {
            running.transport.stop().await;
            debug!(%protocol, "transport stopped on shutdown");
        }
    }
}

// ─── Worker ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct ReconcileRequest {
    generation: u64,
    desired: BTreeSet<Protocol>,
}

/// Sending side of the supervisor worker. Dropping it stops every transport.
pub struct SupervisorHandle {
    requests: mpsc::UnboundedSender<ReconcileRequest>,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn request(&self, generation: u64, desired: BTreeSet<Protocol>) {
        if self
            .requests
            .send(ReconcileRequest {
                generation,
                desired,
            })
            .is_err()
        {
            warn!(generation, "supervisor worker is gone; reconcile dropped");
        }
    }

    /// Close the queue and wait for the worker to stop its transports.
    pub async fn shutdown(self) {
        drop(self.requests);
        if let Err(e) = self.task.await {
            warn!(error = %e, "supervisor worker panicked");
        }
    }
}

/// Run `supervisor` on its own task. Each batch of queued requests collapses
/// to the newest one; the result is posted as `ReconcileDone`.
pub fn spawn_supervisor(
    mut supervisor: TransportSupervisor,
    endpoints: BTreeMap<Protocol, ContactAddr>,
    events: mpsc::Sender<Event>,
) -> SupervisorHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<ReconcileRequest>();

    let task = tokio::spawn(async move {
        while let Some(mut request) = rx.recv().await {
            while let Ok(newer) = rx.try_recv() {
                debug!(
                    skipped = request.generation,
                    newer = newer.generation,
                    "superseded reconcile skipped"
                );
                request = newer;
            }

            let desired: BTreeMap<Protocol, ContactAddr> = request
                .desired
                .iter()
                .filter_map(|p| match endpoints.get(p) {
                    Some(endpoint) => Some((*p, endpoint.clone())),
                    None => {
                        warn!(protocol = %p, "enabled protocol has no endpoint");
                        None
                    }
                })
                .collect();

            let report = supervisor.reconcile(&desired).await;
            let done = Event::ReconcileDone {
                generation: request.generation,
                report,
            };
            if events.send(done).await.is_err() {
                break;
            }
        }
        supervisor.stop_all().await;
    });

    SupervisorHandle { requests: tx, task }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;

    use super::*;
    use crate::transport::TransportStartError;

    #[derive(Default)]
    struct Counters {
        starts: AtomicUsize,
        stops: AtomicUsize,
        refused: Mutex<BTreeSet<Protocol>>,
    }

    struct FakeTransport {
        protocol: Protocol,
        alive: bool,
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn protocol(&self) -> Protocol {
            self.protocol
        }

        async fn start(&mut self, endpoint: &ContactAddr) -> Result<Advertise, TransportStartError> {
            self.counters.starts.fetch_add(1, Ordering::SeqCst);
            let refused = self
                .counters
                .refused
                .lock()
                .expect("counters lock")
                .contains(&self.protocol);
            match refused {
                true => Err(TransportStartError::PortInUse(endpoint.to_string())),
                false => {
                    self.alive = true;
                    Ok(Advertise::External {
                        port: endpoint.port,
                    })
                }
            }
        }

        async fn stop(&mut self) {
            self.alive = false;
            self.counters.stops.fetch_add(1, Ordering::SeqCst);
        }

        fn probe(&self) -> bool {
            self.alive
        }
    }

    struct FakeFactory(Arc<Counters>);

    impl TransportFactory for FakeFactory {
        fn create(&self, protocol: Protocol) -> Box<dyn Transport> {
            Box::new(FakeTransport {
                protocol,
                alive: false,
                counters: self.0.clone(),
            })
        }
    }

    fn endpoint(port: u16) -> ContactAddr {
        ContactAddr::new(std::net::IpAddr::from([127, 0, 0, 1]), port)
    }

    fn supervisor() -> (TransportSupervisor, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        (
            TransportSupervisor::new(Arc::new(FakeFactory(counters.clone()))),
            counters,
        )
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let (mut sup, counters) = supervisor();
        let desired = BTreeMap::from([(Protocol::Tcp, endpoint(7771)), (Protocol::Udp, endpoint(7772))]);

        let first = sup.reconcile(&desired).await;
        assert_eq!(first.started, vec![Protocol::Tcp, Protocol::Udp]);
        assert_eq!(counters.starts.load(Ordering::SeqCst), 2);

        let second = sup.reconcile(&desired).await;
        assert!(second.started.is_empty());
        assert!(second.stopped.is_empty());
        assert_eq!(second.listening, first.listening);
        assert_eq!(counters.starts.load(Ordering::SeqCst), 2);
        assert_eq!(counters.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn undesired_and_moved_transports_are_stopped() {
        let (mut sup, counters) = supervisor();
        sup.reconcile(&BTreeMap::from([(Protocol::Tcp, endpoint(7771)), (Protocol::Udp, endpoint(7772))]))
            .await;

        let report = sup
            .reconcile(&BTreeMap::from([(Protocol::Tcp, endpoint(8000))]))
            .await;
        assert_eq!(report.stopped, vec![Protocol::Tcp, Protocol::Udp]);
        assert_eq!(report.started, vec![Protocol::Tcp]);
        assert_eq!(
            report.listening,
            BTreeMap::from([(Protocol::Tcp, Advertise::External { port: 8000 })])
        );
        assert_eq!(counters.stops.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn start_failure_is_omitted_and_retried() {
        let (mut sup, counters) = supervisor();
        counters
            .refused
            .lock()
            .expect("counters lock")
            .insert(Protocol::Udp);
        let desired = BTreeMap::from([(Protocol::Tcp, endpoint(7771)), (Protocol::Udp, endpoint(7772))]);

        let report = sup.reconcile(&desired).await;
        assert_eq!(report.started, vec![Protocol::Tcp]);
        assert_eq!(report.failed.len(), 1);
        assert!(!report.listening.contains_key(&Protocol::Udp));

        counters.refused.lock().expect("counters lock").clear();
        let report = sup.reconcile(&desired).await;
        assert_eq!(report.started, vec![Protocol::Udp]);
    }

    #[tokio::test]
    async fn worker_posts_newest_result() {
        let (sup, _counters) = supervisor();
        let (tx, mut rx) = mpsc::channel(16);
        let endpoints = BTreeMap::from([(Protocol::Tcp, endpoint(7771)), (Protocol::Udp, endpoint(7772))]);
        let handle = spawn_supervisor(sup, endpoints, tx);

        handle.request(1, BTreeSet::from([Protocol::Tcp]));
        handle.request(2, BTreeSet::from([Protocol::Tcp, Protocol::Udp]));

        let mut last = None;
        while let Some(Event::ReconcileDone { generation, report }) = rx.recv().await {
            let finished = generation == 2;
            last = Some((generation, report));
            if finished {
                break;
            }
        }
        let (generation, report) = last.expect("worker replied");
        assert_eq!(generation, 2);
        assert_eq!(
            report.listening.keys().copied().collect::<Vec<_>>(),
            vec![Protocol::Tcp, Protocol::Udp]
        );
        handle.shutdown().await;
    }
}
