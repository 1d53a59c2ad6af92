use std::{net::IpAddr, sync::Arc, time::Duration};

use tokio::{
    sync::mpsc,
    task::{JoinHandle, JoinSet},
};

use crate::{
    announcer::Announcer,
    port_mapping,
    probe::{self, Probe},
    protocol::CONNECTIVITY_TIMEOUT,
    publisher::IdentityPublisher,
    state::{Command, Event},
    transport::SupervisorHandle,
};

pub struct ExecutionContext {
    pub events: mpsc::Sender<Event>,
    pub probe: Arc<dyn Probe>,
    pub supervisor: SupervisorHandle,
    pub publisher: IdentityPublisher,
    pub announcer: Announcer,
    pub connectivity_endpoint: String,
    last_external: Option<IpAddr>,
    probe_task: Option<JoinHandle<()>>,
    retry_task: Option<JoinHandle<()>>,
    background: JoinSet<()>,
}

impl ExecutionContext {
    pub fn new(
        events: mpsc::Sender<Event>,
        probe: Arc<dyn Probe>,
        supervisor: SupervisorHandle,
        publisher: IdentityPublisher,
        announcer: Announcer,
        connectivity_endpoint: String,
    ) -> Self {
        Self {
            events,
            probe,
            supervisor,
            publisher,
            announcer,
            connectivity_endpoint,
            last_external: None,
            probe_task: None,
            retry_task: None,
            background: JoinSet::new(),
        }
    }

    fn spawn_background(&mut self, task: impl Future<Output = ()> + Send + 'static) {
        while self.background.try_join_next().is_some() {}
        self.background.spawn(task);
    }

    /// Abort in-flight work and stop every transport.
    pub async fn shutdown(mut self) {
        for task in [self.probe_task.take(), self.retry_task.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
        self.background.shutdown().await;
        self.supervisor.shutdown().await;
    }
}

/// Execute `commands`; returns events produced synchronously, which the
/// caller feeds back before the next external event.
pub fn execute_commands(commands: &[Command], ctx: &mut ExecutionContext) -> Vec<Event> {
    let mut inline = Vec::new();

    for cmd in commands {
        match cmd {
            Command::Probe { generation, delay } => {
                let generation = *generation;
                let delay = *delay;
                let probe = ctx.probe.clone();
                let events = ctx.events.clone();
                if let Some(previous) = ctx.probe_task.take() {
                    previous.abort();
                }
                tracing::debug!(generation, ?delay, "scheduling probe");
                ctx.probe_task = Some(tokio::spawn(async move {
                    sleep_unless_zero(delay).await;
                    let event = match probe.probe().await {
                        Ok(address) => Event::ProbeSucceeded {
                            generation,
                            address,
                        },
                        Err(error) => {
                            tracing::warn!(generation, %error, "probe failed");
                            Event::ProbeFailed { generation, error }
                        }
                    };
                    let _ = events.send(event).await;
                }));
            }
            Command::Retry { generation, delay } => {
                let generation = *generation;
                let delay = *delay;
                let events = ctx.events.clone();
                if let Some(previous) = ctx.retry_task.take() {
                    previous.abort();
                }
                tracing::info!(generation, ?delay, "scheduling reachability retry");
                ctx.retry_task = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events.send(Event::RetryElapsed { generation }).await;
                }));
            }
            Command::Reconcile {
                generation,
                desired,
            } => {
                tracing::debug!(generation, protocols = desired.len(), "requesting reconcile");
                ctx.supervisor.request(*generation, desired.clone());
            }
            Command::MapPorts { generation, ports } => {
                let generation = *generation;
                let ports = ports.clone();
                let events = ctx.events.clone();
                ctx.spawn_background(async move {
                    let mapped = port_mapping::map_ports(&ports).await;
                    let _ = events
                        .send(Event::PortMappingDone { generation, mapped })
                        .await;
                });
            }
            Command::Announce => {
                let identity = ctx.publisher.identity().clone();
                match identity.contacts.is_empty() {
                    true => tracing::debug!("nothing published yet; announce skipped"),
                    false => {
                        let announcer = ctx.announcer.clone();
                        ctx.spawn_background(async move {
                            announcer.announce(&identity).await;
                        });
                    }
                }
            }
            Command::CheckConnectivity => {
                let endpoint = ctx.connectivity_endpoint.clone();
                let events = ctx.events.clone();
                ctx.spawn_background(async move {
                    let online = probe::check_connectivity(&endpoint, CONNECTIVITY_TIMEOUT).await;
                    match online {
                        true => tracing::warn!("internet reachable but this node is not"),
                        false => tracing::warn!(%endpoint, "internet connection appears to be down"),
                    }
                    let _ = events.send(Event::ConnectivityChecked { online }).await;
                });
            }
            Command::PublishIdentity {
                external,
                contacts,
                demote,
            } => match ctx.publisher.publish(contacts.clone(), demote) {
                Ok(identity) => {
                    ctx.last_external = Some(*external);
                    inline.push(Event::IdentityPublished {
                        external: *external,
                        order: identity.order(),
                    });
                }
                Err(e) => tracing::warn!(error = %e, "identity publish failed"),
            },
            Command::PromoteContact { protocol } => {
                match (ctx.publisher.promote(*protocol), ctx.last_external) {
                    (Ok(identity), Some(external)) => {
                        tracing::info!(%protocol, "promoted working contact");
                        inline.push(Event::IdentityPublished {
                            external,
                            order: identity.order(),
                        });
                    }
                    (Ok(_), None) => {
                        tracing::info!(%protocol, "promoted working contact");
                    }
                    (Err(e), _) => tracing::warn!(%protocol, error = %e, "promotion failed"),
                }
            }
        }
    }

    inline
}

async fn sleep_unless_zero(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}
