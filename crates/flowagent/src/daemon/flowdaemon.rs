//! FlowDaemon implementation.
//!
//! The FlowDaemon drives a [`FlowAgent`] from async tasks:
//! - one packet worker per partition, fed by a bounded queue
//! - an aging task sweeping idle pairs on a fixed interval
//! - a route listener applying route change notifications

use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::agent::FlowAgent;
use crate::flow::{FlowError, Packet, Result};
use crate::route::RouteChangeStream;

/// Cloneable entry point for submitting packets to a running daemon.
#[derive(Clone)]
pub struct PacketSender {
    agent: Arc<FlowAgent>,
    queues: Arc<[mpsc::Sender<Packet>]>,
}

impl PacketSender {
    /// Queues a packet for the worker of its partition, waiting for room.
    pub async fn submit(&self, packet: Packet) -> Result<()> {
        let partition = self.agent.partition_for(&packet.key);
        self.queues[partition]
            .send(packet)
            .await
            .map_err(|_| FlowError::QueueClosed(partition))
    }

    /// Queues a packet without waiting.
    pub fn try_submit(&self, packet: Packet) -> Result<()> {
        let partition = self.agent.partition_for(&packet.key);
        self.queues[partition].try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => FlowError::QueueFull(partition),
            mpsc::error::TrySendError::Closed(_) => FlowError::QueueClosed(partition),
        })
    }
}

/// Running set of flow agent tasks.
pub struct FlowDaemon {
    agent: Arc<FlowAgent>,
    sender: PacketSender,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl FlowDaemon {
    /// Spawns the daemon tasks on the current tokio runtime.
    pub fn start(agent: Arc<FlowAgent>) -> Self {
        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        let depth = agent.config().queue_depth;

        let mut queues = Vec::with_capacity(agent.partition_count());
        for partition in 0..agent.partition_count() {
            let (tx, rx) = mpsc::channel(depth);
            queues.push(tx);
            tasks.spawn(run_worker(agent.clone(), partition, rx, cancel.clone()));
        }
        tasks.spawn(run_aging(agent.clone(), cancel.clone()));
        // Subscribe before returning so no change after start() is missed.
        let routes = agent.resolver().routes().subscribe();
        tasks.spawn(run_route_listener(agent.clone(), routes, cancel.clone()));
        tasks.close();

        info!(
            "FlowDaemon: started {} workers, sweep every {}ms",
            agent.partition_count(),
            agent.config().sweep_interval_ms
        );
        let sender = PacketSender {
            agent: agent.clone(),
            queues: queues.into(),
        };
        Self {
            agent,
            sender,
            cancel,
            tasks,
        }
    }

    pub fn agent(&self) -> &Arc<FlowAgent> {
        &self.agent
    }

    pub fn sender(&self) -> PacketSender {
        self.sender.clone()
    }

    pub async fn submit(&self, packet: Packet) -> Result<()> {
        self.sender.submit(packet).await
    }

    /// Token cancelled when the daemon stops.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops all tasks and waits for them to finish.
    pub async fn shutdown(self) {
        info!("FlowDaemon: stopping");
        self.cancel.cancel();
        self.tasks.wait().await;
        info!(
            "FlowDaemon: stopped with {} flows",
            self.agent.flow_count()
        );
    }
}

async fn run_worker(
    agent: Arc<FlowAgent>,
    partition: usize,
    mut rx: mpsc::Receiver<Packet>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            packet = rx.recv() => {
                let Some(packet) = packet else { break };
                // Re-locate: the pair may have been created elsewhere since
                // the packet was queued.
                if let Err(e) = agent.process_packet(&packet, Instant::now()) {
                    debug!("FlowDaemon[{}]: dropped [{}]: {}", partition, packet.key, e);
                }
            }
        }
    }
    debug!("FlowDaemon[{}]: worker stopped", partition);
}

async fn run_aging(agent: Arc<FlowAgent>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(agent.config().sweep_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let removed = agent.sweep(Instant::now());
                if removed > 0 {
                    debug!("FlowDaemon: aged out {} flows", removed);
                }
            }
        }
    }
}

async fn run_route_listener(
    agent: Arc<FlowAgent>,
    mut stream: RouteChangeStream,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            notification = stream.recv() => match notification {
                Some(notification) => {
                    agent.handle_route_notification(&notification);
                }
                None => {
                    warn!("FlowDaemon: route change stream closed");
                    break;
                }
            }
        }
    }
}
