//! # Worker Pool
//!
//! A pool of identical workers, each looping poll, handle, ack. Workers
//! share nothing but the queue and the store; correctness never depends
//! on the pool size. Transient handler faults nack the delivery so the
//! visibility timeout redelivers it; permanent faults ack and surface
//! through statuses and events.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::handlers::MessageDispatcher;
use crate::messaging::MessageQueue;

/// Handle over a running pool of queue workers
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `config.worker_count` workers onto the current runtime
    pub fn start(
        dispatcher: Arc<MessageDispatcher>,
        queue: Arc<dyn MessageQueue>,
        config: &EngineConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let handles = (0..config.worker_count)
            .map(|worker_id| {
                let dispatcher = dispatcher.clone();
                let queue = queue.clone();
                let mut shutdown_rx = shutdown.subscribe();
                let poll_interval = config.poll_interval();
                tokio::spawn(async move {
                    info!(worker_id, "worker started");
                    loop {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        match queue.poll().await {
                            Ok(Some(delivery)) => {
                                match dispatcher.dispatch(&delivery.message).await {
                                    Ok(()) => {
                                        if let Err(err) = queue.ack(delivery.token).await {
                                            warn!(worker_id, %err, "ack failed");
                                        }
                                    }
                                    Err(err) if err.is_transient() => {
                                        warn!(
                                            worker_id,
                                            message_type = delivery.message.message_type(),
                                            %err,
                                            "transient fault, returning message for redelivery"
                                        );
                                        if let Err(err) = queue.nack(delivery.token).await {
                                            warn!(worker_id, %err, "nack failed");
                                        }
                                    }
                                    Err(err) => {
                                        error!(
                                            worker_id,
                                            message_type = delivery.message.message_type(),
                                            execution_id = delivery.message.execution_id(),
                                            %err,
                                            "handler failed permanently, dropping message"
                                        );
                                        if let Err(err) = queue.ack(delivery.token).await {
                                            warn!(worker_id, %err, "ack failed");
                                        }
                                    }
                                }
                            }
                            Ok(None) => {
                                tokio::select! {
                                    _ = tokio::time::sleep(poll_interval) => {}
                                    _ = shutdown_rx.changed() => {}
                                }
                            }
                            Err(err) => {
                                warn!(worker_id, %err, "queue poll failed");
                                tokio::time::sleep(poll_interval).await;
                            }
                        }
                    }
                    debug!(worker_id, "worker stopped");
                })
            })
            .collect();
        Self { shutdown, handles }
    }

    /// Signal every worker to stop and wait for them to drain
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }

    /// Number of workers in the pool
    pub fn size(&self) -> usize {
        self.handles.len()
    }
}
