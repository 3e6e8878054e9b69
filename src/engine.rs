//! # Execution Engine Facade
//!
//! Wires the store, queue, registries, events, and clock together and
//! exposes the operations embedding applications drive the engine with:
//! start, cancel, pause, resume, restart. Work happens on the worker
//! pool (or, in tests, by stepping the queue inline).

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::events::{EventPublisher, PublishedEvent};
use crate::handlers::{EngineContext, MessageDispatcher};
use crate::messaging::{InMemoryQueue, Message, MessageQueue};
use crate::models::{Execution, ExecutionType};
use crate::registry::{StageDefinition, StageDefinitionRegistry, TaskHandler, TaskHandlerRegistry};
use crate::stages::{ExecutionWindowStage, WaitForExecutionWindowTask, WAIT_FOR_EXECUTION_WINDOW_TASK};
use crate::store::{ExecutionStore, InMemoryExecutionStore};
use crate::worker::WorkerPool;

/// Builder for an [`ExecutionEngine`]
pub struct EngineBuilder {
    store: Option<Arc<dyn ExecutionStore>>,
    queue: Option<Arc<dyn MessageQueue>>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    stage_definitions: Arc<StageDefinitionRegistry>,
    task_handlers: Arc<TaskHandlerRegistry>,
}

impl EngineBuilder {
    fn new() -> Self {
        Self {
            store: None,
            queue: None,
            clock: Arc::new(SystemClock),
            config: EngineConfig::default(),
            stage_definitions: Arc::new(StageDefinitionRegistry::new()),
            task_handlers: Arc::new(TaskHandlerRegistry::new()),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn MessageQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn register_stage_definition(self, definition: Arc<dyn StageDefinition>) -> Self {
        self.stage_definitions.register(definition);
        self
    }

    pub fn register_task_handler(
        self,
        implementing_class: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        self.task_handlers.register(implementing_class, handler);
        self
    }

    /// Finish wiring. Built-in synthetic stage types are registered
    /// here so every engine can expand execution windows.
    pub fn build(self) -> ExecutionEngine {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryExecutionStore::new()));
        let queue = self.queue.unwrap_or_else(|| {
            Arc::new(InMemoryQueue::new(
                self.clock.clone(),
                self.config.visibility_timeout(),
            ))
        });

        self.stage_definitions.register(Arc::new(ExecutionWindowStage));
        self.task_handlers.register(
            WAIT_FOR_EXECUTION_WINDOW_TASK,
            Arc::new(WaitForExecutionWindowTask::new(self.clock.clone())),
        );

        let context = Arc::new(EngineContext {
            store,
            queue,
            stage_definitions: self.stage_definitions,
            task_handlers: self.task_handlers,
            events: EventPublisher::new(self.config.event_channel_capacity),
            clock: self.clock,
            config: self.config,
        });
        let dispatcher = Arc::new(MessageDispatcher::new(context.clone()));
        ExecutionEngine {
            context,
            dispatcher,
        }
    }
}

/// Front door of the execution engine
pub struct ExecutionEngine {
    context: Arc<EngineContext>,
    dispatcher: Arc<MessageDispatcher>,
}

impl ExecutionEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.context.store
    }

    pub fn queue(&self) -> &Arc<dyn MessageQueue> {
        &self.context.queue
    }

    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.context.events.subscribe()
    }

    /// Persist an execution and enqueue its StartExecution message
    pub async fn start(&self, execution: &Execution) -> Result<()> {
        self.context.store.store(execution).await?;
        self.context
            .queue
            .push(Message::StartExecution {
                execution_type: execution.execution_type,
                execution_id: execution.id.clone(),
                application: execution.application.clone(),
            })
            .await?;
        Ok(())
    }

    pub async fn cancel(
        &self,
        execution_type: ExecutionType,
        execution_id: &str,
        application: &str,
        canceled_by: Option<String>,
        reason: Option<String>,
    ) -> Result<()> {
        self.context
            .queue
            .push(Message::CancelExecution {
                execution_type,
                execution_id: execution_id.to_string(),
                application: application.to_string(),
                canceled_by,
                reason,
            })
            .await?;
        Ok(())
    }

    pub async fn pause(
        &self,
        execution_type: ExecutionType,
        execution_id: &str,
        application: &str,
    ) -> Result<()> {
        self.context
            .queue
            .push(Message::PauseExecution {
                execution_type,
                execution_id: execution_id.to_string(),
                application: application.to_string(),
            })
            .await?;
        Ok(())
    }

    pub async fn resume(
        &self,
        execution_type: ExecutionType,
        execution_id: &str,
        application: &str,
    ) -> Result<()> {
        self.context
            .queue
            .push(Message::ResumeExecution {
                execution_type,
                execution_id: execution_id.to_string(),
                application: application.to_string(),
            })
            .await?;
        Ok(())
    }

    pub async fn restart_stage(
        &self,
        execution_type: ExecutionType,
        execution_id: &str,
        application: &str,
        stage_id: &str,
    ) -> Result<()> {
        self.context
            .queue
            .push(Message::RestartStage {
                execution_type,
                execution_id: execution_id.to_string(),
                application: application.to_string(),
                stage_id: stage_id.to_string(),
            })
            .await?;
        Ok(())
    }

    /// Spawn the worker pool onto the current runtime
    pub fn spawn_workers(&self) -> WorkerPool {
        WorkerPool::start(
            self.dispatcher.clone(),
            self.context.queue.clone(),
            &self.context.config,
        )
    }

    /// Poll, dispatch, and ack a single message. Returns the handled
    /// message, or None when the queue had nothing visible.
    pub async fn step(&self) -> Result<Option<Message>> {
        let Some(delivery) = self.context.queue.poll().await? else {
            return Ok(None);
        };
        let outcome = self.dispatcher.dispatch(&delivery.message).await;
        match outcome {
            Ok(()) => {
                self.context.queue.ack(delivery.token).await?;
                Ok(Some(delivery.message))
            }
            Err(err) if err.is_transient() => {
                self.context.queue.nack(delivery.token).await?;
                Err(err)
            }
            Err(err) => {
                self.context.queue.ack(delivery.token).await?;
                Err(err)
            }
        }
    }

    /// Step until the queue has nothing visible, bounded by `limit`
    /// messages. Delayed messages stay parked until the clock reaches
    /// them, so a quiescent engine can still hold future work.
    pub async fn run_until_quiescent(&self, limit: usize) -> Result<usize> {
        let mut handled = 0;
        while handled < limit {
            if self.step().await?.is_none() {
                break;
            }
            handled += 1;
        }
        Ok(handled)
    }
}
