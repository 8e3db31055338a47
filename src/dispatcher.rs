// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatcher
//!
//! This module provides the consumer side loop. Handlers are registered per queue
//! together with their consume options; `consume_blocking` starts one consumer per
//! registration, each on its own task, and feeds every delivery through
//! [`crate::consumer`].
//!
//! Fairness comes from the prefetch limit in [`ConsumeOptions`]: the broker never
//! has more than that many unacknowledged deliveries outstanding to one consumer,
//! so a slow handler does not build up a backlog while other workers idle.

use crate::{
    broker::{Broker, ConsumeOptions},
    consumer::consume,
    errors::AmqpError,
    handler::ConsumerHandler,
};
use futures_util::future::join_all;
use opentelemetry::global;
use std::sync::Arc;
use tracing::{debug, error};

/// Associates a queue and its consume options with a handler.
#[derive(Clone)]
pub struct DispatcherDefinition {
    pub(crate) queue: String,
    pub(crate) options: ConsumeOptions,
    pub(crate) handler: Arc<dyn ConsumerHandler>,
}

/// Runs consumers for the registered queues.
pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    pub(crate) dispatchers_def: Vec<DispatcherDefinition>,
}

impl Dispatcher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Dispatcher {
            broker,
            dispatchers_def: Vec::new(),
        }
    }

    /// Registers a handler for a queue.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn register(
        mut self,
        queue: &str,
        options: ConsumeOptions,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Self {
        self.dispatchers_def.push(DispatcherDefinition {
            queue: queue.to_owned(),
            options,
            handler,
        });
        self
    }

    /// Consumes every registered queue until all consumers end.
    ///
    /// A consumer ends when its session is closed (or the broker goes away).
    pub async fn consume_blocking(&self) -> Result<(), AmqpError> {
        let mut spawns = vec![];

        for def in &self.dispatchers_def {
            let mut consumer = self
                .broker
                .consume(&def.queue, def.options)
                .await
                .inspect_err(|err| error!(error = err.to_string(), "failure to create the consumer"))?;
            debug!(queue = def.queue, consumer = consumer.tag(), "consuming");

            let def = def.clone();
            let broker = self.broker.clone();

            spawns.push(tokio::spawn(async move {
                let tracer = global::tracer("amqp consumer");
                while let Some(result) = consumer.next_delivery().await {
                    match result {
                        Ok(delivery) => {
                            if let Err(err) = consume(&tracer, &delivery, &def, broker.as_ref()).await {
                                error!(error = err.to_string(), "error consume msg")
                            }
                        }

                        Err(err) => error!(error = err.to_string(), "errors consume msg"),
                    }
                }
                debug!(queue = def.queue, "consumer finished");
            }));
        }

        for res in join_all(spawns).await {
            if res.is_err() {
                error!("tokio process error");
                return Err(AmqpError::InternalError);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::MemoryBroker,
        message::{Delivery, Message},
        queue::QueueDefinition,
    };
    use async_trait::async_trait;
    use opentelemetry::Context;
    use std::{sync::Mutex, time::Duration};
    use tokio::sync::mpsc;

    struct Recorder {
        seen: mpsc::UnboundedSender<String>,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl ConsumerHandler for Recorder {
        async fn exec(&self, _ctx: &Context, delivery: &Delivery) -> Result<(), AmqpError> {
            let body = delivery.message.text();
            let _ = self.seen.send(body.clone());
            if self.fail_on == Some(body.as_str()) {
                return Err(AmqpError::ConsumerError(body));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatches_and_acks_until_session_closes() {
        let broker = MemoryBroker::new();
        let producer = broker.connect();
        producer.declare_queue(&QueueDefinition::new("jobs")).await.unwrap();
        for body in ["a", "b", "poison", "c"] {
            producer.publish("", "jobs", Message::new(body)).await.unwrap();
        }

        let (seen, mut received) = mpsc::unbounded_channel();
        let session: Arc<dyn Broker> = Arc::new(broker.connect());
        let dispatcher = Dispatcher::new(session.clone()).register(
            "jobs",
            ConsumeOptions::default(),
            Arc::new(Recorder {
                seen,
                fail_on: Some("poison"),
            }),
        );
        let running = tokio::spawn(async move { dispatcher.consume_blocking().await });

        let mut bodies = vec![];
        for _ in 0..4 {
            bodies.push(received.recv().await.unwrap());
        }
        assert_eq!(bodies, vec!["a", "b", "poison", "c"]);

        tokio::time::timeout(Duration::from_secs(1), async {
            while broker.unacked_count("jobs") > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        session.close().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // acked or rejected, nothing left behind
        assert_eq!(broker.queue_depth("jobs"), Some(0));
        assert_eq!(broker.unacked_count("jobs"), 0);
    }

    #[tokio::test]
    async fn unknown_queue_fails_fast() {
        let broker = MemoryBroker::new();
        let session: Arc<dyn Broker> = Arc::new(broker.connect());
        let (seen, _) = mpsc::unbounded_channel();

        let result = Dispatcher::new(session)
            .register(
                "missing",
                ConsumeOptions::default(),
                Arc::new(Recorder { seen, fail_on: None }),
            )
            .consume_blocking()
            .await;

        assert_eq!(result, Err(AmqpError::QueueNotFound("missing".to_owned())));
    }

    #[tokio::test(start_paused = true)]
    async fn two_workers_share_a_queue_fairly() {
        struct Slow {
            log: Arc<Mutex<Vec<(usize, String)>>>,
            id: usize,
            delay: Duration,
        }

        #[async_trait]
        impl ConsumerHandler for Slow {
            async fn exec(&self, _ctx: &Context, delivery: &Delivery) -> Result<(), AmqpError> {
                tokio::time::sleep(self.delay).await;
                self.log
                    .lock()
                    .unwrap()
                    .push((self.id, delivery.message.text()));
                Ok(())
            }
        }

        let broker = MemoryBroker::new();
        let producer = broker.connect();
        producer.declare_queue(&QueueDefinition::new("work")).await.unwrap();

        let log = Arc::new(Mutex::new(vec![]));
        let mut sessions = vec![];
        let mut tasks = vec![];
        for (id, delay) in [(0, 200), (1, 5)] {
            let session: Arc<dyn Broker> = Arc::new(broker.connect());
            let dispatcher = Dispatcher::new(session.clone()).register(
                "work",
                ConsumeOptions::default(),
                Arc::new(Slow {
                    log: log.clone(),
                    id,
                    delay: Duration::from_millis(delay),
                }),
            );
            tasks.push(tokio::spawn(async move { dispatcher.consume_blocking().await }));
            sessions.push(session);
        }
        // let both consumers register
        tokio::time::sleep(Duration::from_millis(20)).await;

        for n in 0..6 {
            producer.publish("", "work", Message::new(n.to_string())).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        // the slow worker holds a single message, the fast one drained the rest
        let done = log.lock().unwrap().clone();
        assert_eq!(done.len(), 5);
        assert!(done.iter().all(|(id, _)| *id == 1));
        assert_eq!(broker.unacked_count("work"), 1);

        for session in &sessions {
            session.close().await.unwrap();
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
    }
}
