// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! This module provides functionality for declaring a batch of topology components.
//! The topology includes exchanges, queues, and the bindings between them, and is
//! installed on any [`Broker`] in that order. Declarations are idempotent, so a
//! topology can be installed by every process that needs it.

use crate::{
    broker::Broker,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use tracing::debug;

/// A set of exchanges, queues and bindings to declare together.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl Topology {
    pub fn new() -> Topology {
        Topology::default()
    }

    /// Adds an exchange definition to the topology.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Adds a queue definition to the topology.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    /// Adds a queue-to-exchange binding to the topology.
    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Installs the topology on the broker.
    ///
    /// This method performs the following operations in order:
    /// 1. Creates all exchanges
    /// 2. Creates all queues
    /// 3. Sets up queue-to-exchange bindings
    ///
    /// # Returns
    /// The declared queue names, in declaration order.
    pub async fn install(&self, broker: &dyn Broker) -> Result<Vec<String>, AmqpError> {
        self.install_exchange(broker).await?;
        let queues = self.install_queue(broker).await?;
        self.binding_queues(broker).await?;
        Ok(queues)
    }

    async fn install_exchange(&self, broker: &dyn Broker) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);
            broker.declare_exchange(exch).await?;
            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn install_queue(&self, broker: &dyn Broker) -> Result<Vec<String>, AmqpError> {
        let mut names = Vec::with_capacity(self.queues.len());

        for def in &self.queues {
            debug!("creating queue: {}", def.name);
            let name = broker.declare_queue(def).await?;
            debug!("queue: {} was created", name);
            names.push(name);
        }

        Ok(names)
    }

    async fn binding_queues(&self, broker: &dyn Broker) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );
            broker.bind_queue(binding).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockBroker;
    use mockall::Sequence;

    #[tokio::test]
    async fn installs_exchanges_then_queues_then_bindings() {
        let mut broker = MockBroker::new();
        let mut seq = Sequence::new();

        broker
            .expect_declare_exchange()
            .withf(|def| def.name() == "logs")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        broker
            .expect_declare_queue()
            .withf(|def| def.name() == "task_queue")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|def| Ok(def.name().to_owned()));
        broker
            .expect_bind_queue()
            .withf(|b| b.queue_name == "task_queue" && b.exchange_name == "logs")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let queues = Topology::new()
            .exchange(ExchangeDefinition::new("logs").fanout())
            .queue(QueueDefinition::new("task_queue").durable())
            .queue_binding(QueueBinding::new("task_queue").exchange("logs"))
            .install(&broker)
            .await
            .unwrap();

        assert_eq!(queues, vec!["task_queue".to_owned()]);
    }

    #[tokio::test]
    async fn stops_at_first_failure() {
        let mut broker = MockBroker::new();

        broker
            .expect_declare_exchange()
            .returning(|def| Err(AmqpError::DeclareExchangeError(def.name().to_owned())));
        broker.expect_declare_queue().never();

        let result = Topology::new()
            .exchange(ExchangeDefinition::new("logs"))
            .queue(QueueDefinition::new("q"))
            .install(&broker)
            .await;

        assert_eq!(result, Err(AmqpError::DeclareExchangeError("logs".to_owned())));
    }
}
