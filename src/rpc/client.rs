// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RPC Client
//!
//! Caller side of the request/reply protocol. Each client owns an exclusive reply
//! queue and a listener task that hands every reply to the call waiting on its
//! correlation token. Replies nobody waits for are discarded.

use super::{RpcError, RpcFault};
use crate::{
    broker::{Broker, ConsumeOptions, Consumer},
    exchange::DEFAULT_EXCHANGE,
    message::{Message, MessageProperties, JSON_CONTENT_TYPE},
    publisher::Publisher,
    queue::QueueDefinition,
};
use opentelemetry::Context;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, error, warn};
use uuid::Uuid;

type PendingCalls = Arc<Mutex<Pending>>;

/// Response slots of in-flight calls, keyed by correlation token.
#[derive(Default)]
struct Pending {
    calls: HashMap<String, oneshot::Sender<Message>>,
    // set once the reply consumer is gone; no slot can be resolved after that
    closed: bool,
}

/// Client side of the request/reply protocol.
///
/// Owns one exclusive, broker-named reply queue for its whole life. Every call
/// gets its own correlation token and response slot, so calls may run
/// concurrently from several tasks sharing the client.
pub struct RpcClient {
    publisher: Publisher,
    request_queue: String,
    reply_queue: String,
    pending: PendingCalls,
    listener: JoinHandle<()>,
    timeout: Option<Duration>,
}

impl RpcClient {
    /// Declares the reply queue and starts listening on it.
    pub async fn connect(broker: Arc<dyn Broker>, request_queue: &str) -> Result<Self, RpcError> {
        let reply_queue = broker.declare_queue(&QueueDefinition::ephemeral()).await?;
        let consumer = broker
            .consume(&reply_queue, ConsumeOptions::default().auto_ack())
            .await?;
        debug!(reply_queue, "rpc client ready");

        let pending = PendingCalls::default();
        let listener = tokio::spawn(listen(consumer, pending.clone()));

        Ok(RpcClient {
            publisher: Publisher::new(broker),
            request_queue: request_queue.to_owned(),
            reply_queue,
            pending,
            listener,
            timeout: None,
        })
    }

    /// Default deadline applied by [`RpcClient::call`].
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Calls currently waiting for their reply.
    pub fn pending_calls(&self) -> usize {
        lock(&self.pending).calls.len()
    }

    /// Asks the server for `fib(n)`, using the client's default deadline.
    pub async fn call(&self, n: u32) -> Result<u64, RpcError> {
        self.call_with_timeout(n, self.timeout).await
    }

    pub async fn call_with_timeout(&self, n: u32, timeout: Option<Duration>) -> Result<u64, RpcError> {
        let reply = self.call_raw(n.to_string().into_bytes(), timeout).await?;
        decode_reply(&reply)
    }

    /// Sends `body` as a request and waits for the reply carrying its token.
    ///
    /// With a deadline, an expired call is forgotten and a late reply is discarded
    /// like any reply with an unknown token.
    pub async fn call_raw(&self, body: Vec<u8>, timeout: Option<Duration>) -> Result<Message, RpcError> {
        let token = Uuid::new_v4().to_string();
        let (sender, receiver) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            if pending.closed {
                return Err(RpcError::ReplyChannelClosed);
            }
            pending.calls.insert(token.clone(), sender);
        }
        let _slot = PendingSlot {
            pending: &self.pending,
            token: &token,
        };

        let props = MessageProperties::default()
            .with_reply_to(&self.reply_queue)
            .with_correlation_id(&token);
        self.publisher
            .publish(
                &Context::current(),
                DEFAULT_EXCHANGE,
                &self.request_queue,
                Message::new(body).with_properties(props),
            )
            .await?;
        debug!(correlation_id = token, "request sent");

        let reply = match timeout {
            Some(deadline) => tokio::time::timeout(deadline, receiver)
                .await
                .map_err(|_| {
                    warn!(correlation_id = token, "no reply before deadline");
                    RpcError::Timeout(deadline)
                })?,
            None => receiver.await,
        };

        reply.map_err(|_| RpcError::ReplyChannelClosed)
    }

    /// Stops listening and deletes the reply queue.
    pub async fn close(self) -> Result<(), RpcError> {
        self.listener.abort();
        self.publisher
            .broker()
            .delete_queue(&self.reply_queue)
            .await?;
        debug!(reply_queue = self.reply_queue, "rpc client closed");
        Ok(())
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// Removes the call's entry however the call ends.
struct PendingSlot<'a> {
    pending: &'a PendingCalls,
    token: &'a str,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        lock(self.pending).calls.remove(self.token);
    }
}

fn lock(pending: &PendingCalls) -> MutexGuard<'_, Pending> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn listen(mut consumer: Consumer, pending: PendingCalls) {
    while let Some(result) = consumer.next_delivery().await {
        let delivery = match result {
            Ok(delivery) => delivery,
            Err(err) => {
                error!(error = err.to_string(), "errors consume reply");
                continue;
            }
        };

        let Some(token) = delivery.message.properties.correlation_id.clone() else {
            debug!("discarding reply without correlation id");
            continue;
        };

        let slot = lock(&pending).calls.remove(&token);
        match slot {
            Some(sender) => {
                if sender.send(delivery.message).is_err() {
                    debug!(correlation_id = token, "caller gave up before the reply");
                }
            }
            None => debug!(correlation_id = token, "discarding reply for unknown call"),
        }
    }

    debug!(queue = consumer.queue(), "reply consumer finished");
    // wakes every waiting caller with a closed channel
    let mut pending = lock(&pending);
    pending.closed = true;
    pending.calls.clear();
}

fn decode_reply(reply: &Message) -> Result<u64, RpcError> {
    if reply.properties.content_type.as_deref() == Some(JSON_CONTENT_TYPE) {
        let fault: RpcFault = serde_json::from_slice(&reply.body)
            .map_err(|err| RpcError::InvalidResponse(err.to_string()))?;
        return Err(RpcError::Remote(fault.message));
    }

    let text = reply.text();
    text.trim()
        .parse()
        .map_err(|_| RpcError::InvalidResponse(text))
}
