// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use rabbitmq_patterns::{
    broker::{Broker, ConsumeOptions},
    memory::MemoryBroker,
    message::{Message, MessageProperties},
    publisher::Publisher,
    queue::QueueDefinition,
    rpc::{fibonacci, FibonacciServer, RpcClient, RpcError, RPC_QUEUE},
};
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;

const WAIT: Option<Duration> = Some(Duration::from_secs(2));

struct Server {
    session: Arc<dyn Broker>,
    running: JoinHandle<()>,
}

impl Server {
    async fn start(broker: &MemoryBroker) -> Server {
        let session: Arc<dyn Broker> = Arc::new(broker.connect());
        // declared up front so requests sent before the consumer starts are kept
        session
            .declare_queue(&QueueDefinition::new(RPC_QUEUE))
            .await
            .unwrap();

        let server = FibonacciServer::new(Publisher::new(session.clone()));
        let running = tokio::spawn({
            let session = session.clone();
            async move { server.serve(session, RPC_QUEUE).await.unwrap() }
        });
        Server { session, running }
    }

    async fn stop(self) {
        self.session.close().await.unwrap();
        self.running.await.unwrap();
    }
}

async fn client(broker: &MemoryBroker) -> RpcClient {
    RpcClient::connect(Arc::new(broker.connect()), RPC_QUEUE)
        .await
        .unwrap()
        .with_timeout(WAIT)
}

async fn eventually(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn fib_of_ten_round_trip() {
    let broker = MemoryBroker::new();
    let server = Server::start(&broker).await;
    let client = client(&broker).await;

    assert_eq!(client.call(10).await, Ok(55));
    assert_eq!(client.call(0).await, Ok(0));
    assert_eq!(client.call(93).await, Ok(12_200_160_415_121_876_738));
    assert_eq!(client.pending_calls(), 0);

    client.close().await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn out_of_range_request_fails_remotely() {
    let broker = MemoryBroker::new();
    let server = Server::start(&broker).await;
    let client = client(&broker).await;

    match client.call(94).await {
        Err(RpcError::Remote(message)) => assert!(message.contains("94")),
        other => panic!("unexpected result {other:?}"),
    }
    // the server keeps serving after a fault
    assert_eq!(client.call(20).await, Ok(6765));

    server.stop().await;
}

#[tokio::test]
async fn concurrent_calls_from_many_tasks() {
    let broker = MemoryBroker::new();
    let server = Server::start(&broker).await;
    let client = Arc::new(client(&broker).await);

    let calls: Vec<_> = (0..20u32)
        .map(|n| {
            let client = client.clone();
            tokio::spawn(async move { (n, client.call(n).await) })
        })
        .collect();

    for call in calls {
        let (n, result) = call.await.unwrap();
        assert_eq!(result, Ok(fibonacci(n).unwrap()));
    }
    assert_eq!(client.pending_calls(), 0);

    server.stop().await;
}

#[tokio::test]
async fn stray_reply_does_not_resolve_a_call() {
    let broker = MemoryBroker::new();
    let client = Arc::new(client(&broker).await);
    let setup = broker.connect();
    setup
        .declare_queue(&QueueDefinition::new(RPC_QUEUE))
        .await
        .unwrap();

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call(10).await }
    });
    eventually(|| broker.queue_depth(RPC_QUEUE) == Some(1)).await;

    let stray = Message::new("999")
        .with_properties(MessageProperties::default().with_correlation_id("not-a-pending-call"));
    setup.publish("", client.reply_queue(), stray).await.unwrap();
    eventually(|| broker.queue_depth(client.reply_queue()) == Some(0)).await;
    assert!(!call.is_finished());

    let server = Server::start(&broker).await;
    assert_eq!(call.await.unwrap(), Ok(55));

    server.stop().await;
}

#[tokio::test]
async fn redelivered_request_yields_one_result() {
    let broker = MemoryBroker::new();
    let client = Arc::new(client(&broker).await);

    // a server that answers and dies before acknowledging the request
    let crashing = broker.connect();
    crashing
        .declare_queue(&QueueDefinition::new(RPC_QUEUE))
        .await
        .unwrap();
    let mut requests = crashing
        .consume(RPC_QUEUE, ConsumeOptions::default())
        .await
        .unwrap();

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call(10).await }
    });

    let request = requests.next_delivery().await.unwrap().unwrap();
    let props = &request.message.properties;
    let reply = Message::new("55").with_properties(
        MessageProperties::default().with_correlation_id(props.correlation_id.as_deref().unwrap()),
    );
    crashing
        .publish("", props.reply_to.as_deref().unwrap(), reply)
        .await
        .unwrap();
    assert_eq!(call.await.unwrap(), Ok(55));
    drop(crashing);

    // the request comes back and is answered a second time
    assert_eq!(broker.queue_depth(RPC_QUEUE), Some(1));
    let server = Server::start(&broker).await;
    eventually(|| broker.queue_depth(RPC_QUEUE) == Some(0) && broker.unacked_count(RPC_QUEUE) == 0)
        .await;

    // the duplicate reply was consumed and discarded
    eventually(|| broker.queue_depth(client.reply_queue()) == Some(0)).await;
    assert_eq!(client.pending_calls(), 0);

    server.stop().await;
}

#[tokio::test]
async fn call_without_server_times_out() {
    let broker = MemoryBroker::new();
    let client = client(&broker)
        .await
        .with_timeout(Some(Duration::from_millis(50)));
    broker
        .connect()
        .declare_queue(&QueueDefinition::new(RPC_QUEUE).durable())
        .await
        .unwrap();

    assert_eq!(
        client.call(5).await,
        Err(RpcError::Timeout(Duration::from_millis(50)))
    );
    assert_eq!(client.pending_calls(), 0);
    // the request stays queued for a server that never came
    assert_eq!(broker.queue_depth(RPC_QUEUE), Some(1));
}

#[tokio::test]
async fn closing_the_client_removes_its_reply_queue() {
    let broker = MemoryBroker::new();
    let client = client(&broker).await;
    let reply_queue = client.reply_queue().to_owned();
    assert!(reply_queue.starts_with("amq.gen-"));

    client.close().await.unwrap();
    assert!(!broker.queue_exists(&reply_queue));
}
