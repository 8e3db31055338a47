// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use clap::{Parser, Subcommand};
use rabbitmq_patterns::{
    amqp::AmqpBroker,
    broker::Broker,
    configs::Configs,
    errors::AmqpError,
    patterns::{self, LogPrinter, PrintStyle, Severity, TaskWorker, DEFAULT_MESSAGE, DEFAULT_TOPIC_KEY},
    publisher::Publisher,
    rpc::{FibonacciServer, RpcClient, RPC_QUEUE},
    telemetry,
};
use std::{error::Error, future::Future, process::ExitCode, sync::Arc, time::Duration};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "rabbitmq-patterns", version, about = "RabbitMQ tutorial programs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a message to the `hello` queue
    Send { message: Option<String> },
    /// Work through messages of the `hello` queue
    Receive,
    /// Queue a task, one second of work per `.`
    NewTask { message: Vec<String> },
    /// Process tasks one at a time
    Worker,
    /// Broadcast a log line
    EmitLog { message: Vec<String> },
    /// Print every broadcast log line
    ReceiveLogs,
    /// Emit a log line with a severity
    EmitLogDirect {
        severity: Option<String>,
        message: Vec<String>,
    },
    /// Print log lines of the given severities
    ReceiveLogsDirect {
        #[arg(required = true)]
        severities: Vec<String>,
    },
    /// Emit a log line with a `<facility>.<severity>` routing key
    EmitLogTopic {
        routing_key: Option<String>,
        message: Vec<String>,
    },
    /// Print log lines matching the given binding keys
    ReceiveLogsTopic {
        #[arg(required = true)]
        binding_keys: Vec<String>,
    },
    /// Answer Fibonacci requests
    RpcServer,
    /// Ask the RPC server for fib(n)
    RpcClient {
        #[arg(default_value_t = 30)]
        n: u32,
        #[arg(long = "timeout-ms")]
        timeout_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    telemetry::init_tracing();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = err.to_string(), "failure");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let cfg = Configs::load()?;
    let broker: Arc<dyn Broker> = Arc::new(AmqpBroker::connect(&cfg).await?);
    let publisher = Publisher::new(broker.clone());

    let result = execute(cli.command, &cfg, broker.clone(), &publisher).await;
    broker.close().await?;
    result
}

async fn execute(
    command: Commands,
    cfg: &Configs,
    broker: Arc<dyn Broker>,
    publisher: &Publisher,
) -> Result<(), Box<dyn Error>> {
    match command {
        Commands::Send { message } => {
            let message = message.unwrap_or_else(|| DEFAULT_MESSAGE.to_owned());
            patterns::send_hello(publisher, &message).await?;
            println!(" [x] Sent {message}");
        }
        Commands::Receive => {
            waiting_for("messages");
            until_interrupted(patterns::receive_hello(broker, Arc::new(TaskWorker::stdout()))).await?;
        }
        Commands::NewTask { message } => {
            let message = join_words(&message);
            patterns::new_task(publisher, &message).await?;
            println!(" [x] Sent {message}");
        }
        Commands::Worker => {
            waiting_for("messages");
            until_interrupted(patterns::run_worker(broker, Arc::new(TaskWorker::stdout()))).await?;
        }
        Commands::EmitLog { message } => {
            let message = join_words(&message);
            patterns::emit_log(publisher, &message).await?;
            println!(" [x] Sent {message}");
        }
        Commands::ReceiveLogs => {
            let queue = patterns::subscribe_logs(broker.as_ref()).await?;
            let printer = Arc::new(LogPrinter::stdout(PrintStyle::Body));
            waiting_for("logs");
            until_interrupted(patterns::receive_logs(broker, &queue, printer)).await?;
        }
        Commands::EmitLogDirect { severity, message } => {
            let severity = severity.as_deref().map_or(Severity::Info, Severity::parse_lenient);
            let message = join_words(&message);
            patterns::emit_log_direct(publisher, severity, &message).await?;
            println!(" [x] Sent {severity}:{message}");
        }
        Commands::ReceiveLogsDirect { severities } => {
            let keys: Vec<&str> = severities.iter().map(String::as_str).collect();
            let queue = patterns::subscribe_direct(broker.as_ref(), &keys).await?;
            let printer = Arc::new(LogPrinter::stdout(PrintStyle::RoutingKey));
            waiting_for("logs");
            until_interrupted(patterns::receive_logs(broker, &queue, printer)).await?;
        }
        Commands::EmitLogTopic { routing_key, message } => {
            let routing_key = routing_key.unwrap_or_else(|| DEFAULT_TOPIC_KEY.to_owned());
            let message = join_words(&message);
            patterns::emit_log_topic(publisher, &routing_key, &message).await?;
            println!(" [x] Sent {routing_key}:{message}");
        }
        Commands::ReceiveLogsTopic { binding_keys } => {
            let keys: Vec<&str> = binding_keys.iter().map(String::as_str).collect();
            let queue = patterns::subscribe_topic(broker.as_ref(), &keys).await?;
            let printer = Arc::new(LogPrinter::stdout(PrintStyle::RoutingKey));
            waiting_for("logs");
            until_interrupted(patterns::receive_logs(broker, &queue, printer)).await?;
        }
        Commands::RpcServer => {
            let server = FibonacciServer::new(publisher.clone()).with_reply_ttl(cfg.rpc.reply_ttl());
            println!(" [x] Awaiting RPC requests");
            until_interrupted(server.serve(broker, RPC_QUEUE)).await?;
        }
        Commands::RpcClient { n, timeout_ms } => {
            let timeout = timeout_ms.map(Duration::from_millis).or(cfg.rpc.timeout());
            let client = RpcClient::connect(broker, RPC_QUEUE)
                .await?
                .with_timeout(timeout);

            println!(" [x] Requesting fib({n})");
            let result = client.call(n).await;
            client.close().await?;
            println!(" [.] Got {}", result?);
        }
    }

    Ok(())
}

fn join_words(words: &[String]) -> String {
    if words.is_empty() {
        DEFAULT_MESSAGE.to_owned()
    } else {
        words.join(" ")
    }
}

fn waiting_for(what: &str) {
    println!(" [*] Waiting for {what}. To exit press CTRL+C");
}

/// Runs a consumer until it ends or the process receives Ctrl-C.
async fn until_interrupted<F>(consumer: F) -> Result<(), AmqpError>
where
    F: Future<Output = Result<(), AmqpError>>,
{
    tokio::select! {
        result = consumer => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Ok(())
        }
    }
}
