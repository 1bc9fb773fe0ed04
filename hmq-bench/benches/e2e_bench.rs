//! End-to-end client-server benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hmq_broker::{BrokerConfig, BrokerController, Message, Producer};
use hmq_client::{ClientConfig, RemotingClient};
use hmq_protocol::{Command, ResponseCode};
use hmq_remoting::{ProcessorError, RequestContext};
use hmq_server::{RemotingServer, ServerConfig};
use hmq_store::{FlushPolicy, StoreConfig};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::runtime::Runtime;

const TIMEOUT: Duration = Duration::from_secs(3);

struct EchoSetup {
    _server: RemotingServer,
    client: RemotingClient,
    addr: String,
}

fn setup_echo(rt: &Runtime) -> EchoSetup {
    rt.block_on(async {
        let server = RemotingServer::new(ServerConfig::new("127.0.0.1:0".parse().unwrap()));
        let echo = |_: &RequestContext, request: &Command| -> Result<Option<Command>, ProcessorError> {
            Ok(Some(
                Command::response(ResponseCode::Success, "").with_body(request.body.clone()),
            ))
        };
        server.register_processor(1, Arc::new(echo), None);
        let addr = server.start().await.unwrap().to_string();

        let client = RemotingClient::new(ClientConfig::default());
        client.start();
        // Establish the connection outside the measurement
        client
            .invoke_sync(&addr, Command::request(1), TIMEOUT)
            .await
            .unwrap();

        EchoSetup {
            _server: server,
            client,
            addr,
        }
    })
}

fn bench_invoke_sync_latency(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_echo(&rt);

    let mut group = c.benchmark_group("e2e_invoke_sync");
    for size in [0, 1000, 10000] {
        let body = "x".repeat(size);
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("echo", size), &body, |b, body| {
            b.to_async(&rt).iter(|| {
                let request = Command::request(1).with_body(body.clone());
                let client = &setup.client;
                let addr = setup.addr.as_str();
                async move { black_box(client.invoke_sync(addr, request, TIMEOUT).await.unwrap()) }
            });
        });
    }

    group.finish();
}

fn bench_producer_send(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let dir = TempDir::new().unwrap();

    let mut config = BrokerConfig::default();
    config.server.listen_addr = "127.0.0.1:0".parse().unwrap();
    config.store = StoreConfig::new(dir.path()).with_flush_policy(FlushPolicy::Never);
    let broker = BrokerController::new(config).unwrap();

    let producer = rt.block_on(async {
        let addr = broker.start().await.unwrap();
        let producer = Producer::new(addr.to_string());
        producer.start();
        producer
    });
    let message = Message::new("bench-topic", "x".repeat(100)).with_keys("bench-key");

    let mut group = c.benchmark_group("e2e_producer");
    group.throughput(Throughput::Elements(1));
    group.bench_function("send_sync", |b| {
        b.to_async(&rt).iter(|| {
            let producer = &producer;
            let message = &message;
            async move { black_box(producer.send(message).await.unwrap()) }
        });
    });
    group.finish();

    producer.shutdown();
    let _ = broker.shutdown();
}

criterion_group!(benches, bench_invoke_sync_latency, bench_producer_send);
criterion_main!(benches);
