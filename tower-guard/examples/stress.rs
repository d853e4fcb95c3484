use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use clap::Parser;
use tokio::time::sleep;
use tower::BoxError;
use tower::ServiceExt;
use tower::service_fn;
use tower_guard::Backoff;
use tower_guard::CallContext;
use tower_guard::ClientOptions;
use tower_guard::Code;
use tower_guard::Request;
use tower_guard::RetryPolicy;
use tower_guard::ServerOptions;
use tower_guard::Status;
use tracing_subscriber::EnvFilter;

/// Fire a burst of calls through a client retry chain into a throttled, rate limited server.
#[derive(Parser, Debug)]
struct Args {
    /// Number of concurrent calls
    #[arg(long, default_value_t = 200)]
    calls: usize,

    /// Deadline of each call
    #[arg(long, value_parser = humantime::parse_duration, default_value = "2s")]
    deadline: Duration,

    /// Token refill interval of the server's rate limiter
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10ms")]
    fill_interval: Duration,

    /// Token bucket capacity
    #[arg(long, default_value_t = 100)]
    capacity: usize,

    /// Calls the server runs at once
    #[arg(long, default_value_t = 20)]
    limit: usize,

    /// Calls allowed to queue for a slot
    #[arg(long, default_value_t = 40)]
    backlog: usize,

    /// How long a queued call waits for a slot
    #[arg(long, value_parser = humantime::parse_duration, default_value = "50ms")]
    backlog_timeout: Duration,

    /// Attempts per call, the first included
    #[arg(long, default_value_t = 3)]
    attempts: u32,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    // 1. Server: token bucket in front of a throttle
    let server = ServerOptions::new()
        .token_bucket(args.fill_interval, args.capacity, 1)
        .throttle(args.limit, args.backlog, args.backlog_timeout)
        .build::<usize, usize>()?;
    let handler = server.handler(service_fn(|request: Request<usize>| async move {
        // Simulate a tiny bit of processing time
        sleep(Duration::from_millis(5)).await;
        Ok::<_, Status>(request.into_message())
    }));

    // 2. Client: retries throttled calls with exponential backoff
    let attempts = Arc::new(AtomicUsize::new(0));
    let invoker_attempts = Arc::clone(&attempts);
    let client = ClientOptions::new()
        .with_retry(
            RetryPolicy::new()
                .with_max(args.attempts)
                .with_backoff(Backoff::exponential(
                    Duration::from_millis(20),
                    Duration::from_millis(200),
                )),
        )
        .dial(
            "in-process",
            service_fn(move |request: Request<usize>| {
                invoker_attempts.fetch_add(1, Ordering::Relaxed);
                handler.clone().oneshot(request)
            }),
        );

    println!("🚀 Starting Stress Test...");
    println!("{args:?}\n");

    // 3. Fire the calls at once
    let mut tasks = Vec::new();
    for i in 0..args.calls {
        let client = client.clone();
        let ctx = CallContext::new().with_timeout(args.deadline);
        tasks.push(tokio::spawn(async move {
            client.invoke(ctx, "/stress.Echo/Echo", i).await
        }));
    }

    let mut ok = 0;
    let mut by_code = std::collections::BTreeMap::<&str, usize>::new();
    for task in tasks {
        match task.await? {
            Ok(_) => ok += 1,
            Err(status) => *by_code.entry(status.code().as_str()).or_default() += 1,
        }
    }

    println!("Succeeded:  {ok}/{}", args.calls);
    println!("Dispatches: {}", attempts.load(Ordering::Relaxed));
    for (code, count) in by_code {
        let marker = if code == Code::ResourceExhausted.as_str() { "❌" } else { "💥" };
        println!("{marker} {code}: {count}");
    }
    println!("\n🏁 Stress test complete.");
    Ok(())
}
