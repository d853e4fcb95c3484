use std::net::SocketAddr;
use std::time::Duration;

use tower::BoxError;
use tower::ServiceExt;
use tower::service_fn;
use tower_guard::CallContext;
use tower_guard::CallInfo;
use tower_guard::Request;
use tower_guard::ServerOptions;
use tower_guard::Status;
use tower_guard::server::serve_metrics;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 1. Build a monitored server chain
    let stack = ServerOptions::new()
        .monitor("greeter", 50051, "stdout://local")
        .fixed_window(Duration::from_secs(1), 5)
        .build::<String, String>()?;
    let handler = stack.handler(service_fn(|request: Request<String>| async move {
        match request.message().as_str() {
            "panic" => panic!("greeter exploded"),
            name => Ok::<_, Status>(format!("Hello, {name}!")),
        }
    }));

    // 2. Generate some traffic
    for name in ["ada", "grace", "panic", "alan", "barbara", "edsger", "ken"] {
        let request = Request::new(
            CallContext::new(),
            CallInfo::server("/greeter.Greeter/SayHello"),
            name.to_string(),
        );
        match handler.clone().oneshot(request).await {
            Ok(reply) => println!("✅ {reply}"),
            Err(status) => println!("❌ {status}"),
        }
    }

    // 3. Serve the metrics
    let Some(monitor) = stack.monitor() else {
        return Ok(());
    };
    let addr = SocketAddr::from(([127, 0, 0, 1], 9090));
    println!("📡 Metrics on http://{addr}/metrics");
    serve_metrics(monitor.registry().clone(), addr).await?;
    Ok(())
}
