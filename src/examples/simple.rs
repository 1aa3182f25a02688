//! Simple example of running a live proxy pool.

use live_proxy_pool::{builtin_sources, DispatchPolicy, Outcome, ProxyPool, ProxyPoolConfig};
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    println!("Initializing proxy pool...");

    let config = ProxyPoolConfig::builder()
        .sources(builtin_sources())
        .probe_targets(vec!["https://httpbin.org/get"])
        .probe_timeout(Duration::from_secs(5))
        .max_concurrent_probes(20)
        .max_candidates_per_cycle(200)
        .dispatch_policy(DispatchPolicy::BestLatency)
        .snapshot_path("proxies.json")
        .build();

    let pool = ProxyPool::new(config)?;

    // Run the first fetch in the foreground so there is something to hand out.
    if let Some(report) = pool.refresh_now().await {
        println!(
            "Fetched {} endpoints, admitted {} proxies",
            report.discovered, report.admitted
        );
    }
    pool.start();

    match pool.get_proxy() {
        Ok(proxy) => {
            println!(
                "Using proxy {} ({:?} ms, {:?})",
                proxy.address,
                proxy.latency_millis,
                proxy.anonymity
            );

            let client = reqwest::Client::builder()
                .proxy(reqwest::Proxy::all(format!("http://{}", proxy.address))?)
                .timeout(Duration::from_secs(10))
                .build()?;
            let outcome = match client.get("https://httpbin.org/ip").send().await {
                Ok(response) => {
                    println!("Response: {}", response.text().await?);
                    Outcome::Success
                }
                Err(e) => {
                    println!("Request failed: {}", e);
                    Outcome::Failure
                }
            };
            pool.report(&proxy.address, outcome);
        }
        Err(e) => println!("{}", e),
    }

    for proxy in pool.list_active().iter().take(10) {
        println!("{:>22} {:>6?} ms", proxy.address, proxy.latency_millis);
    }

    let stats = pool.get_stats();
    println!(
        "Pool: {} total, {} active, {} quarantined",
        stats.total, stats.active, stats.quarantined
    );

    pool.shutdown().await;
    Ok(())
}
