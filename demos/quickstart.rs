use anyhow::Result;
use demo_pilot::{
    Agent, AgentConfig, BrowserConfig, ChromiumComputer, DiskRecorder, Goal, OracleClient, OracleConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let site = std::env::var("DEMO_SITE").unwrap_or_else(|_| "https://example.com".to_string());
    let computer = ChromiumComputer::new(BrowserConfig { headless: false, ..Default::default() });
    let oracle = OracleClient::new(OracleConfig::default())?;
    let pool_view = oracle.clone();

    let runs_dir = std::env::temp_dir().join("demo_pilot_runs");
    let agent = Agent::with_defaults(
        computer,
        oracle,
        AgentConfig { step_budget: 15, step_timeout: Duration::from_secs(20), ..Default::default() },
    )
    .with_recorder(Arc::new(DiskRecorder::new(&runs_dir)));

    let goal = Goal::from_task("Demonstrate exporting a report", &site)
        .with_feature_name("Export")
        .with_instructions("1. Open the reports page\n2. Click Export\n3. Choose CSV as the format\n4. Click Save");

    // Ctrl-C stops the run but keeps the steps recorded so far
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let result = agent.run_with_cancel(&goal, cancel).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    println!("artifacts: {}", runs_dir.join(&result.run_id).display());
    for (index, usage) in pool_view.usage().await.iter().enumerate() {
        println!("credential {index}: {} requests this window", usage.request_count);
    }
    Ok(())
}
