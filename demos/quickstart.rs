use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use webpilot::{
    Agent, AgentConfig, BrowserConfig, ChromiumBrowser, LlmConfig, OpenAiCompatClient, RunStatus,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let task = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "Open https://news.ycombinator.com and report the top story title.".into());

    let browser = if let Ok(ws) = std::env::var("CHROME_WS_URL") {
        if !ws.trim().is_empty() {
            ChromiumBrowser::connect(&ws).await?
        } else {
            ChromiumBrowser::launch(BrowserConfig { headless: false, user_agent: None }).await?
        }
    } else {
        ChromiumBrowser::launch(BrowserConfig { headless: false, user_agent: None }).await?
    };
    let llm = OpenAiCompatClient::new(LlmConfig::default())?;

    let agent = Agent::new(
        Arc::new(llm),
        Arc::new(browser),
        AgentConfig { max_steps: 40, ..Default::default() },
    );

    let report = agent.run(&task).await;

    match report.status {
        RunStatus::Completed => println!("completed: {}", report.result.unwrap_or_default()),
        RunStatus::Failed => println!("failed: {}", report.error.unwrap_or_default()),
        RunStatus::StepLimitExceeded => println!("step limit exceeded after {} steps", report.steps.len()),
    }
    println!("transcript:\n{}", serde_json::to_string_pretty(&report.history)?);

    Ok(())
}
