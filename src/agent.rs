use async_trait::async_trait;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::action::{Action, ActionResult};
use crate::browser::BrowserDriver;
use crate::history::{History, Message};
use crate::llm::LanguageModel;
use crate::parser::parse_action;
use crate::tools::{catalogue, Dispatcher};

// ========================= Run Outcome =========================

/// Terminal state of a run. Every run ends in exactly one of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Completed,
    Failed,
    StepLimitExceeded,
}

/// One loop iteration: the action the model asked for (if it produced one)
/// and what came of it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: usize,
    pub action: Option<Action>,
    pub result: ActionResult,
}

/// What the caller gets back: terminal state, final text or error, and the
/// full transcript for audit or replay.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub task: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub steps: Vec<StepRecord>,
    pub history: History,
}

// ========================= Control Seams =========================

/// Cooperative cancellation, observed at step boundaries only; a step
/// already in flight always finishes.
#[derive(Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Optional sink for per-step records; the seam a GUI or log stream
/// attaches to.
#[async_trait]
pub trait StepObserver: Send + Sync {
    async fn on_step(&self, record: &StepRecord);
}

// ========================= Agent =========================

#[derive(Clone)]
pub struct AgentConfig {
    pub max_steps: usize,
    pub run_timeout: Option<Duration>,
    pub history_window: Option<usize>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self { max_steps: 100, run_timeout: None, history_window: None }
    }
}

pub struct Agent {
    llm: Arc<dyn LanguageModel>,
    dispatcher: Dispatcher,
    cfg: AgentConfig,
    cancel: CancelHandle,
    observer: Option<Arc<dyn StepObserver>>,
}

impl Agent {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        driver: Arc<dyn BrowserDriver>,
        cfg: AgentConfig,
    ) -> Self {
        Self {
            llm,
            dispatcher: Dispatcher::new(driver),
            cfg,
            cancel: CancelHandle::new(),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn StepObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Handle for requesting cancellation from outside the run.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Drive the task to one of the terminal states.
    ///
    /// Always returns a report; model-client failures end up in it as
    /// `RunStatus::Failed` rather than bubbling out.
    pub async fn run(&self, task: &str) -> RunReport {
        let run_id = nanoid!();
        let started = Instant::now();
        let system_prompt = build_system_prompt();
        let mut history = match self.cfg.history_window {
            Some(n) => History::with_window(n),
            None => History::new(),
        };
        let mut steps: Vec<StepRecord> = Vec::new();
        let mut step = 0usize;

        info!(run_id = %run_id, max_steps = self.cfg.max_steps, "run started");

        while step < self.cfg.max_steps {
            if self.cancel.is_cancelled() {
                let reason = format!("run cancelled before step {}", step + 1);
                return finish(run_id, task, RunStatus::Failed, None, Some(reason), steps, history);
            }
            if let Some(limit) = self.cfg.run_timeout {
                if started.elapsed() >= limit {
                    let reason = format!("run timed out after {}s", limit.as_secs());
                    return finish(run_id, task, RunStatus::Failed, None, Some(reason), steps, history);
                }
            }

            step += 1;
            info!(run_id = %run_id, step, "agent step");

            let prompt = history.build_prompt(&system_prompt, task);
            let raw = match self.llm.chat(&prompt).await {
                Ok(text) => text,
                Err(e) => {
                    // Transport and auth failures are fatal; retry policy,
                    // if any, lives behind the model client.
                    warn!(run_id = %run_id, step, error = %e, "model call failed");
                    return finish(
                        run_id,
                        task,
                        RunStatus::Failed,
                        None,
                        Some(e.to_string()),
                        steps,
                        history,
                    );
                }
            };
            history.push(Message::assistant(raw.clone()));

            let record = match parse_action(&raw) {
                Err(e) => {
                    warn!(run_id = %run_id, step, error = %e, "unparsable model response");
                    history.push(Message::tool(format!(
                        "{e}\nReply with exactly one JSON object: {{\"action\": \"<tool name>\", \"params\": {{...}}}}"
                    )));
                    StepRecord { step, action: None, result: ActionResult::err(e.to_string()) }
                }
                Ok(action) => {
                    info!(run_id = %run_id, step, tool = action.name(), "dispatching action");
                    let result = self.dispatcher.dispatch(&action).await;
                    history.push(Message::tool(self.feedback(&result, step).await));
                    StepRecord { step, action: Some(action), result }
                }
            };

            if let Some(observer) = &self.observer {
                observer.on_step(&record).await;
            }

            let finished = record.result.is_done;
            let final_result = record.result.content.clone();
            steps.push(record);

            if finished {
                return finish(run_id, task, RunStatus::Completed, final_result, None, steps, history);
            }
        }

        finish(
            run_id,
            task,
            RunStatus::StepLimitExceeded,
            None,
            Some(format!("no final answer within {} steps", self.cfg.max_steps)),
            steps,
            history,
        )
    }

    /// Tool feedback the model sees on its next turn.
    async fn feedback(&self, result: &ActionResult, step: usize) -> String {
        if result.is_done {
            return format!("Task completed: {}", result.content.as_deref().unwrap_or_default());
        }
        if !result.success {
            return format!(
                "Action failed: {}\nTry a different approach.",
                result.error.as_deref().unwrap_or("unknown error")
            );
        }

        let driver = self.dispatcher.driver();
        let title = driver.title().await.unwrap_or_default();
        let url = driver.url().await.unwrap_or_default();
        let mut feedback = format!(
            "Action succeeded: {}\nCurrent page: {title} ({url})",
            result.content.as_deref().unwrap_or_default()
        );
        if step % 10 == 0 {
            feedback.push_str(&format!(
                "\n\n{step} steps taken so far; check that the task is still on track before continuing."
            ));
        }
        feedback
    }
}

fn finish(
    run_id: String,
    task: &str,
    status: RunStatus,
    result: Option<String>,
    error: Option<String>,
    steps: Vec<StepRecord>,
    history: History,
) -> RunReport {
    info!(run_id = %run_id, status = ?status, steps = steps.len(), "run finished");
    RunReport { run_id, task: task.to_string(), status, result, error, steps, history }
}

fn build_system_prompt() -> String {
    format!(
        "You are a browser automation agent. You complete tasks by driving a real browser \
through the tools below, one action per turn.\n\n{}\n\nRules:\n\
1. Every reply must contain exactly one JSON action object.\n\
2. The browser starts on about:blank; navigate to a website first.\n\
3. If an action fails, try a different selector or approach instead of repeating it.\n\
4. Prefer the selectors reported by get_elements.\n\
5. Call done(result) only when every goal of the task is achieved; result must carry a \
full summary of the outcome.\n\
6. A single successful step does not mean the task is finished.",
        catalogue()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ScrollDirection;
    use crate::browser::{BrowserError, ElementInfo};
    use crate::history::Role;
    use crate::llm::LlmError;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    enum Turn {
        Reply(&'static str),
        Fail,
    }

    /// Model stub that plays back a fixed script of turns.
    struct ScriptedModel {
        turns: Mutex<VecDeque<Turn>>,
    }

    impl ScriptedModel {
        fn new(turns: Vec<Turn>) -> Arc<Self> {
            Arc::new(Self { turns: Mutex::new(turns.into()) })
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn chat(&self, _messages: &[Message]) -> Result<String, LlmError> {
            match self.turns.lock().unwrap().pop_front() {
                Some(Turn::Reply(text)) => Ok(text.to_string()),
                Some(Turn::Fail) => {
                    Err(LlmError::Api { status: 500, message: "upstream unavailable".into() })
                }
                None => panic!("model called more times than scripted"),
            }
        }
    }

    #[derive(Default)]
    struct StubDriver {
        fail_clicks: bool,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BrowserDriver for StubDriver {
        async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
            self.calls.lock().unwrap().push(format!("navigate {url}"));
            Ok(())
        }
        async fn url(&self) -> Result<String, BrowserError> {
            Ok("https://example.com/page".into())
        }
        async fn title(&self) -> Result<String, BrowserError> {
            Ok("Example".into())
        }
        async fn click(&self, selector: &str) -> Result<(), BrowserError> {
            self.calls.lock().unwrap().push(format!("click {selector}"));
            if self.fail_clicks {
                return Err(BrowserError::ElementNotFound(selector.to_string()));
            }
            Ok(())
        }
        async fn fill(&self, _selector: &str, _text: &str) -> Result<(), BrowserError> {
            Ok(())
        }
        async fn press_key(&self, _key: &str) -> Result<(), BrowserError> {
            Ok(())
        }
        async fn scroll(&self, _d: ScrollDirection, _a: i64) -> Result<(), BrowserError> {
            Ok(())
        }
        async fn go_back(&self) -> Result<(), BrowserError> {
            Ok(())
        }
        async fn reload(&self) -> Result<(), BrowserError> {
            Ok(())
        }
        async fn page_text(&self) -> Result<String, BrowserError> {
            Ok("nothing to see".into())
        }
        async fn get_elements_info(&self) -> Result<Vec<ElementInfo>, BrowserError> {
            Ok(vec![])
        }
        async fn screenshot_b64(&self) -> Result<String, BrowserError> {
            Ok(String::new())
        }
    }

    fn agent(model: Arc<ScriptedModel>, max_steps: usize) -> Agent {
        Agent::new(
            model,
            Arc::new(StubDriver::default()),
            AgentConfig { max_steps, ..Default::default() },
        )
    }

    fn tool_entries(report: &RunReport) -> Vec<&str> {
        report
            .history
            .messages()
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.content.as_str())
            .collect()
    }

    const NAVIGATE: &str = r#"{"action": "navigate", "params": {"url": "https://example.com"}}"#;
    const CLICK: &str = r##"{"action": "click", "params": {"selector": "#next"}}"##;
    const DONE: &str = r#"{"action": "done", "params": {"result": "finished"}}"#;
    const GET_TEXT: &str = r#"{"action": "get_text"}"#;

    #[tokio::test]
    async fn completes_on_done_with_tool_entries_in_order() {
        let model = ScriptedModel::new(vec![
            Turn::Reply(NAVIGATE),
            Turn::Reply(CLICK),
            Turn::Reply(DONE),
        ]);
        let report = agent(model, 3).run("buy a CPU").await;

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.result.as_deref(), Some("finished"));
        assert_eq!(report.steps.len(), 3);
        let names: Vec<_> = report
            .steps
            .iter()
            .map(|s| s.action.as_ref().unwrap().name())
            .collect();
        assert_eq!(names, ["navigate", "click", "done"]);

        let tools = tool_entries(&report);
        assert_eq!(tools.len(), 3);
        assert!(tools[0].contains("Navigated to https://example.com"));
        assert!(tools[1].contains("Clicked element"));
        assert!(tools[2].contains("finished"));
    }

    #[tokio::test]
    async fn parse_failure_is_recovered_and_counted() {
        let model = ScriptedModel::new(vec![
            Turn::Reply("Let me think about the page layout for a moment."),
            Turn::Reply(DONE),
        ]);
        let report = agent(model, 5).run("task").await;

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.steps.len(), 2);
        assert!(report.steps[0].action.is_none());
        assert!(!report.steps[0].result.success);
        let tools = tool_entries(&report);
        assert!(tools[0].contains("no action object"));
        assert!(tools[0].contains("Reply with exactly one JSON object"));
    }

    #[tokio::test]
    async fn step_limit_is_a_distinct_terminal_state() {
        let model = ScriptedModel::new(vec![Turn::Reply(NAVIGATE), Turn::Reply(CLICK)]);
        let report = agent(model, 2).run("task").await;

        assert_eq!(report.status, RunStatus::StepLimitExceeded);
        assert!(report.result.is_none());
        assert!(report.error.unwrap().contains("2 steps"));
        assert_eq!(report.steps.len(), 2);
    }

    #[tokio::test]
    async fn step_counter_never_exceeds_max_steps() {
        let model = ScriptedModel::new(vec![
            Turn::Reply(GET_TEXT),
            Turn::Reply(GET_TEXT),
            Turn::Reply(GET_TEXT),
            Turn::Reply(GET_TEXT),
        ]);
        let report = agent(model, 4).run("task").await;
        assert_eq!(report.steps.len(), 4);
        let indices: Vec<_> = report.steps.iter().map(|s| s.step).collect();
        assert_eq!(indices, [1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn model_failure_is_fatal() {
        let model = ScriptedModel::new(vec![Turn::Fail]);
        let report = agent(model, 5).run("task").await;

        assert_eq!(report.status, RunStatus::Failed);
        assert!(report.error.unwrap().contains("500"));
        assert!(report.steps.is_empty());
    }

    #[tokio::test]
    async fn failing_tool_does_not_end_the_run() {
        let model = ScriptedModel::new(vec![Turn::Reply(CLICK), Turn::Reply(DONE)]);
        let driver = Arc::new(StubDriver { fail_clicks: true, ..Default::default() });
        let agent = Agent::new(
            model,
            driver,
            AgentConfig { max_steps: 5, ..Default::default() },
        );
        let report = agent.run("task").await;

        assert_eq!(report.status, RunStatus::Completed);
        assert!(!report.steps[0].result.success);
        assert!(tool_entries(&report)[0].contains("Try a different approach"));
    }

    struct CancelAfterFirstStep {
        handle: CancelHandle,
    }

    #[async_trait]
    impl StepObserver for CancelAfterFirstStep {
        async fn on_step(&self, _record: &StepRecord) {
            self.handle.cancel();
        }
    }

    #[tokio::test]
    async fn cancellation_takes_effect_between_steps() {
        let model = ScriptedModel::new(vec![Turn::Reply(NAVIGATE), Turn::Reply(DONE)]);
        let agent = agent(model, 5);
        let observer = Arc::new(CancelAfterFirstStep { handle: agent.cancel_handle() });
        let report = agent.with_observer(observer).run("task").await;

        assert_eq!(report.status, RunStatus::Failed);
        assert!(report.error.unwrap().contains("cancelled before step 2"));
        // Step 2 never started: one step recorded, one model call consumed.
        assert_eq!(report.steps.len(), 1);
    }

    #[tokio::test]
    async fn done_wins_regardless_of_step_count() {
        let model = ScriptedModel::new(vec![Turn::Reply(DONE)]);
        let report = agent(model, 1).run("task").await;
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.result.as_deref(), Some("finished"));
    }

    #[tokio::test]
    async fn report_round_trips_through_serde() {
        let model = ScriptedModel::new(vec![Turn::Reply(NAVIGATE), Turn::Reply(DONE)]);
        let report = agent(model, 5).run("task").await;

        let json = serde_json::to_string(&report).unwrap();
        let back: RunReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, RunStatus::Completed);
        assert_eq!(back.steps.len(), report.steps.len());
        assert_eq!(back.history.len(), report.history.len());
    }

    #[tokio::test]
    async fn observer_sees_every_step() {
        struct Counter(Mutex<usize>);

        #[async_trait]
        impl StepObserver for Counter {
            async fn on_step(&self, _record: &StepRecord) {
                *self.0.lock().unwrap() += 1;
            }
        }

        let model = ScriptedModel::new(vec![Turn::Reply(NAVIGATE), Turn::Reply(DONE)]);
        let counter = Arc::new(Counter(Mutex::new(0)));
        let report = agent(model, 5).with_observer(counter.clone()).run("task").await;

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(*counter.0.lock().unwrap(), 2);
    }
}
