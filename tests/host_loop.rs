//! End-to-end tests of the supervisor loop against mock collaborators.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;

use marionette_agent::{AgentFactory, AppAgentConfig};
use marionette_concurrency::ConcurrencyManager;
use marionette_host::{AgentConfig, HostAgent, HostAgentState};
use marionette_types::{
    AgentError, AgentEvent, Checkpoint, EventBus, EventType, Hwnd, LlmClient, LlmResponse,
    Message, MouseButton, ScrollDirection, StopReason, TaskStatus, TaskStore, ToolCall,
    ToolDefinition, WindowBounds, WindowProbe,
};
use marionette_validate::ToolCallValidator;

// --- mock collaborators ---

/// Returns pre-configured responses in sequence, repeating the last one
/// when the script runs out.
struct MockLlm {
    responses: StdMutex<VecDeque<LlmResponse>>,
    last: StdMutex<Option<LlmResponse>>,
}

impl MockLlm {
    fn new(responses: Vec<LlmResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: StdMutex::new(responses.into()),
            last: StdMutex::new(None),
        })
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn call(
        &self,
        _messages: &[Message],
        _tools: &[ToolDefinition],
    ) -> Result<LlmResponse, AgentError> {
        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(response) => {
                *self.last.lock().unwrap() = Some(response.clone());
                Ok(response)
            }
            None => self
                .last
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| AgentError::ResponseParse("script exhausted".into())),
        }
    }
}

#[derive(Default)]
struct MemoryStore {
    statuses: StdMutex<HashMap<String, TaskStatus>>,
    checkpoints: StdMutex<HashMap<String, Checkpoint>>,
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn create_task(
        &self,
        task_id: &str,
        _text: &str,
        _target_hwnds: &[Hwnd],
    ) -> Result<(), AgentError> {
        self.statuses
            .lock()
            .unwrap()
            .insert(task_id.into(), TaskStatus::Pending);
        Ok(())
    }

    async fn get_status(&self, task_id: &str) -> Result<TaskStatus, AgentError> {
        self.statuses
            .lock()
            .unwrap()
            .get(task_id)
            .copied()
            .ok_or_else(|| AgentError::TaskNotFound(task_id.into()))
    }

    async fn set_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        _reason: Option<&str>,
    ) -> Result<(), AgentError> {
        self.statuses.lock().unwrap().insert(task_id.into(), status);
        Ok(())
    }

    async fn save_checkpoint(
        &self,
        task_id: &str,
        iteration: u32,
        state: serde_json::Value,
    ) -> Result<(), AgentError> {
        self.checkpoints
            .lock()
            .unwrap()
            .insert(task_id.into(), Checkpoint { iteration, state });
        Ok(())
    }

    async fn load_checkpoint(&self, task_id: &str) -> Result<Option<Checkpoint>, AgentError> {
        Ok(self.checkpoints.lock().unwrap().get(task_id).cloned())
    }
}

#[derive(Default)]
struct RecordingBus {
    events: StdMutex<Vec<AgentEvent>>,
}

impl RecordingBus {
    fn events(&self) -> Vec<AgentEvent> {
        self.events.lock().unwrap().clone()
    }

    fn of_type(&self, event_type: EventType) -> Vec<AgentEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }
}

#[async_trait]
impl EventBus for RecordingBus {
    async fn publish(&self, event: AgentEvent) {
        self.events.lock().unwrap().push(event);
    }
}

struct FakeOs {
    window_exists: StdMutex<bool>,
    actions: StdMutex<Vec<String>>,
}

impl FakeOs {
    fn new(window_exists: bool) -> Arc<Self> {
        Arc::new(Self {
            window_exists: StdMutex::new(window_exists),
            actions: StdMutex::new(Vec::new()),
        })
    }

    fn set_window_exists(&self, exists: bool) {
        *self.window_exists.lock().unwrap() = exists;
    }

    fn actions(&self) -> Vec<String> {
        self.actions.lock().unwrap().clone()
    }
}

#[async_trait]
impl WindowProbe for FakeOs {
    async fn exists(&self, _hwnd: Hwnd) -> bool {
        *self.window_exists.lock().unwrap()
    }
    async fn window_class(&self, _hwnd: Hwnd) -> Option<String> {
        Some("Chrome_WidgetWin_1".into())
    }
    async fn window_title(&self, _hwnd: Hwnd) -> Option<String> {
        Some("Example - Chrome".into())
    }
    async fn window_bounds(&self, _hwnd: Hwnd) -> Option<WindowBounds> {
        Some(WindowBounds { x: 0, y: 0, width: 800, height: 600 })
    }
}

#[async_trait]
impl marionette_types::InputDriver for FakeOs {
    async fn click(
        &self,
        _hwnd: Hwnd,
        x: i64,
        y: i64,
        _button: MouseButton,
        _clicks: u32,
    ) -> Result<(), AgentError> {
        self.actions.lock().unwrap().push(format!("click {x},{y}"));
        Ok(())
    }
    async fn type_text(&self, _hwnd: Hwnd, text: &str) -> Result<(), AgentError> {
        self.actions.lock().unwrap().push(format!("type {text}"));
        Ok(())
    }
    async fn key(&self, _hwnd: Hwnd, combo: &str) -> Result<(), AgentError> {
        self.actions.lock().unwrap().push(format!("key {combo}"));
        Ok(())
    }
    async fn focus(&self, _hwnd: Hwnd) -> Result<(), AgentError> {
        self.actions.lock().unwrap().push("focus".into());
        Ok(())
    }
    async fn navigate(&self, _hwnd: Hwnd, url: &str) -> Result<(), AgentError> {
        self.actions.lock().unwrap().push(format!("navigate {url}"));
        Ok(())
    }
    async fn scroll(
        &self,
        _hwnd: Hwnd,
        _direction: ScrollDirection,
        amount: i64,
    ) -> Result<(), AgentError> {
        self.actions.lock().unwrap().push(format!("scroll {amount}"));
        Ok(())
    }
    async fn open_file(&self, _hwnd: Hwnd, path: &str) -> Result<(), AgentError> {
        self.actions.lock().unwrap().push(format!("open {path}"));
        Ok(())
    }
    async fn goto_line(&self, _hwnd: Hwnd, line: u64) -> Result<(), AgentError> {
        self.actions.lock().unwrap().push(format!("goto {line}"));
        Ok(())
    }
    async fn run_command(&self, _hwnd: Hwnd, command: &str) -> Result<(), AgentError> {
        self.actions.lock().unwrap().push(format!("run {command}"));
        Ok(())
    }
}

#[async_trait]
impl marionette_types::Screenshotter for FakeOs {
    async fn capture(&self, _hwnd: Hwnd) -> Result<Vec<u8>, AgentError> {
        Ok(vec![1, 2, 3])
    }
}

// --- helpers ---

fn tool_use(calls: Vec<ToolCall>) -> LlmResponse {
    LlmResponse {
        content: None,
        stop_reason: StopReason::ToolUse,
        tool_calls: calls,
        input_tokens: 10,
        output_tokens: 5,
    }
}

fn set_status_call(status: &str, description: &str) -> LlmResponse {
    tool_use(vec![ToolCall::new(
        "status-call",
        "set_task_status",
        serde_json::json!({"status": status, "description": description}),
    )])
}

fn fast_config() -> AgentConfig {
    AgentConfig {
        max_iterations: 5,
        screenshot_delay: Duration::from_millis(1),
        task_timeout: Duration::from_secs(30),
        ..AgentConfig::default()
    }
}

struct Harness {
    os: Arc<FakeOs>,
    store: Arc<MemoryStore>,
    bus: Arc<RecordingBus>,
    concurrency: Arc<ConcurrencyManager>,
    host: HostAgent,
}

fn harness(config: AgentConfig, llm: Arc<MockLlm>, window_exists: bool) -> Harness {
    let os = FakeOs::new(window_exists);
    let store = Arc::new(MemoryStore::default());
    let bus = Arc::new(RecordingBus::default());
    let concurrency = Arc::new(ConcurrencyManager::new(config.to_concurrency_config()));
    let factory = Arc::new(AgentFactory::new(
        os.clone(),
        os.clone(),
        os.clone(),
        AppAgentConfig {
            verify_after_action: false,
            screenshot_delay: Duration::from_millis(1),
            ..AppAgentConfig::default()
        },
    ));
    let host = HostAgent::new(
        config,
        llm,
        store.clone(),
        bus.clone(),
        os.clone(),
        factory,
        concurrency.clone(),
    );
    Harness {
        os,
        store,
        bus,
        concurrency,
        host,
    }
}

// --- scenarios ---

#[tokio::test]
async fn successful_completion_in_two_iterations() {
    let llm = MockLlm::new(vec![
        tool_use(vec![ToolCall::new(
            "c1",
            "app_agent_12345",
            serde_json::json!({"task": "focus"}),
        )]),
        set_status_call("completed", "done"),
    ]);
    let mut h = harness(fast_config(), llm, true);

    h.host.register_window(12345, Some("browser")).await;
    let outcome = h.host.process_task("t1", "focus the window", &[12345]).await.unwrap();

    assert_eq!(outcome.status, TaskStatus::Completed);
    assert_eq!(outcome.iterations, 2);
    assert_eq!(h.store.get_status("t1").await.unwrap(), TaskStatus::Completed);
    assert_eq!(h.bus.of_type(EventType::TaskCompleted).len(), 1);
    assert_eq!(h.bus.of_type(EventType::TaskStarted).len(), 1);
    assert!(!h.host.is_processing());
    assert_eq!(h.host.state(), HostAgentState::Completed);

    // Resources are released.
    assert_eq!(h.concurrency.active_task_count(), 0);
    assert!(!h.concurrency.is_window_locked(12345));
}

#[tokio::test]
async fn tool_events_pair_in_order() {
    let llm = MockLlm::new(vec![
        tool_use(vec![
            ToolCall::new("c1", "app_agent_7", serde_json::json!({"task": "one"})),
            ToolCall::new("c2", "app_agent_7", serde_json::json!({"task": "two"})),
        ]),
        set_status_call("completed", "done"),
    ]);
    let mut h = harness(fast_config(), llm, true);
    h.host.register_window(7, Some("desktop")).await;
    h.host.process_task("t1", "do both", &[7]).await.unwrap();

    let names: Vec<EventType> = h
        .bus
        .events()
        .iter()
        .map(|e| e.event_type)
        .filter(|t| matches!(t, EventType::ToolStart | EventType::ToolEnd))
        .collect();
    // Three tool calls total (two worker calls + set_task_status), each
    // start strictly before its end.
    assert_eq!(
        names,
        vec![
            EventType::ToolStart,
            EventType::ToolEnd,
            EventType::ToolStart,
            EventType::ToolEnd,
            EventType::ToolStart,
            EventType::ToolEnd,
        ]
    );
}

#[tokio::test]
async fn needs_help_parks_the_host() {
    let llm = MockLlm::new(vec![set_status_call("needs_help", "captcha")]);
    let mut h = harness(fast_config(), llm, true);

    let outcome = h.host.process_task("t1", "solve it", &[]).await.unwrap();

    assert_eq!(outcome.status, TaskStatus::NeedsHelp);
    assert_eq!(h.host.state(), HostAgentState::WaitingConfirm);
    assert!(!h.host.is_processing());
}

#[tokio::test]
async fn consecutive_failures_fail_the_task() {
    // Every iteration issues one unknown tool; validation fails it closed.
    let llm = MockLlm::new(vec![tool_use(vec![ToolCall::new(
        "c1",
        "bogus_tool",
        serde_json::json!({}),
    )])]);
    let config = AgentConfig {
        max_consecutive_failures: 3,
        ..fast_config()
    };
    let mut h = harness(config, llm, true);

    let outcome = h.host.process_task("t1", "try", &[]).await.unwrap();

    assert_eq!(outcome.status, TaskStatus::Failed);
    assert_eq!(outcome.iterations, 3);
    assert_eq!(h.bus.of_type(EventType::TaskFailed).len(), 1);
}

#[tokio::test]
async fn window_lost_triggers_emergency_stop() {
    let llm = MockLlm::new(vec![tool_use(vec![ToolCall::new(
        "c1",
        "app_agent_12345",
        serde_json::json!({"task": "focus"}),
    )])]);
    let mut h = harness(fast_config(), llm, false);
    h.host.register_window(12345, Some("browser")).await;

    let outcome = h.host.process_task("t1", "focus", &[12345]).await.unwrap();

    assert_eq!(outcome.status, TaskStatus::Interrupted);
    let failures = h.bus.of_type(EventType::TaskFailed);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].payload["type"], "emergency_stop");
    assert!(
        h.store.load_checkpoint("t1").await.unwrap().is_some(),
        "emergency stop must save a checkpoint"
    );
    assert_eq!(h.host.state(), HostAgentState::Error);
}

#[tokio::test]
async fn task_slot_exhaustion_rejects_before_any_transition() {
    let llm = MockLlm::new(vec![set_status_call("completed", "done")]);
    let config = AgentConfig {
        max_concurrent_tasks: 2,
        ..fast_config()
    };
    let mut h = harness(config, llm, true);

    // Two tasks already hold slots.
    assert!(h.concurrency.acquire_task_slot("t1", HashSet::new()));
    assert!(h.concurrency.acquire_task_slot("t2", HashSet::new()));

    let error = h.host.process_task("t3", "work", &[]).await.unwrap_err();
    match error {
        AgentError::TooManyTasks { current, max } => {
            assert_eq!((current, max), (2, 2));
        }
        other => panic!("expected TooManyTasks, got {other:?}"),
    }
    // No task record was created for t3.
    assert!(h.store.get_status("t3").await.is_err());
    assert!(h.bus.events().is_empty());
}

#[tokio::test]
async fn locked_window_rejects_and_releases_the_slot() {
    let llm = MockLlm::new(vec![set_status_call("completed", "done")]);
    let os = FakeOs::new(true);
    let store = Arc::new(MemoryStore::default());
    let bus = Arc::new(RecordingBus::default());
    let concurrency = Arc::new(ConcurrencyManager::new(
        marionette_concurrency::ConcurrencyConfig {
            batch_window_timeout: Duration::from_millis(50),
            ..marionette_concurrency::ConcurrencyConfig::default()
        },
    ));
    let factory = Arc::new(AgentFactory::new(
        os.clone(),
        os.clone(),
        os.clone(),
        AppAgentConfig::default(),
    ));
    let mut host = HostAgent::new(
        fast_config(),
        llm,
        store,
        bus,
        os,
        factory,
        concurrency.clone(),
    );

    assert!(concurrency.acquire_window(500, "other-task", None).await);

    let error = host.process_task("t1", "work", &[500]).await.unwrap_err();
    assert!(matches!(error, AgentError::WindowLocked { hwnd: 500, .. }));
    assert_eq!(concurrency.active_task_count(), 0, "slot must be rolled back");
    assert_eq!(concurrency.get_window_owner(500).as_deref(), Some("other-task"));
}

#[tokio::test]
async fn invalid_tool_call_is_surfaced_not_executed() {
    // Missing the required `task` argument.
    let llm = MockLlm::new(vec![
        tool_use(vec![ToolCall::new("c1", "app_agent_9", serde_json::json!({}))]),
        set_status_call("completed", "done"),
    ]);
    let mut h = harness(fast_config(), llm, true);
    h.host.register_window(9, Some("desktop")).await;

    let outcome = h.host.process_task("t1", "work", &[9]).await.unwrap();
    assert_eq!(outcome.status, TaskStatus::Completed);

    // The worker never ran; the model saw a validation failure instead.
    assert!(h.os.actions().is_empty());
    let ends = h.bus.of_type(EventType::ToolEnd);
    let validation_failures: Vec<_> = ends
        .iter()
        .filter(|e| {
            e.payload["result"]["error"]
                .as_str()
                .is_some_and(|msg| msg.starts_with("Validation failed"))
        })
        .collect();
    assert_eq!(validation_failures.len(), 1);
}

#[tokio::test]
async fn coordinate_bounds_checked_against_worker_schema() {
    let os = FakeOs::new(true);
    let factory = AgentFactory::new(
        os.clone(),
        os.clone(),
        os.clone(),
        AppAgentConfig::default(),
    );
    let agent = factory.create(1, Some("browser"), None).await;

    let registered: HashMap<String, ToolDefinition> = agent
        .tool_definitions()
        .into_iter()
        .map(|d| (d.name.clone(), d))
        .collect();
    let validator = ToolCallValidator::new(registered, HashSet::new());
    let bounds = WindowBounds { x: 0, y: 0, width: 800, height: 600 };

    let call = ToolCall::new("c1", "click", serde_json::json!({"x": 900, "y": 10}));
    let result = validator.validate(&call, Some(&bounds));
    assert!(!result.valid);
    assert_eq!(result.errors[0].field, "x");
}

#[tokio::test]
async fn sensitive_tool_waits_for_denial() {
    let llm = MockLlm::new(vec![
        tool_use(vec![ToolCall::new(
            "c1",
            "app_agent_42",
            serde_json::json!({"task": "wipe everything"}),
        )]),
        set_status_call("completed", "done"),
    ]);
    let mut config = fast_config();
    config.sensitive_tools.insert("app_agent_42".into());
    let mut h = harness(config, llm, true);
    h.host.register_window(42, Some("desktop")).await;

    // Deny the confirmation as soon as it is requested.
    let control = h.host.control();
    let bus = h.bus.clone();
    let responder = tokio::spawn(async move {
        loop {
            let pending = bus.of_type(EventType::UserConfirmRequired);
            if let Some(event) = pending.first() {
                let action_id = event.payload["action_id"].as_str().unwrap().to_string();
                assert!(control.resolve_confirmation(&action_id, false));
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });

    let outcome = h.host.process_task("t1", "dangerous", &[42]).await.unwrap();
    responder.await.unwrap();

    assert_eq!(outcome.status, TaskStatus::Completed);
    assert_eq!(h.bus.of_type(EventType::UserConfirmRequired).len(), 1);
    // Denied: the worker never executed.
    assert!(h.os.actions().is_empty());
    let denied = h
        .bus
        .of_type(EventType::ToolEnd)
        .iter()
        .any(|e| e.payload["result"]["error"] == "User denied the operation");
    assert!(denied);
}

#[tokio::test]
async fn cancel_takes_effect_at_the_iteration_boundary() {
    // The model keeps asking for work; only the cancel stops the loop.
    let llm = MockLlm::new(vec![tool_use(vec![ToolCall::new(
        "c1",
        "app_agent_3",
        serde_json::json!({"task": "loop"}),
    )])]);
    let config = AgentConfig {
        max_iterations: 50,
        screenshot_delay: Duration::from_millis(5),
        ..fast_config()
    };
    let mut h = harness(config, llm, true);
    h.host.register_window(3, Some("desktop")).await;

    // Cancel as soon as the task is visibly started.
    let control = h.host.control();
    let bus = h.bus.clone();
    let canceller = tokio::spawn(async move {
        loop {
            if !bus.of_type(EventType::TaskStarted).is_empty() {
                control.cancel();
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });

    let outcome = h.host.process_task("t1", "work", &[3]).await.unwrap();
    canceller.await.unwrap();

    assert_eq!(outcome.status, TaskStatus::Cancelled);
    assert!(!h.host.is_processing());
}

#[tokio::test]
async fn resume_continues_from_the_checkpoint() {
    let llm = MockLlm::new(vec![
        tool_use(vec![ToolCall::new(
            "c1",
            "app_agent_12345",
            serde_json::json!({"task": "focus"}),
        )]),
        set_status_call("completed", "finished after resume"),
    ]);
    let mut h = harness(fast_config(), llm, false);
    h.host.register_window(12345, Some("browser")).await;

    // First run dies with the window.
    let outcome = h.host.process_task("t1", "focus", &[12345]).await.unwrap();
    assert_eq!(outcome.status, TaskStatus::Interrupted);
    let checkpoint = h.store.load_checkpoint("t1").await.unwrap().unwrap();
    assert_eq!(checkpoint.state["app_agents"], serde_json::json!([12345]));

    // The window comes back; resume picks up the script's next response.
    h.os.set_window_exists(true);
    let outcome = h.host.resume("t1").await.unwrap();
    assert_eq!(outcome.status, TaskStatus::Completed);
    assert!(outcome.iterations > checkpoint.iteration);
}

#[tokio::test]
async fn resume_without_checkpoint_is_an_error() {
    let llm = MockLlm::new(vec![]);
    let mut h = harness(fast_config(), llm, true);
    let error = h.host.resume("ghost").await.unwrap_err();
    assert!(matches!(error, AgentError::Checkpoint(_)));
}

#[tokio::test]
async fn two_hosts_share_one_concurrency_manager() {
    let config = AgentConfig {
        max_concurrent_tasks: 1,
        ..fast_config()
    };
    let llm_a = MockLlm::new(vec![set_status_call("completed", "a done")]);
    let mut a = harness(config.clone(), llm_a, true);

    // Second host shares the first one's manager.
    let llm_b = MockLlm::new(vec![set_status_call("completed", "b done")]);
    let os = FakeOs::new(true);
    let store = Arc::new(MemoryStore::default());
    let bus = Arc::new(RecordingBus::default());
    let factory = Arc::new(AgentFactory::new(
        os.clone(),
        os.clone(),
        os.clone(),
        AppAgentConfig::default(),
    ));
    let mut b = HostAgent::new(
        config,
        llm_b,
        store,
        bus,
        os,
        factory,
        a.concurrency.clone(),
    );

    // While a slot is parked on a phantom task, both hosts are rejected.
    assert!(a.concurrency.acquire_task_slot("parked", HashSet::new()));
    assert!(matches!(
        a.host.process_task("a1", "x", &[]).await.unwrap_err(),
        AgentError::TooManyTasks { .. }
    ));
    assert!(matches!(
        b.process_task("b1", "y", &[]).await.unwrap_err(),
        AgentError::TooManyTasks { .. }
    ));

    a.concurrency.release_task_slot("parked");
    assert_eq!(
        a.host.process_task("a1", "x", &[]).await.unwrap().status,
        TaskStatus::Completed
    );
    assert_eq!(
        b.process_task("b1", "y", &[]).await.unwrap().status,
        TaskStatus::Completed
    );
}
