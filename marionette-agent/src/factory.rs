//! Window classification and worker construction.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;

use tracing::{debug, info};

use marionette_types::{Hwnd, InputDriver, Screenshotter, WindowProbe};

use crate::agent::{AgentCore, AppAgent, AppAgentConfig, AppType};
use crate::builtin::{BrowserAgent, DesktopAgent, IdeAgent};

/// OS window class name -> application kind.
const WINDOW_CLASS_MAP: [(&str, AppType); 11] = [
    ("Chrome_WidgetWin_1", AppType::Browser),
    ("MozillaWindowClass", AppType::Browser),
    ("IEFrame", AppType::Browser),
    ("ApplicationFrameWindow", AppType::Browser),
    ("SunAwtFrame", AppType::Ide),
    ("Notepad++", AppType::Ide),
    ("VSCodeMainWindow", AppType::Ide),
    ("OpusApp", AppType::Office),
    ("XLMAIN", AppType::Office),
    ("ConsoleWindowClass", AppType::Terminal),
    ("CASCADIA_HOSTING_WINDOW_CLASS", AppType::Terminal),
];

const BROWSER_KEYWORDS: [&str; 7] =
    ["chrome", "firefox", "edge", "safari", "opera", "brave", "vivaldi"];

const IDE_KEYWORDS: [&str; 8] = [
    "visual studio",
    "vscode",
    "pycharm",
    "intellij",
    "webstorm",
    "sublime",
    "atom",
    "notepad++",
];

const TERMINAL_KEYWORDS: [&str; 4] = ["terminal", "cmd", "powershell", "bash"];

/// Everything a worker constructor needs.
pub struct AgentSeed {
    /// The window to bind.
    pub hwnd: Hwnd,
    /// Worker tunables.
    pub config: AppAgentConfig,
    /// Window introspection handle.
    pub probe: Arc<dyn WindowProbe>,
    /// Input injection handle.
    pub input: Arc<dyn InputDriver>,
    /// Screenshot handle.
    pub screenshotter: Arc<dyn Screenshotter>,
}

impl AgentSeed {
    /// Build the shared core for a worker of the given kind.
    #[must_use]
    pub fn into_core(self, app_type: AppType) -> AgentCore {
        AgentCore::new(
            self.hwnd,
            app_type,
            self.config,
            self.probe,
            self.input,
            self.screenshotter,
        )
    }
}

/// A constructor for a custom worker kind. The signature is the
/// registration contract: anything callable here necessarily produces an
/// [`AppAgent`].
pub type AgentCtor = Arc<dyn Fn(AgentSeed) -> Arc<dyn AppAgent> + Send + Sync>;

/// Maps windows to workers.
///
/// Resolution order in [`create`](Self::create): instance cache, caller
/// hint, OS class name, title keywords, desktop fallback. Custom
/// registrations shadow the built-in kinds.
pub struct AgentFactory {
    probe: Arc<dyn WindowProbe>,
    input: Arc<dyn InputDriver>,
    screenshotter: Arc<dyn Screenshotter>,
    default_config: AppAgentConfig,
    custom: StdMutex<HashMap<String, AgentCtor>>,
    instances: StdMutex<HashMap<Hwnd, Arc<dyn AppAgent>>>,
}

impl AgentFactory {
    /// Create a factory over the given OS handles.
    #[must_use]
    pub fn new(
        probe: Arc<dyn WindowProbe>,
        input: Arc<dyn InputDriver>,
        screenshotter: Arc<dyn Screenshotter>,
        default_config: AppAgentConfig,
    ) -> Self {
        Self {
            probe,
            input,
            screenshotter,
            default_config,
            custom: StdMutex::new(HashMap::new()),
            instances: StdMutex::new(HashMap::new()),
        }
    }

    /// Get or build the worker for a window.
    ///
    /// `app_type` overrides detection when given (a built-in kind name or
    /// a custom registration key).
    pub async fn create(
        &self,
        hwnd: Hwnd,
        app_type: Option<&str>,
        config: Option<AppAgentConfig>,
    ) -> Arc<dyn AppAgent> {
        if let Some(cached) = self.get_cached(hwnd) {
            debug!(hwnd, "returning cached agent");
            return cached;
        }

        let kind = match app_type {
            Some(name) => name.to_string(),
            None => {
                let detected = self.detect_app_type(hwnd).await;
                info!(hwnd, app_type = %detected, "auto-detected app type");
                detected.as_str().to_string()
            }
        };

        let seed = AgentSeed {
            hwnd,
            config: config.unwrap_or_else(|| self.default_config.clone()),
            probe: Arc::clone(&self.probe),
            input: Arc::clone(&self.input),
            screenshotter: Arc::clone(&self.screenshotter),
        };

        let custom_ctor = self
            .custom
            .lock()
            .expect("custom agent map poisoned")
            .get(&kind)
            .cloned();

        let agent: Arc<dyn AppAgent> = if let Some(ctor) = custom_ctor {
            ctor(seed)
        } else {
            match kind.as_str() {
                "browser" => Arc::new(BrowserAgent::new(seed.into_core(AppType::Browser))),
                "ide" => Arc::new(IdeAgent::new(seed.into_core(AppType::Ide))),
                // Everything else drives raw mouse/keyboard.
                _ => Arc::new(DesktopAgent::new(seed.into_core(AppType::Desktop))),
            }
        };

        info!(hwnd, app_type = %kind, "created agent");
        self.instances
            .lock()
            .expect("instance cache poisoned")
            .insert(hwnd, Arc::clone(&agent));
        agent
    }

    /// Register a custom worker kind. Later `create` calls naming
    /// `app_type` use `ctor`.
    pub fn register(&self, app_type: impl Into<String>, ctor: AgentCtor) {
        let app_type = app_type.into();
        info!(%app_type, "registered custom agent");
        self.custom
            .lock()
            .expect("custom agent map poisoned")
            .insert(app_type, ctor);
    }

    /// Remove a custom worker kind.
    pub fn unregister(&self, app_type: &str) {
        self.custom
            .lock()
            .expect("custom agent map poisoned")
            .remove(app_type);
    }

    /// The cached worker for a window, if any.
    #[must_use]
    pub fn get_cached(&self, hwnd: Hwnd) -> Option<Arc<dyn AppAgent>> {
        self.instances
            .lock()
            .expect("instance cache poisoned")
            .get(&hwnd)
            .cloned()
    }

    /// Drop a stale cache entry (the host calls this when a window is
    /// lost).
    pub fn remove_cached(&self, hwnd: Hwnd) {
        self.instances
            .lock()
            .expect("instance cache poisoned")
            .remove(&hwnd);
    }

    /// Drop every cache entry.
    pub fn clear_cache(&self) {
        self.instances
            .lock()
            .expect("instance cache poisoned")
            .clear();
    }

    /// Built-in kind names plus custom registrations.
    #[must_use]
    pub fn supported_types(&self) -> Vec<String> {
        let mut types = vec!["browser".to_string(), "desktop".to_string(), "ide".to_string()];
        types.extend(
            self.custom
                .lock()
                .expect("custom agent map poisoned")
                .keys()
                .cloned(),
        );
        types
    }

    /// Classify a window: exact class name first, then title keywords,
    /// then desktop.
    pub async fn detect_app_type(&self, hwnd: Hwnd) -> AppType {
        if let Some(class_name) = self.probe.window_class(hwnd).await {
            if let Some((_, app_type)) = WINDOW_CLASS_MAP
                .iter()
                .find(|(class, _)| *class == class_name)
            {
                return *app_type;
            }
        }

        if let Some(title) = self.probe.window_title(hwnd).await {
            let title = title.to_lowercase();
            if BROWSER_KEYWORDS.iter().any(|kw| title.contains(kw)) {
                return AppType::Browser;
            }
            if IDE_KEYWORDS.iter().any(|kw| title.contains(kw)) {
                return AppType::Ide;
            }
            if TERMINAL_KEYWORDS.iter().any(|kw| title.contains(kw)) {
                return AppType::Terminal;
            }
        }

        AppType::Desktop
    }
}
