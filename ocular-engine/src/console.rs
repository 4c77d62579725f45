use anyhow::Result;
use async_trait::async_trait;
use image::DynamicImage;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::warn;

/// Input/output surface of one console. Implementations wrap the actual
/// transport (VNC framebuffer, serial terminal, ...).
#[async_trait(?Send)]
pub trait Screen {
    /// The current frame, if the transport has one to offer.
    async fn current_screen(&mut self) -> Result<Option<DynamicImage>>;

    /// Ask the transport to refresh its framebuffer cache.
    async fn request_screen_update(&mut self) -> Result<()>;

    async fn send_key(&mut self, key: &str) -> Result<()>;
    async fn type_string(&mut self, text: &str, max_interval: Option<u32>) -> Result<()>;
    async fn mouse_set(&mut self, x: i32, y: i32) -> Result<()>;
    async fn mouse_hide(&mut self, border_offset: i32) -> Result<()>;
    async fn mouse_button(&mut self, button: &str, press: bool) -> Result<()>;
}

/// A named console endpoint with an `{inactive, active, disabled}` lifecycle.
#[async_trait(?Send)]
pub trait Console {
    /// Bring the console up; the returned value is handed back to the
    /// runner as the `activated` signal.
    async fn activate(&mut self) -> Result<Value>;

    async fn reset(&mut self) -> Result<()>;

    fn disable(&mut self);

    /// The console's screen, unavailable while disabled.
    fn screen(&mut self) -> Option<&mut dyn Screen>;

    /// Escape hatch for runner-driven console extensions. Unknown
    /// functions are a contract error; the registry turns it into an
    /// `{exception}` payload instead of propagating.
    async fn call(&mut self, function: &str, _args: &[Value]) -> Result<Value> {
        anyhow::bail!("console function not implemented: {function}")
    }
}

/// Named consoles; at most one is current at any instant.
#[derive(Default)]
pub struct ConsoleRegistry {
    consoles: HashMap<String, Box<dyn Console>>,
    current: Option<String>,
}

impl ConsoleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, console: Box<dyn Console>) {
        self.consoles.insert(name.into(), console);
    }

    pub fn current_name(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// The current console's screen; `None` when nothing is selected, so
    /// forwarded operations silently no-op.
    pub fn current_screen(&mut self) -> Option<&mut dyn Screen> {
        let name = self.current.as_deref()?;
        self.consoles.get_mut(name)?.screen()
    }

    /// Activate `name` and make it current, returning its activated
    /// signal. A missing console is a warning, not an error.
    pub async fn select(&mut self, name: &str) -> Result<Option<Value>> {
        let Some(console) = self.consoles.get_mut(name) else {
            warn!(console = name, "Cannot select unknown console");
            return Ok(None);
        };
        let activated = console.activate().await?;
        self.current = Some(name.to_string());
        Ok(Some(activated))
    }

    pub async fn reset(&mut self, name: &str) -> Result<()> {
        let Some(console) = self.consoles.get_mut(name) else {
            warn!(console = name, "Cannot reset unknown console");
            return Ok(());
        };
        console.reset().await
    }

    /// Disable `name`; clears `current` iff it was current.
    pub fn deactivate(&mut self, name: &str) {
        if let Some(console) = self.consoles.get_mut(name) {
            console.disable();
        } else {
            warn!(console = name, "Cannot deactivate unknown console");
        }
        if self.current.as_deref() == Some(name) {
            self.current = None;
        }
    }

    /// Run an arbitrary console function, folding any failure into an
    /// `{exception}` payload; the runner decides whether that fails the
    /// test.
    pub async fn proxy_call(&mut self, name: &str, function: &str, args: &[Value]) -> Value {
        let Some(console) = self.consoles.get_mut(name) else {
            return json!({"exception": format!("unknown console: {name}")});
        };
        match console.call(function, args).await {
            Ok(result) => json!({"result": result}),
            Err(e) => json!({"exception": e.to_string()}),
        }
    }
}
