//! Null backend: a driver that manages no real SUT and a console whose
//! screen serves an in-memory frame. Lets the worker run without a
//! hypervisor and doubles as the fixture for the integration tests.

use anyhow::Result;
use async_trait::async_trait;
use image::DynamicImage;
use serde_json::{json, Value};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use tracing::info;

use crate::console::{Console, Screen};
use crate::driver::Driver;

#[derive(Default)]
struct NullState {
    image: Option<DynamicImage>,
    capture_delay: Option<Duration>,
    running: bool,
    frozen: bool,
    keys: Vec<String>,
    typed: String,
    update_requests: u64,
}

/// Shared handle onto the null backend's state. Clones observe and steer
/// the same backend; the engine is single-threaded so `Rc` suffices.
#[derive(Clone, Default)]
pub struct NullBackendHandle(Rc<RefCell<NullState>>);

impl NullBackendHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put `image` on the virtual screen.
    pub fn show(&self, image: DynamicImage) {
        self.0.borrow_mut().image = Some(image);
    }

    pub fn clear_screen(&self) {
        self.0.borrow_mut().image = None;
    }

    /// Delay every subsequent capture, simulating a wedged transport.
    pub fn set_capture_delay(&self, delay: Option<Duration>) {
        self.0.borrow_mut().capture_delay = delay;
    }

    pub fn running(&self) -> bool {
        self.0.borrow().running
    }

    pub fn frozen(&self) -> bool {
        self.0.borrow().frozen
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.borrow().keys.clone()
    }

    pub fn typed(&self) -> String {
        self.0.borrow().typed.clone()
    }

    pub fn update_requests(&self) -> u64 {
        self.0.borrow().update_requests
    }
}

pub struct NullScreen {
    handle: NullBackendHandle,
}

#[async_trait(?Send)]
impl Screen for NullScreen {
    async fn current_screen(&mut self) -> Result<Option<DynamicImage>> {
        let delay = self.handle.0.borrow().capture_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.handle.0.borrow().image.clone())
    }

    async fn request_screen_update(&mut self) -> Result<()> {
        self.handle.0.borrow_mut().update_requests += 1;
        Ok(())
    }

    async fn send_key(&mut self, key: &str) -> Result<()> {
        self.handle.0.borrow_mut().keys.push(key.to_string());
        Ok(())
    }

    async fn type_string(&mut self, text: &str, _max_interval: Option<u32>) -> Result<()> {
        self.handle.0.borrow_mut().typed.push_str(text);
        Ok(())
    }

    async fn mouse_set(&mut self, _x: i32, _y: i32) -> Result<()> {
        Ok(())
    }

    async fn mouse_hide(&mut self, _border_offset: i32) -> Result<()> {
        Ok(())
    }

    async fn mouse_button(&mut self, _button: &str, _press: bool) -> Result<()> {
        Ok(())
    }
}

pub struct NullConsole {
    name: String,
    disabled: bool,
    screen: NullScreen,
}

impl NullConsole {
    pub fn new(name: impl Into<String>, handle: NullBackendHandle) -> Self {
        Self {
            name: name.into(),
            disabled: false,
            screen: NullScreen { handle },
        }
    }
}

#[async_trait(?Send)]
impl Console for NullConsole {
    async fn activate(&mut self) -> Result<Value> {
        self.disabled = false;
        Ok(json!({"console": self.name}))
    }

    async fn reset(&mut self) -> Result<()> {
        self.disabled = false;
        Ok(())
    }

    fn disable(&mut self) {
        self.disabled = true;
    }

    fn screen(&mut self) -> Option<&mut dyn Screen> {
        if self.disabled {
            return None;
        }
        Some(&mut self.screen)
    }

    async fn call(&mut self, function: &str, args: &[Value]) -> Result<Value> {
        match function {
            // Debug helper: hand the arguments straight back.
            "echo" => Ok(Value::Array(args.to_vec())),
            other => anyhow::bail!("console function not implemented: {other}"),
        }
    }
}

pub struct NullDriver {
    handle: NullBackendHandle,
}

impl NullDriver {
    pub fn new(handle: NullBackendHandle) -> Self {
        Self { handle }
    }
}

#[async_trait(?Send)]
impl Driver for NullDriver {
    async fn do_start_vm(&mut self) -> Result<()> {
        self.handle.0.borrow_mut().running = true;
        info!("Null SUT started");
        Ok(())
    }

    async fn do_stop_vm(&mut self) -> Result<()> {
        self.handle.0.borrow_mut().running = false;
        info!("Null SUT stopped");
        Ok(())
    }

    async fn freeze(&mut self) -> Result<()> {
        self.handle.0.borrow_mut().frozen = true;
        Ok(())
    }

    async fn cont(&mut self) -> Result<()> {
        self.handle.0.borrow_mut().frozen = false;
        Ok(())
    }

    fn raw_alive(&self) -> bool {
        self.handle.0.borrow().running
    }
}
