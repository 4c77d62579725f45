//! The worker engine: a cooperative, single-threaded capture loop that owns
//! the command pipe, the screenshot pipeline and the assertion state.
//!
//! The loop ticks on wall-clock deadlines (framebuffer refresh requests and
//! screenshots run at different cadences), then parks on the command pipe
//! for whatever time is left. At most one command is dispatched per tick;
//! handlers run to completion before the next tick, and the handful of
//! waiting handlers re-enter the loop with short bounded timeouts so the
//! screenshot and video streams never starve.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::fs;
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, error, info, warn};

use ocular_capture::compare::{similarity_score, SIMILARITY_IDENTICAL};
use ocular_capture::frame::Frame;
use ocular_capture::{EncoderFeed, ScreenshotPipeline};
use ocular_needle::NeedleSet;

use crate::assert::{AssertEngine, PollOutcome};
use crate::command::Command;
use crate::config::EngineConfig;
use crate::console::ConsoleRegistry;
use crate::control::ControlSignals;
use crate::driver::Driver;
use crate::serial::{compile_patterns, first_match, SerialTail};

/// Per-call overrides for one capture-loop entry. `None` falls back to the
/// engine-level setting, so reentrant waits can tighten cadences without
/// touching global state.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopParams {
    pub timeout: Option<Duration>,
    pub update_request_interval: Option<Duration>,
    pub screenshot_interval: Option<Duration>,
}

/// Update-request cadence while a handler waits inside a reentrant loop.
const REENTRANT_UPDATE_INTERVAL: Duration = Duration::from_millis(190);
/// Longest single stretch a waiting handler spends inside the loop before
/// re-checking its own condition.
const REENTRANT_BURST: Duration = Duration::from_secs(1);
/// Missing screenshots for this many intervals counts as a stall.
const STALL_INTERVALS: u32 = 20;

enum Flow {
    Continue,
    Quit,
}

pub struct Engine {
    cfg: EngineConfig,
    driver: Box<dyn Driver>,
    consoles: ConsoleRegistry,
    needles: NeedleSet,
    pipeline: ScreenshotPipeline,
    serial: SerialTail,
    signals: ControlSignals,
    assert: AssertEngine,
    reference: Option<Arc<Frame>>,
    mouse: Option<(i32, i32)>,
    started: bool,
    update_request_interval: Duration,
    last_update_request: Instant,
    last_screenshot: Instant,
    cmd: Lines<BufReader<Box<dyn AsyncRead + Unpin>>>,
    rsp: Box<dyn AsyncWrite + Unpin>,
    cmd_open: bool,
}

impl Engine {
    pub fn new(
        cfg: EngineConfig,
        driver: Box<dyn Driver>,
        consoles: ConsoleRegistry,
        needles: NeedleSet,
        command_input: impl AsyncRead + Unpin + 'static,
        response_output: impl AsyncWrite + Unpin + 'static,
    ) -> Result<Self> {
        fs::create_dir_all(&cfg.run_dir)
            .with_context(|| format!("Failed to create run dir: {}", cfg.run_dir.display()))?;
        let pipeline = ScreenshotPipeline::new(&cfg.screenshot_dir, cfg.screenshot_interval)?;
        let serial = SerialTail::new(&cfg.serial_file);
        let signals = ControlSignals::new(&cfg.run_dir);
        let reader: Box<dyn AsyncRead + Unpin> = Box::new(command_input);
        let now = Instant::now();
        Ok(Self {
            update_request_interval: cfg.update_request_interval,
            cfg,
            driver,
            consoles,
            needles,
            pipeline,
            serial,
            signals,
            assert: AssertEngine::new(),
            reference: None,
            mouse: None,
            started: false,
            last_update_request: now,
            last_screenshot: now,
            cmd: BufReader::new(reader).lines(),
            rsp: Box::new(response_output),
            cmd_open: true,
        })
    }

    /// Inject an encoder feed directly, bypassing subprocess spawning.
    pub fn set_encoder(&mut self, encoder: EncoderFeed) {
        self.pipeline.set_encoder(encoder);
    }

    /// Serve the runner until it closes the pipe or stops the SUT, then
    /// send the shutdown sentinel. Any error is fatal to the worker; the
    /// caller routes it through [`Engine::emergency_stop`].
    pub async fn run(&mut self) -> Result<()> {
        info!("Engine ready, serving runner commands");
        self.run_capture_loop(LoopParams::default()).await?;
        self.shutdown().await;
        Ok(())
    }

    /// The cooperative scheduler. Reentrant: waiting handlers call this
    /// again with their own bounds; all loop state lives on the engine.
    async fn run_capture_loop(&mut self, params: LoopParams) -> Result<()> {
        let loop_start = Instant::now();
        loop {
            if !self.cmd_open {
                return Ok(());
            }
            let now = Instant::now();
            if let Some(limit) = params.timeout {
                if now - loop_start >= limit {
                    return Ok(());
                }
            }
            let update_interval = params
                .update_request_interval
                .unwrap_or(self.update_request_interval);
            let shot_interval = params
                .screenshot_interval
                .unwrap_or(self.pipeline.interval());

            if now - self.last_update_request >= update_interval {
                if let Some(screen) = self.consoles.current_screen() {
                    screen.request_screen_update().await?;
                }
                self.last_update_request = now;
            }

            if self.assert.has_checked()
                && now - self.last_screenshot > shot_interval * STALL_INTERVALS
            {
                self.assert.note_stall();
            }

            if now - self.last_screenshot >= shot_interval {
                self.capture_one().await?;
                self.last_screenshot = now;
            }

            let now = Instant::now();
            let until_shot = shot_interval.saturating_sub(now - self.last_screenshot);
            let until_update =
                update_interval.saturating_sub(now - self.last_update_request);
            let mut sleep_for = until_shot.min(until_update);
            if let Some(limit) = params.timeout {
                sleep_for = sleep_for.min(limit.saturating_sub(now - loop_start));
            }

            // Park on the pipe; dispatch at most one command per tick, since
            // a handler may invalidate whatever else looked ready.
            match timeout(sleep_for, self.cmd.next_line()).await {
                Err(_) => continue,
                Ok(Ok(Some(line))) => {
                    let line = line.trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    match Box::pin(self.dispatch_line(&line)).await? {
                        Flow::Continue => {}
                        Flow::Quit => self.cmd_open = false,
                    }
                }
                Ok(Ok(None)) => {
                    info!("Command pipe closed by runner");
                    self.cmd_open = false;
                }
                Ok(Err(e)) => {
                    return Err(e).context("Failed to read command pipe");
                }
            }
        }
    }

    /// Grab one frame from the current console and run it through the
    /// pipeline. No console or no frame is not an error.
    async fn capture_one(&mut self) -> Result<()> {
        let Some(screen) = self.consoles.current_screen() else {
            return Ok(());
        };
        if let Some(image) = screen.current_screen().await? {
            self.pipeline.process(image).await?;
        }
        Ok(())
    }

    async fn dispatch_line(&mut self, line: &str) -> Result<Flow> {
        let command = Command::parse(line)?;
        debug!(cmd = command.name(), "Dispatching runner command");
        let (response, flow) = self.handle(command).await?;
        self.send_response(response).await?;
        Ok(flow)
    }

    async fn send_response(&mut self, response: Value) -> Result<()> {
        let mut frame = serde_json::to_string(&json!({ "rsp": response }))
            .context("Failed to encode response")?;
        frame.push('\n');
        self.rsp
            .write_all(frame.as_bytes())
            .await
            .context("Failed to write response pipe")?;
        self.rsp
            .flush()
            .await
            .context("Failed to flush response pipe")?;
        Ok(())
    }

    async fn handle(&mut self, command: Command) -> Result<(Value, Flow)> {
        let response = match command {
            Command::StartVm {} => {
                self.start_vm().await?;
                json!({})
            }
            Command::StopVm {} => {
                self.stop_vm().await?;
                return Ok((json!({}), Flow::Quit));
            }
            Command::Alive {} => {
                let alive = self.started
                    && self.cfg.heartbeat_file().exists()
                    && self.driver.raw_alive();
                if !alive && self.cfg.exit_on_dead {
                    warn!("SUT gone, forcing worker exit shortly");
                    tokio::spawn(async {
                        tokio::time::sleep(Duration::from_secs(3)).await;
                        std::process::exit(1);
                    });
                }
                json!(alive)
            }
            Command::SelectConsole { testapi_console } => {
                match self.consoles.select(&testapi_console).await? {
                    Some(activated) => {
                        // Represent the switch in the screenshot/video feed.
                        self.capture_one().await?;
                        json!({ "activated": activated })
                    }
                    None => Value::Null,
                }
            }
            Command::ResetConsole { testapi_console } => {
                self.consoles.reset(&testapi_console).await?;
                json!({})
            }
            Command::DeactivateConsole { testapi_console } => {
                self.consoles.deactivate(&testapi_console);
                json!({})
            }
            Command::SendKey { key } => {
                if let Some(screen) = self.consoles.current_screen() {
                    screen.send_key(&key).await?;
                }
                Value::Null
            }
            Command::TypeString { text, max_interval } => {
                if let Some(screen) = self.consoles.current_screen() {
                    screen.type_string(&text, max_interval).await?;
                }
                Value::Null
            }
            Command::MouseSet { x, y } => {
                self.mouse = Some((x, y));
                if let Some(screen) = self.consoles.current_screen() {
                    screen.mouse_set(x, y).await?;
                }
                Value::Null
            }
            Command::MouseHide { border_offset } => {
                if let Some((x, y)) = self.mouse.take() {
                    debug!(x, y, "Hiding mouse cursor");
                }
                if let Some(screen) = self.consoles.current_screen() {
                    screen.mouse_hide(border_offset.unwrap_or(0)).await?;
                }
                Value::Null
            }
            Command::MouseButton { button, bstate } => {
                if let Some(screen) = self.consoles.current_screen() {
                    screen.mouse_button(&button, bstate != 0).await?;
                }
                Value::Null
            }
            Command::CaptureScreenshot {} => {
                self.capture_one().await?;
                json!({})
            }
            Command::LastScreenshotName {} => {
                json!({ "filename": self.pipeline.last_screenshot_name().unwrap_or("") })
            }
            Command::SetReferenceScreenshot {} => {
                self.reference = self.pipeline.last_frame().cloned();
                json!({})
            }
            Command::SimiliarityToReference {} => {
                let sim = match (self.reference.as_ref(), self.pipeline.last_frame()) {
                    (Some(reference), Some(last)) => {
                        if Arc::ptr_eq(reference, last) {
                            SIMILARITY_IDENTICAL
                        } else {
                            similarity_score(&reference.image, &last.image)
                        }
                    }
                    _ => 0,
                };
                json!({ "sim": sim })
            }
            Command::SetTagsToAssert {
                mustmatch,
                timeout,
                reloadneedles,
            } => {
                if reloadneedles {
                    self.needles.reload()?;
                }
                let atoms = mustmatch.atoms();
                let tags = NeedleSet::normalize_tags(&atoms);
                let needles = self.needles.needles_for(&atoms);
                let deadline = Instant::now() + self.assert_timeout(timeout);
                self.assert.arm(tags.clone(), needles, deadline, reloadneedles);
                json!({ "tags": tags })
            }
            Command::CheckAssertedScreen {} => {
                let outcome = self.assert.poll(
                    self.pipeline.last_frame(),
                    Instant::now(),
                    &self.signals,
                )?;
                match outcome {
                    PollOutcome::Pending => Value::Null,
                    PollOutcome::Matched(v) | PollOutcome::TimedOut(v) => v,
                    PollOutcome::Waiting(v) => {
                        self.driver.freeze().await?;
                        v
                    }
                    PollOutcome::Stalled => {
                        let marker = self.cfg.crash_file();
                        if let Err(e) = fs::write(
                            &marker,
                            format!("stalled at {}\n", chrono::Utc::now().to_rfc3339()),
                        ) {
                            warn!("Failed to write crash marker: {e}");
                        }
                        error!(marker = %marker.display(), "Screen stalled while asserting");
                        anyhow::bail!("screen stalled while asserting, aborting worker");
                    }
                }
            }
            Command::InteractiveAssertScreen { interactive } => {
                self.assert.set_interactive(interactive);
                json!({})
            }
            Command::StopAssertScreen {} => {
                self.assert.expire(Instant::now());
                json!({})
            }
            Command::RetryAssertScreen {
                reload_needles,
                timeout,
            } => {
                if self.assert.is_armed() {
                    let needles = if reload_needles {
                        self.needles.reload()?;
                        let tags = self.assert.tags().unwrap_or_default().to_vec();
                        Some(self.needles.needles_for(&tags))
                    } else {
                        None
                    };
                    let deadline = Instant::now() + self.assert_timeout(timeout);
                    self.assert.retry(deadline, reload_needles, needles);
                }
                self.driver.cont().await?;
                json!({})
            }
            Command::SetSerialOffset {} => {
                json!(self.serial.reset_offset()?)
            }
            Command::SerialText {} => {
                let bytes = self.serial.text()?;
                json!(String::from_utf8_lossy(&bytes))
            }
            Command::WaitSerial { regexp, timeout } => {
                self.wait_serial(regexp.patterns(), timeout).await?
            }
            Command::WaitIdle { timeout } => {
                Box::pin(self.run_capture_loop(LoopParams {
                    timeout: Some(Duration::from_secs_f64(timeout)),
                    ..LoopParams::default()
                }))
                .await?;
                json!({})
            }
            Command::FreezeVm {} => {
                self.driver.freeze().await?;
                json!({})
            }
            Command::ContVm {} => {
                self.driver.cont().await?;
                json!({})
            }
            Command::ProxyConsoleCall {
                console,
                function,
                args,
            } => self.consoles.proxy_call(&console, &function, &args).await,
        };
        Ok((response, Flow::Continue))
    }

    fn assert_timeout(&self, requested: Option<f64>) -> Duration {
        requested
            .map(Duration::from_secs_f64)
            .unwrap_or(self.cfg.default_timeout)
    }

    /// Tail the serial log until a pattern matches or the timeout passes,
    /// keeping the screenshot and video streams alive in between reads.
    async fn wait_serial(&mut self, patterns: Vec<String>, timeout_secs: f64) -> Result<Value> {
        let regexes = compile_patterns(&patterns)?;
        let deadline = Instant::now() + Duration::from_secs_f64(timeout_secs);
        let mut matched: Option<String> = None;
        let mut text;

        loop {
            let bytes = self.serial.text()?;
            text = String::from_utf8_lossy(&bytes).into_owned();
            if let Some(hit) = first_match(&regexes, &text) {
                matched = Some(hit.as_str().to_string());
                break;
            }
            let now = Instant::now();
            if now >= deadline || !self.cmd_open {
                break;
            }
            let burst = REENTRANT_BURST.min(deadline - now);
            Box::pin(self.run_capture_loop(LoopParams {
                timeout: Some(burst),
                update_request_interval: Some(REENTRANT_UPDATE_INTERVAL),
                screenshot_interval: None,
            }))
            .await?;
        }

        self.serial.advance_to_eof()?;
        info!(
            matched = matched.is_some(),
            pattern = matched.as_deref().unwrap_or(""),
            "wait_serial finished"
        );
        Ok(json!({
            "matched": matched.is_some(),
            "string": text,
            "regexp": matched,
        }))
    }

    async fn start_vm(&mut self) -> Result<()> {
        self.mouse = None;
        remove_if_present(&self.cfg.crash_file())?;
        fs::write(
            self.cfg.heartbeat_file(),
            format!(
                "{} pid={}\n",
                chrono::Utc::now().to_rfc3339(),
                std::process::id()
            ),
        )
        .context("Failed to write heartbeat file")?;

        if !self.cfg.novideo {
            if let Some(encoder) = self.cfg.encoder.clone() {
                let feed =
                    EncoderFeed::spawn(&encoder.program, &encoder.args, self.pipeline.dir())?;
                self.pipeline.set_encoder(feed);
            }
        }

        self.driver.do_start_vm().await?;
        self.started = true;
        info!("SUT started");
        Ok(())
    }

    async fn stop_vm(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }
        self.pipeline.close_encoder().await?;
        remove_if_present(&self.cfg.heartbeat_file())?;
        self.driver.do_stop_vm().await?;
        self.started = false;
        info!("SUT stopped");
        Ok(())
    }

    /// Announce shutdown and close the response pipe. Best effort: the
    /// runner may already be gone.
    async fn shutdown(&mut self) {
        let _ = self.rsp.write_all(b"{\"QUIT\":1}\n").await;
        let _ = self.rsp.flush().await;
        let _ = self.rsp.shutdown().await;
        info!("Engine shut down");
    }

    /// Crash hook: release everything so the runner reliably observes pipe
    /// closure, swallowing any secondary failure.
    pub async fn emergency_stop(&mut self) {
        if let Err(e) = self.pipeline.close_encoder().await {
            warn!("Failed to close encoder during emergency stop: {e}");
        }
        let _ = remove_if_present(&self.cfg.heartbeat_file());
        if self.started {
            if let Err(e) = self.driver.do_stop_vm().await {
                warn!("Failed to stop SUT during emergency stop: {e}");
            }
            self.started = false;
        }
        let _ = self.rsp.shutdown().await;
    }
}

fn remove_if_present(path: &std::path::Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}
