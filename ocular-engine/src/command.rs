use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};

/// One or many tag atoms; the runner sends either a bare string or a list.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(untagged)]
pub enum TagSpec {
    #[default]
    None,
    One(String),
    Many(Vec<String>),
}

impl TagSpec {
    pub fn atoms(&self) -> Vec<String> {
        match self {
            TagSpec::None => Vec::new(),
            TagSpec::One(tag) => vec![tag.clone()],
            TagSpec::Many(tags) => tags.clone(),
        }
    }
}

/// One or many regex patterns for `wait_serial`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RegexSpec {
    One(String),
    Many(Vec<String>),
}

impl RegexSpec {
    pub fn patterns(&self) -> Vec<String> {
        match self {
            RegexSpec::One(p) => vec![p.clone()],
            RegexSpec::Many(ps) => ps.clone(),
        }
    }
}

/// The runner's command set. Frames look like
/// `{"cmd": "send_key", "arguments": {"key": "ret"}}`; an unknown name or a
/// malformed payload fails decoding and is fatal to the worker.
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", content = "arguments", rename_all = "snake_case")]
pub enum Command {
    StartVm {},
    StopVm {},
    Alive {},
    SelectConsole {
        testapi_console: String,
    },
    ResetConsole {
        testapi_console: String,
    },
    DeactivateConsole {
        testapi_console: String,
    },
    SendKey {
        key: String,
    },
    TypeString {
        text: String,
        #[serde(default)]
        max_interval: Option<u32>,
    },
    MouseSet {
        x: i32,
        y: i32,
    },
    MouseHide {
        #[serde(default)]
        border_offset: Option<i32>,
    },
    MouseButton {
        button: String,
        bstate: i32,
    },
    CaptureScreenshot {},
    LastScreenshotName {},
    SetReferenceScreenshot {},
    // Historic wire spelling, kept for runner compatibility.
    SimiliarityToReference {},
    SetTagsToAssert {
        #[serde(default)]
        mustmatch: TagSpec,
        #[serde(default)]
        timeout: Option<f64>,
        #[serde(default)]
        reloadneedles: bool,
    },
    CheckAssertedScreen {},
    InteractiveAssertScreen {
        interactive: bool,
    },
    StopAssertScreen {},
    RetryAssertScreen {
        #[serde(default)]
        reload_needles: bool,
        #[serde(default)]
        timeout: Option<f64>,
    },
    SetSerialOffset {},
    SerialText {},
    WaitSerial {
        regexp: RegexSpec,
        timeout: f64,
    },
    WaitIdle {
        timeout: f64,
    },
    FreezeVm {},
    ContVm {},
    ProxyConsoleCall {
        console: String,
        function: String,
        #[serde(default)]
        args: Vec<Value>,
    },
}

impl Command {
    /// Decode one wire frame. A missing `arguments` object is tolerated
    /// for commands that take none.
    pub fn parse(line: &str) -> Result<Command> {
        let mut value: Value =
            serde_json::from_str(line).context("Malformed command frame")?;
        if let Some(obj) = value.as_object_mut() {
            obj.entry("arguments").or_insert_with(|| json!({}));
        }
        serde_json::from_value(value).context("Unknown or invalid command")
    }

    /// Wire name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::StartVm {} => "start_vm",
            Command::StopVm {} => "stop_vm",
            Command::Alive {} => "alive",
            Command::SelectConsole { .. } => "select_console",
            Command::ResetConsole { .. } => "reset_console",
            Command::DeactivateConsole { .. } => "deactivate_console",
            Command::SendKey { .. } => "send_key",
            Command::TypeString { .. } => "type_string",
            Command::MouseSet { .. } => "mouse_set",
            Command::MouseHide { .. } => "mouse_hide",
            Command::MouseButton { .. } => "mouse_button",
            Command::CaptureScreenshot {} => "capture_screenshot",
            Command::LastScreenshotName {} => "last_screenshot_name",
            Command::SetReferenceScreenshot {} => "set_reference_screenshot",
            Command::SimiliarityToReference {} => "similiarity_to_reference",
            Command::SetTagsToAssert { .. } => "set_tags_to_assert",
            Command::CheckAssertedScreen {} => "check_asserted_screen",
            Command::InteractiveAssertScreen { .. } => "interactive_assert_screen",
            Command::StopAssertScreen {} => "stop_assert_screen",
            Command::RetryAssertScreen { .. } => "retry_assert_screen",
            Command::SetSerialOffset {} => "set_serial_offset",
            Command::SerialText {} => "serial_text",
            Command::WaitSerial { .. } => "wait_serial",
            Command::WaitIdle { .. } => "wait_idle",
            Command::FreezeVm {} => "freeze_vm",
            Command::ContVm {} => "cont_vm",
            Command::ProxyConsoleCall { .. } => "proxy_console_call",
        }
    }
}
