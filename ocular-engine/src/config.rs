use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// How to start the external video encoder. Directives go to its stdin; it
/// runs in the screenshot dir so `E <name>` paths resolve.
#[derive(Debug, Clone)]
pub struct EncoderCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl EncoderCommand {
    /// Split a command line on whitespace, e.g. `"videoenc -o video.ogv"`.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }
}

/// Engine-wide settings. Paths are created on engine construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Cadence of the screenshot feed.
    pub screenshot_interval: Duration,
    /// Cadence of framebuffer refresh requests to the console.
    pub update_request_interval: Duration,
    /// Default assert-screen timeout.
    pub default_timeout: Duration,
    /// Suppress the encoder entirely.
    pub novideo: bool,
    /// Where `shot-*.png` and `last.png` live.
    pub screenshot_dir: PathBuf,
    /// Where heartbeat, crash marker and control files live.
    pub run_dir: PathBuf,
    /// Append-only serial log of the SUT.
    pub serial_file: PathBuf,
    /// Encoder invocation, if video is wanted.
    pub encoder: Option<EncoderCommand>,
    /// Force-exit the worker a few seconds after `alive` reports dead.
    pub exit_on_dead: bool,
}

impl EngineConfig {
    pub fn new(
        screenshot_dir: impl Into<PathBuf>,
        run_dir: impl Into<PathBuf>,
        serial_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            screenshot_interval: Duration::from_millis(500),
            update_request_interval: Duration::from_secs(1),
            default_timeout: Duration::from_secs(30),
            novideo: false,
            screenshot_dir: screenshot_dir.into(),
            run_dir: run_dir.into(),
            serial_file: serial_file.into(),
            encoder: None,
            exit_on_dead: true,
        }
    }

    /// Apply the `SCREENSHOTINTERVAL` and `NOVIDEO` environment overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(raw) = std::env::var("SCREENSHOTINTERVAL") {
            match raw.parse::<f64>() {
                Ok(secs) if secs > 0.0 => {
                    self.screenshot_interval = Duration::from_secs_f64(secs);
                }
                _ => warn!(value = %raw, "Ignoring unparsable SCREENSHOTINTERVAL"),
            }
        }
        if let Ok(raw) = std::env::var("NOVIDEO") {
            self.novideo = !matches!(raw.as_str(), "" | "0");
        }
        self
    }

    pub fn heartbeat_file(&self) -> PathBuf {
        self.run_dir.join("backend.run")
    }

    pub fn crash_file(&self) -> PathBuf {
        self.run_dir.join("backend.crashed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoder_command_splits_program_and_args() {
        let cmd = EncoderCommand::parse("videoenc -x 1024 -o video.ogv").unwrap();
        assert_eq!(cmd.program, "videoenc");
        assert_eq!(cmd.args, vec!["-x", "1024", "-o", "video.ogv"]);
        assert!(EncoderCommand::parse("   ").is_none());
    }

    #[test]
    fn defaults_match_the_documented_cadences() {
        let cfg = EngineConfig::new("shots", "run", "serial0");
        assert_eq!(cfg.screenshot_interval, Duration::from_millis(500));
        assert_eq!(cfg.update_request_interval, Duration::from_secs(1));
        assert_eq!(cfg.default_timeout, Duration::from_secs(30));
        assert!(!cfg.novideo);
    }
}
