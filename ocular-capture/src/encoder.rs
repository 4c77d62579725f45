use anyhow::{Context, Result};
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// Line-framed directive feed to the external video encoder.
///
/// The encoder consumes `R\n` (repeat the previously encoded frame) or
/// `E <path>\n` (encode the file at path); the stream is flushed after every
/// directive and closing it signals end-of-video.
pub struct EncoderFeed {
    sink: Box<dyn AsyncWrite + Unpin>,
    child: Option<Child>,
}

impl EncoderFeed {
    /// Feed an arbitrary writer. Used by tests and by callers that manage
    /// the encoder process themselves.
    pub fn from_writer(writer: impl AsyncWrite + Unpin + 'static) -> Self {
        Self {
            sink: Box::new(writer),
            child: None,
        }
    }

    /// Spawn the encoder subprocess with its stdin piped, running in `cwd`
    /// so that `E <name>` directives resolve against the screenshot dir.
    pub fn spawn(program: &str, args: &[String], cwd: &Path) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn encoder: {program}"))?;
        let stdin = child
            .stdin
            .take()
            .context("Encoder child has no stdin handle")?;
        info!(encoder = program, "Encoder started");
        Ok(Self {
            sink: Box::new(stdin),
            child: Some(child),
        })
    }

    /// Reuse the last encoded frame.
    pub async fn repeat(&mut self) -> Result<()> {
        self.send("R\n").await
    }

    /// Encode the written frame at `name`.
    pub async fn encode(&mut self, name: &str) -> Result<()> {
        self.send(&format!("E {name}\n")).await
    }

    async fn send(&mut self, directive: &str) -> Result<()> {
        self.sink
            .write_all(directive.as_bytes())
            .await
            .context("Failed to write encoder directive")?;
        self.sink
            .flush()
            .await
            .context("Failed to flush encoder stream")?;
        Ok(())
    }

    /// Close the directive stream and wait for the encoder to finish.
    pub async fn close(mut self) -> Result<()> {
        self.sink
            .shutdown()
            .await
            .context("Failed to close encoder stream")?;
        if let Some(mut child) = self.child.take() {
            let status = child.wait().await.context("Failed to reap encoder")?;
            debug!(?status, "Encoder exited");
        }
        Ok(())
    }
}
