use anyhow::Result;
use async_trait::async_trait;

/// Hypervisor-facing port. Implementations own the actual SUT process; the
/// engine only sequences start/stop and the interactive clock freeze.
#[async_trait(?Send)]
pub trait Driver {
    async fn do_start_vm(&mut self) -> Result<()>;
    async fn do_stop_vm(&mut self) -> Result<()>;

    /// Park the SUT's virtual clock so a human can inspect failure state.
    async fn freeze(&mut self) -> Result<()>;
    async fn cont(&mut self) -> Result<()>;

    /// Whether the driver itself still considers the SUT running.
    fn raw_alive(&self) -> bool;
}
