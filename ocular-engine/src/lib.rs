pub mod assert;
pub mod command;
pub mod config;
pub mod console;
pub mod control;
pub mod driver;
pub mod engine;
pub mod null;
pub mod serial;

pub use config::{EncoderCommand, EngineConfig};
pub use console::{Console, ConsoleRegistry, Screen};
pub use driver::Driver;
pub use engine::Engine;
pub use null::{NullBackendHandle, NullConsole, NullDriver};
