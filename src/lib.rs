pub mod audio;
pub mod config;
mod logging;
pub mod session;
pub mod telemetry;
pub mod terminal;
pub mod transport;

pub use logging::{init_logging, log_debug, log_debug_content, log_file_path};
pub use session::{start_call, CallEvent, CallMetrics, CallSession, SessionState};
