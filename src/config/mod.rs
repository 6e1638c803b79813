//! Command-line parsing and validation helpers.

mod defaults;
#[cfg(test)]
mod tests;
mod validation;

use clap::Parser;

use crate::transport::TransportConfig;
use defaults::{
    default_system_instruction, DEFAULT_FRAME_CHANNEL_CAPACITY, DEFAULT_LIVE_HOST,
    DEFAULT_LIVE_MODEL, DEFAULT_USER_PHONE, DEFAULT_VOICE,
};

/// CLI options for the skyvoice call client. Validated values keep the
/// transport and audio pipeline inside safe ranges.
#[derive(Debug, Parser, Clone)]
#[command(about = "Skyvoice live call client", author, version)]
pub struct AppConfig {
    /// API key for the realtime endpoint
    #[arg(
        long = "api-key",
        env = "GEMINI_API_KEY",
        default_value = "",
        hide_env_values = true
    )]
    pub api_key: String,

    /// Realtime endpoint host (bare host name)
    #[arg(long = "live-host", default_value = DEFAULT_LIVE_HOST)]
    pub live_host: String,

    /// Realtime model identifier
    #[arg(long, default_value = DEFAULT_LIVE_MODEL)]
    pub model: String,

    /// Prebuilt synthesized voice name
    #[arg(long, default_value = DEFAULT_VOICE)]
    pub voice: String,

    /// Override the assistant system instruction
    #[arg(long = "system-instruction")]
    pub system_instruction: Option<String>,

    /// Caller phone number woven into the default instruction
    #[arg(long = "phone-number", default_value = DEFAULT_USER_PHONE)]
    pub phone_number: String,

    /// Preferred audio input device name
    #[arg(long)]
    pub input_device: Option<String>,

    /// Print detected audio input devices and exit
    #[arg(long = "list-input-devices", default_value_t = false)]
    pub list_input_devices: bool,

    /// Capture blocks buffered between the device and the session loop
    #[arg(long = "frame-channel-capacity", default_value_t = DEFAULT_FRAME_CHANNEL_CAPACITY)]
    pub frame_channel_capacity: usize,

    /// Enable file logging (debug)
    #[arg(long = "logs", env = "SKYVOICE_LOGS", default_value_t = false)]
    pub logs: bool,

    /// Disable all file logging (overrides --logs and log env vars)
    #[arg(long = "no-logs", env = "SKYVOICE_NO_LOGS", default_value_t = false)]
    pub no_logs: bool,

    /// Allow logging content snippets (debug log only)
    #[arg(
        long = "log-content",
        env = "SKYVOICE_LOG_CONTENT",
        default_value_t = false
    )]
    pub log_content: bool,

    /// Enable verbose timing logs
    #[arg(long)]
    pub log_timings: bool,
}

impl AppConfig {
    /// Start configuration for the live transport.
    pub fn transport_config(&self) -> TransportConfig {
        let system_instruction = self
            .system_instruction
            .clone()
            .unwrap_or_else(|| default_system_instruction(&self.phone_number));
        TransportConfig {
            api_key: self.api_key.clone(),
            host: self.live_host.clone(),
            model: self.model.clone(),
            voice: self.voice.clone(),
            system_instruction,
        }
    }

    /// Knobs the session needs to open the capture pipeline.
    pub fn pipeline_config(&self) -> CallPipelineConfig {
        CallPipelineConfig {
            input_device: self.input_device.clone(),
            frame_channel_capacity: self.frame_channel_capacity,
        }
    }
}

/// Capture pipeline parameters resolved from the CLI.
#[derive(Debug, Clone)]
pub struct CallPipelineConfig {
    pub input_device: Option<String>,
    pub frame_channel_capacity: usize,
}
