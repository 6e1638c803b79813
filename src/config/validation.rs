use super::defaults::{MAX_FRAME_CHANNEL_CAPACITY, MIN_FRAME_CHANNEL_CAPACITY};
use super::AppConfig;
use anyhow::{bail, Result};
use clap::Parser;

impl AppConfig {
    /// Parse CLI arguments and validate them right away.
    pub fn parse_args() -> Result<Self> {
        let config = Self::parse();
        config.validate()?;
        Ok(config)
    }

    /// Check CLI values before any device or network is touched.
    pub fn validate(&self) -> Result<()> {
        // Device listing is a purely local operation.
        if self.list_input_devices {
            return Ok(());
        }

        if self.api_key.trim().is_empty() {
            bail!("an API key is required: pass --api-key or set GEMINI_API_KEY");
        }
        if self.model.trim().is_empty() {
            bail!("--model must not be empty");
        }
        if self.voice.trim().is_empty() {
            bail!("--voice must not be empty");
        }
        if self.live_host.trim().is_empty() || self.live_host.contains('/') {
            bail!(
                "--live-host must be a bare host name, got '{}'",
                self.live_host
            );
        }
        if !(MIN_FRAME_CHANNEL_CAPACITY..=MAX_FRAME_CHANNEL_CAPACITY)
            .contains(&self.frame_channel_capacity)
        {
            bail!(
                "--frame-channel-capacity must be between {MIN_FRAME_CHANNEL_CAPACITY} and {MAX_FRAME_CHANNEL_CAPACITY}, got {}",
                self.frame_channel_capacity
            );
        }
        if let Some(instruction) = &self.system_instruction {
            if instruction.trim().is_empty() {
                bail!("--system-instruction must not be empty when provided");
            }
        }
        Ok(())
    }
}
