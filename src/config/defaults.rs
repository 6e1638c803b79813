//! Default values shared between the CLI definition and validation.

/// Realtime endpoint host.
pub(super) const DEFAULT_LIVE_HOST: &str = "generativelanguage.googleapis.com";

/// Native-audio realtime model.
pub(super) const DEFAULT_LIVE_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";

/// Prebuilt synthesized voice.
pub(super) const DEFAULT_VOICE: &str = "Kore";

/// Caller identity woven into the default assistant instruction.
pub(super) const DEFAULT_USER_PHONE: &str = "+1-(408)-614-0468";

/// Capture blocks buffered between the device callback and the session loop.
pub(super) const DEFAULT_FRAME_CHANNEL_CAPACITY: usize = 64;

pub(super) const MIN_FRAME_CHANNEL_CAPACITY: usize = 8;
pub(super) const MAX_FRAME_CHANNEL_CAPACITY: usize = 1024;

pub(super) fn default_system_instruction(phone_number: &str) -> String {
    format!(
        "You are a helpful AI Assistant for Tech Skyline. You are talking to the user \
         with phone number {phone_number}. Be concise, helpful, and friendly."
    )
}
