use super::AppConfig;
use clap::Parser;

fn parse(args: &[&str]) -> AppConfig {
    let mut full = vec!["skyvoice"];
    full.extend_from_slice(args);
    AppConfig::parse_from(full)
}

#[test]
fn defaults_with_a_key_are_valid() {
    let config = parse(&["--api-key", "test-key"]);
    config.validate().expect("defaults should be valid");
}

#[test]
fn missing_api_key_is_rejected() {
    let config = parse(&["--api-key", ""]);
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("API key"));
}

#[test]
fn list_input_devices_needs_no_key() {
    let config = parse(&["--api-key", "", "--list-input-devices"]);
    config.validate().expect("device listing is local-only");
}

#[test]
fn frame_channel_capacity_is_bounded() {
    let config = parse(&["--api-key", "k", "--frame-channel-capacity", "4"]);
    assert!(config.validate().is_err());
    let config = parse(&["--api-key", "k", "--frame-channel-capacity", "4096"]);
    assert!(config.validate().is_err());
    let config = parse(&["--api-key", "k", "--frame-channel-capacity", "32"]);
    config.validate().expect("capacity in range");
}

#[test]
fn host_with_a_path_is_rejected() {
    let config = parse(&["--api-key", "k", "--live-host", "example.com/ws"]);
    assert!(config.validate().is_err());
}

#[test]
fn blank_instruction_override_is_rejected() {
    let config = parse(&["--api-key", "k", "--system-instruction", "  "]);
    assert!(config.validate().is_err());
}

#[test]
fn default_instruction_weaves_the_phone_number() {
    let config = parse(&["--api-key", "k", "--phone-number", "+1-555-0100"]);
    let transport = config.transport_config();
    assert!(transport.system_instruction.contains("+1-555-0100"));
    assert!(transport.system_instruction.contains("Tech Skyline"));
}

#[test]
fn instruction_override_wins_over_the_default() {
    let config = parse(&["--api-key", "k", "--system-instruction", "Talk like a pirate."]);
    let transport = config.transport_config();
    assert_eq!(transport.system_instruction, "Talk like a pirate.");
}

#[test]
fn transport_config_copies_model_and_voice() {
    let config = parse(&["--api-key", "k", "--model", "demo-live", "--voice", "Puck"]);
    let transport = config.transport_config();
    assert_eq!(transport.model, "demo-live");
    assert_eq!(transport.voice, "Puck");
    assert_eq!(transport.api_key, "k");
}
