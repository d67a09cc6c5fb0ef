use std::collections::BTreeMap;

use serde_json::Value;

use super::command_registry::{CommandSpec, NO_ARG_COMMANDS, RAW_ARG_COMMANDS};

#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub action: String,
    pub raw: String,
    pub theme: Option<String>,
    pub command_args: BTreeMap<String, Value>,
}

impl Intent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            theme: None,
            command_args: BTreeMap::new(),
        }
    }
}

fn find_action(command: &str, specs: &[CommandSpec]) -> Option<&'static str> {
    specs
        .iter()
        .find(|spec| spec.command == command)
        .map(|spec| spec.action)
}

fn raw_arg_key(action: &str) -> &'static str {
    match action {
        "select" => "target",
        "set_wallet" => "address",
        "set_text_model" => "model",
        _ => "value",
    }
}

/// Maps one line of session input to an action. Bare text is a generation
/// request carrying the theme; `/`-prefixed input is a command.
pub fn parse_intent(text: &str) -> Intent {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return Intent::new("noop", text);
    }

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let remainder = &slash_tail[command_len..];
            let arg = if remainder.is_empty() {
                ""
            } else {
                remainder.trim()
            };

            if let Some(action) = find_action(&command, RAW_ARG_COMMANDS) {
                let mut intent = Intent::new(action, text);
                if action == "set_confirmations" {
                    intent.command_args.insert(
                        "count".to_string(),
                        arg.parse::<u64>()
                            .map(|count| Value::Number(count.into()))
                            .unwrap_or(Value::Null),
                    );
                } else {
                    intent.command_args.insert(
                        raw_arg_key(action).to_string(),
                        Value::String(arg.to_string()),
                    );
                }
                return intent;
            }

            if let Some(action) = find_action(&command, NO_ARG_COMMANDS) {
                return Intent::new(action, text);
            }

            let mut intent = Intent::new("unknown", text);
            intent
                .command_args
                .insert("command".to_string(), Value::String(command));
            intent
                .command_args
                .insert("arg".to_string(), Value::String(arg.to_string()));
            return intent;
        }
    }

    let mut intent = Intent::new("generate", text);
    intent.theme = Some(raw_trimmed.to_string());
    intent
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::parse_intent;

    #[test]
    fn bare_text_is_a_generation_request() {
        let intent = parse_intent("ocean theme");
        assert_eq!(intent.action, "generate");
        assert_eq!(intent.theme.as_deref(), Some("ocean theme"));
    }

    #[test]
    fn whitespace_is_a_noop() {
        assert_eq!(parse_intent("   ").action, "noop");
        assert_eq!(parse_intent("").action, "noop");
    }

    #[test]
    fn parse_select_keeps_raw_target() {
        let by_index = parse_intent("/select 2");
        assert_eq!(by_index.action, "select");
        assert_eq!(by_index.command_args["target"], json!("2"));

        let by_url = parse_intent("/select http://host/1.png");
        assert_eq!(by_url.command_args["target"], json!("http://host/1.png"));
    }

    #[test]
    fn parse_wallet_and_model_commands() {
        let wallet = parse_intent("/wallet 0xabc");
        assert_eq!(wallet.action, "set_wallet");
        assert_eq!(wallet.command_args["address"], json!("0xabc"));

        let model = parse_intent("/text_model gpt-4o-mini");
        assert_eq!(model.action, "set_text_model");
        assert_eq!(model.command_args["model"], json!("gpt-4o-mini"));
    }

    #[test]
    fn parse_confirmations_requires_a_number() {
        let valid = parse_intent("/confirmations 3");
        assert_eq!(valid.action, "set_confirmations");
        assert_eq!(valid.command_args["count"], json!(3));

        let invalid = parse_intent("/confirmations lots");
        assert_eq!(invalid.command_args["count"], json!(null));
    }

    #[test]
    fn parse_no_arg_commands() {
        assert_eq!(parse_intent("/previews").action, "list_previews");
        assert_eq!(parse_intent("/mint").action, "mint");
        assert_eq!(parse_intent("/help").action, "help");
        assert_eq!(parse_intent("/quit").action, "quit");
        assert_eq!(parse_intent("/exit").action, "quit");
    }

    #[test]
    fn unknown_command_carries_its_name() {
        let intent = parse_intent("/frobnicate now");
        assert_eq!(intent.action, "unknown");
        assert_eq!(intent.command_args["command"], json!("frobnicate"));
        assert_eq!(intent.command_args["arg"], json!("now"));
    }
}
