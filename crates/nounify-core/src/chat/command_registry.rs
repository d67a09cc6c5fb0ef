#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "select",
        action: "select",
    },
    CommandSpec {
        command: "wallet",
        action: "set_wallet",
    },
    CommandSpec {
        command: "text_model",
        action: "set_text_model",
    },
    CommandSpec {
        command: "confirmations",
        action: "set_confirmations",
    },
];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "previews",
        action: "list_previews",
    },
    CommandSpec {
        command: "mint",
        action: "mint",
    },
    CommandSpec {
        command: "transcript",
        action: "show_transcript",
    },
    CommandSpec {
        command: "help",
        action: "help",
    },
    CommandSpec {
        command: "quit",
        action: "quit",
    },
    CommandSpec {
        command: "exit",
        action: "quit",
    },
];

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/previews",
    "/select",
    "/mint",
    "/wallet",
    "/text_model",
    "/confirmations",
    "/transcript",
    "/help",
    "/quit",
];
