use std::io::{self, ErrorKind, Write};
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use nounify_core::chat::{parse_intent, ChatRole, CHAT_HELP_COMMANDS};
use nounify_core::metadata::NftMetadata;
use nounify_engine::{StudioEngine, DEFAULT_TEXT_MODEL};
use serde_json::Value;

#[derive(Debug, Parser)]
#[command(name = "nounify", version, about = "Theme-to-mint NFT studio")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Chat(ChatArgs),
    Generate(GenerateArgs),
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value = DEFAULT_TEXT_MODEL)]
    text_model: String,
    #[arg(long)]
    wallet: Option<String>,
    #[arg(long)]
    contract: Option<String>,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    theme: String,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value = DEFAULT_TEXT_MODEL)]
    text_model: String,
    #[arg(long)]
    wallet: Option<String>,
    #[arg(long)]
    contract: Option<String>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("nounify error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => {
            run_chat(args)?;
            Ok(0)
        }
        Command::Generate(args) => run_generate(args),
    }
}

fn run_chat(args: ChatArgs) -> Result<()> {
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let mut engine = StudioEngine::new(
        &args.out,
        &events_path,
        Some(args.text_model.clone()),
        args.wallet.clone(),
        args.contract.clone(),
    )?;

    let stdin = io::stdin();
    let mut line = String::new();

    println!("Nounify chat started. Type a theme to generate previews, /help for commands.");

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim_end_matches(['\n', '\r']);
        let intent = parse_intent(input);
        match intent.action.as_str() {
            "noop" => continue,
            "help" => {
                println!("Commands: {}", CHAT_HELP_COMMANDS.join(" "));
                println!("Anything else is a theme and starts a generation run.");
            }
            "generate" => {
                let Some(theme) = intent.theme.as_deref() else {
                    continue;
                };
                match engine.generate(theme) {
                    Ok(previews) => {
                        if previews.is_empty() {
                            println!("No candidates returned for that theme.");
                        } else {
                            print_previews(&previews, engine.active_image());
                        }
                    }
                    Err(err) => println!("Generation failed: {err:#}"),
                }
            }
            "list_previews" => {
                if engine.previews().is_empty() {
                    println!("No previews yet; type a theme first.");
                } else {
                    print_previews(engine.previews(), engine.active_image());
                }
            }
            "select" => {
                let target = value_as_non_empty_string(intent.command_args.get("target"));
                let Some(target) = target else {
                    println!("/select requires a preview index or an image URL");
                    continue;
                };
                let Some(image) = resolve_select_target(engine.previews(), &target) else {
                    println!("No preview matches {target}");
                    continue;
                };
                engine.select(&image)?;
                println!("Selected {image}");
            }
            "set_wallet" => {
                let address = value_as_non_empty_string(intent.command_args.get("address"));
                match address {
                    Some(address) => {
                        engine.set_wallet(Some(address.clone()));
                        println!("Wallet set to {address}");
                    }
                    None => println!("/wallet requires an address"),
                }
            }
            "set_text_model" => {
                let current = engine.text_model().to_string();
                let model =
                    value_as_non_empty_string(intent.command_args.get("model")).unwrap_or(current);
                engine.set_text_model(Some(model.clone()));
                println!("Text model set to {model}");
            }
            "set_confirmations" => {
                match intent.command_args.get("count").and_then(Value::as_u64) {
                    Some(count) => {
                        engine.set_confirmations(count);
                        println!("Waiting for {} confirmation(s)", engine.confirmations());
                    }
                    None => println!("/confirmations requires a number"),
                }
            }
            "show_transcript" => {
                for message in engine.transcript().messages() {
                    let role = match message.role {
                        ChatRole::System => "system",
                        ChatRole::User => "user",
                        ChatRole::Assistant => "assistant",
                    };
                    println!("[{role}] {}", first_line(&message.content, 100));
                }
            }
            "mint" => match engine.mint() {
                Ok(receipt) => {
                    println!(
                        "Mint confirmed: tx {} in block {} (#{})",
                        receipt.transaction_hash, receipt.block_hash, receipt.block_number
                    );
                }
                Err(err) => println!("Mint failed: {err:#}"),
            },
            "quit" => break,
            "unknown" => {
                let command = value_as_non_empty_string(intent.command_args.get("command"))
                    .unwrap_or_default();
                println!("Unknown command /{command}; try /help");
            }
            _ => {}
        }
    }

    engine.finish()?;
    Ok(())
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let mut engine = StudioEngine::new(
        &args.out,
        &events_path,
        Some(args.text_model.clone()),
        args.wallet.clone(),
        args.contract.clone(),
    )?;

    match engine.generate(&args.theme) {
        Ok(previews) => {
            if previews.is_empty() {
                println!("No candidates returned for that theme.");
            } else {
                print_previews(&previews, engine.active_image());
            }
            engine.finish()?;
            Ok(0)
        }
        Err(err) => {
            println!("Generation failed: {err:#}");
            engine.finish()?;
            Ok(1)
        }
    }
}

fn print_previews(previews: &[NftMetadata], active_image: Option<&str>) {
    for (idx, preview) in previews.iter().enumerate() {
        let marker = if active_image == Some(preview.image.as_str()) {
            " (selected)"
        } else {
            ""
        };
        let name = if preview.name.is_empty() {
            "(unnamed)"
        } else {
            preview.name.as_str()
        };
        println!("[{}] {name}  {}{marker}", idx + 1, preview.image);
    }
}

/// Resolves a `/select` argument: a 1-based preview index, or an image URL
/// taken verbatim.
fn resolve_select_target(previews: &[NftMetadata], target: &str) -> Option<String> {
    if let Ok(index) = target.parse::<usize>() {
        return previews
            .get(index.checked_sub(1)?)
            .map(|preview| preview.image.clone());
    }
    Some(target.to_string())
}

fn value_as_non_empty_string(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn first_line(text: &str, max_chars: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() <= max_chars {
        return line.to_string();
    }
    line.chars().take(max_chars).collect::<String>() + "…"
}
