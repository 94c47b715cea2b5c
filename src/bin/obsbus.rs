use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use obsbus::{
    Block, BlockConfig, Command, Completion, CoreEvent, Event, EventContext, Listener, PeerKind,
};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "6170";
const PEER: &str = "device";

type Outcome = Rc<RefCell<Option<Completion>>>;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("obsbus")
        .version("0.1.0")
        .author("Observatory Systems Engineering Team")
        .about("🔭 Observatory bus client - inspect and drive devices speaking the value protocol")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Device host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Device port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("timeout")
                .short("t")
                .long("timeout")
                .value_name("SECONDS")
                .help("Seconds to wait for a reply")
                .takes_value(true)
                .default_value("5")
                .global(true)
                .validator(|v| match v.parse::<u64>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Timeout must be a whole number of seconds".into()),
                }),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Log protocol traffic")
                .global(true),
        )
        .subcommand(SubCommand::with_name("values").about("📋 List every value the device exposes"))
        .subcommand(
            SubCommand::with_name("get")
                .about("🔎 Print one value")
                .arg(Arg::with_name("name").required(true).help("Value name")),
        )
        .subcommand(
            SubCommand::with_name("set")
                .about("✏️  Change a writable value")
                .arg(Arg::with_name("name").required(true).help("Value name"))
                .arg(
                    Arg::with_name("op")
                        .long("op")
                        .takes_value(true)
                        .possible_values(&["=", "+", "-"])
                        .default_value("=")
                        .help("Assignment operator"),
                )
                .arg(
                    Arg::with_name("value")
                        .required(true)
                        .multiple(true)
                        .allow_hyphen_values(true)
                        .help("New value, one or more tokens"),
                ),
        )
        .subcommand(
            SubCommand::with_name("cmd")
                .about("⚙️  Send a raw command")
                .arg(
                    Arg::with_name("line")
                        .required(true)
                        .multiple(true)
                        .allow_hyphen_values(true)
                        .help("Opcode and parameters"),
                ),
        )
        .subcommand(
            SubCommand::with_name("watch")
                .about("👀 Print value changes as they arrive (Ctrl+C to stop)"),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse::<u16>()?;
    let timeout = Duration::from_secs(matches.value_of("timeout").unwrap_or("5").parse()?);
    let verbose = matches.is_present("verbose");

    tracing_subscriber::fmt()
        .with_max_level(if verbose {
            tracing::Level::TRACE
        } else {
            tracing::Level::WARN
        })
        .init();

    let config = BlockConfig {
        name: "obsbus".to_string(),
        idle_timeout_ms: 100,
        ..BlockConfig::default()
    };
    let mut block = Block::new(config);
    let address = format!("{}:{}", host, port);
    block.connect(PEER, &address, PeerKind::Device);
    if verbose {
        println!("{} {}", "Connecting to".dimmed(), address);
    }

    match matches.subcommand() {
        ("values", _) => handle_values(&mut block, timeout).await?,
        ("get", Some(sub)) => handle_get(&mut block, sub, timeout).await?,
        ("set", Some(sub)) => handle_set(&mut block, sub, timeout).await?,
        ("cmd", Some(sub)) => handle_cmd(&mut block, sub, timeout).await?,
        ("watch", _) => handle_watch(&mut block, timeout).await?,
        _ => println!("{}", "No command specified. Use --help for usage information.".yellow()),
    }

    block.shutdown();
    Ok(())
}

/// Queue `command` and tick until its completion arrives or `timeout` passes.
async fn execute(
    block: &mut Block,
    command: Command,
    timeout: Duration,
) -> Result<Completion, Box<dyn std::error::Error>> {
    let outcome: Outcome = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&outcome);
    block.queue_command_to(
        PEER,
        command.on_complete(move |completion| *slot.borrow_mut() = Some(completion.clone())),
    )?;

    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        block.tick().await;
        if let Some(completion) = outcome.borrow_mut().take() {
            return Ok(completion);
        }
    }
    eprintln!("{} No reply within {:?}", "⏰".yellow(), timeout);
    Err("command timeout".into())
}

fn report(completion: &Completion) -> bool {
    match &completion.status {
        obsbus::CommandStatus::Ok => true,
        obsbus::CommandStatus::Failed(reason) => {
            eprintln!(
                "{} {} failed ({}): {}",
                "❌".red(),
                completion.line.bright_white(),
                completion.code,
                reason.bright_red()
            );
            false
        }
    }
}

async fn handle_values(block: &mut Block, timeout: Duration) -> Result<(), Box<dyn std::error::Error>> {
    let completion = execute(block, Command::new("info"), timeout).await?;
    if !report(&completion) {
        return Ok(());
    }
    let Some(conn) = block.connection_by_name(PEER) else {
        return Err("device connection lost".into());
    };

    println!("{}", format!("📋 Values of {}", PEER).bright_blue().bold());
    for (name, mirror) in conn.mirrors() {
        let marker = if mirror.is_writable() { "W" } else { " " };
        println!(
            "  {} {:<24} {:<10} {}",
            marker.bright_yellow(),
            name.bright_white(),
            mirror.value_type().name().dimmed(),
            mirror.display_value().bright_cyan()
        );
    }
    Ok(())
}

async fn handle_get(
    block: &mut Block,
    matches: &ArgMatches<'_>,
    timeout: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let name = matches.value_of("name").unwrap_or_default();
    let completion = execute(block, Command::new("info"), timeout).await?;
    if !report(&completion) {
        return Ok(());
    }
    match block.connection_by_name(PEER).and_then(|c| c.mirror(name)) {
        Some(mirror) => println!("{} = {}", name.bright_white(), mirror.display_value().bright_cyan()),
        None => eprintln!("{} Unknown value {}", "❌".red(), name.bright_white()),
    }
    Ok(())
}

async fn handle_set(
    block: &mut Block,
    matches: &ArgMatches<'_>,
    timeout: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let name = matches.value_of("name").unwrap_or_default();
    let op = matches.value_of("op").unwrap_or("=");
    let tokens: Vec<&str> = matches.values_of("value").map(Iterator::collect).unwrap_or_default();

    let mut command = Command::new("X").param(name).param(op);
    for token in &tokens {
        command = command.param(token);
    }
    let completion = execute(block, command, timeout).await?;
    if report(&completion) {
        println!(
            "{} {} {} {}",
            "✅".green(),
            name.bright_white(),
            op,
            tokens.join(" ").bright_cyan()
        );
    }
    Ok(())
}

async fn handle_cmd(
    block: &mut Block,
    matches: &ArgMatches<'_>,
    timeout: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let line = matches
        .values_of("line")
        .map(|v| v.collect::<Vec<_>>().join(" "))
        .unwrap_or_default();
    let Some(command) = Command::from_line(&line) else {
        return Err("empty command".into());
    };
    let completion = execute(block, command, timeout).await?;
    if report(&completion) {
        println!("{} {}", "✅".green(), "Command completed".bright_green());
    }
    Ok(())
}

/// Prints every replicated value change.
struct Printer;

impl Listener for Printer {
    fn on_event(&mut self, event: &Event, ctx: &mut EventContext<'_>) {
        match event {
            Event::Core(CoreEvent::ValueChanged { conn, name }) => {
                if let Some(mirror) = ctx.connection(*conn).and_then(|c| c.mirror(name)) {
                    println!("{:<24} {}", name.bright_white(), mirror.display_value().bright_cyan());
                }
            }
            Event::Core(CoreEvent::StatusChanged { new, .. }) => {
                println!("{:<24} {}", "status".bright_yellow(), new);
            }
            Event::Core(CoreEvent::Message { message, .. }) => {
                println!("{} {}: {}", "💬".normal(), message.origin.dimmed(), message.text);
            }
            Event::Core(CoreEvent::ConnectionClosed { reason, .. }) => {
                eprintln!("{} Connection closed: {:?}", "🔌".yellow(), reason);
            }
            _ => {}
        }
    }
}

async fn handle_watch(block: &mut Block, timeout: Duration) -> Result<(), Box<dyn std::error::Error>> {
    block.add_listener(Printer);
    let completion = execute(block, Command::new("info"), timeout).await?;
    if !report(&completion) {
        return Ok(());
    }
    println!("{}", "👀 Watching value changes (Press Ctrl+C to stop)...".bright_blue().bold());

    tokio::select! {
        _ = watch_loop(block) => {}
        _ = tokio::signal::ctrl_c() => println!("\n{}", "Stopped".dimmed()),
    }
    Ok(())
}

async fn watch_loop(block: &mut Block) {
    while block.connection_by_name(PEER).is_some() {
        block.tick().await;
    }
}
