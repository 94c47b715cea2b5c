use clap::{App, Arg};
use colored::*;
use obsbus::{
    BaseType, Block, BlockConfig, CommandOutcome, Device, DeviceStatus, MessageType, Value,
    ValueSet,
};
use tracing::{error, info, warn};

const POSITION: &str = "FOC_POS";
const TARGET: &str = "FOC_TAR";
const MODE: &str = "FOC_MODE";
const WINDOW: &str = "WIN";

/// Steps covered per reactor pass while moving.
const STEP: i32 = 25;
const TRAVEL: (i32, i32) = (-5000, 5000);

/// Simulated focuser: moves `FOC_POS` toward `FOC_TAR` a few steps per pass.
#[derive(Debug, Default)]
struct Focuser {
    moving: bool,
}

impl Focuser {
    fn target(values: &ValueSet) -> Option<i32> {
        values.get(TARGET)?.as_f64().map(|t| t.round() as i32)
    }
}

impl Device for Focuser {
    fn set_value(&mut self, old: &Value, new: &Value) -> Result<(), String> {
        if old.name() == TARGET {
            let target = new.as_f64().unwrap_or_default();
            if target < f64::from(TRAVEL.0) || target > f64::from(TRAVEL.1) {
                return Err(format!(
                    "target {} outside travel {}..{}",
                    target, TRAVEL.0, TRAVEL.1
                ));
            }
            info!("🎯 New focuser target {}", target);
        }
        Ok(())
    }

    fn command(&mut self, opcode: &str, _params: &str, values: &mut ValueSet) -> CommandOutcome {
        match opcode {
            "home" => {
                info!("🏠 Homing focuser");
                match values.get_mut(TARGET).map(|v| v.set_double(0.0)) {
                    Some(Ok(())) => CommandOutcome::Ok,
                    Some(Err(e)) => CommandOutcome::Failed {
                        code: obsbus::protocol::REPLY_E_HW,
                        reason: e.to_string(),
                    },
                    None => CommandOutcome::Unknown,
                }
            }
            "stop" => {
                let position = values.get(POSITION).and_then(Value::as_f64).unwrap_or_default();
                if let Some(target) = values.get_mut(TARGET) {
                    let _ = target.set_double(position);
                }
                CommandOutcome::Ok
            }
            _ => CommandOutcome::Unknown,
        }
    }

    fn idle(&mut self, values: &mut ValueSet) {
        let Some(target) = Self::target(values) else {
            return;
        };
        let Some(position) = values.get_mut(POSITION) else {
            return;
        };
        let current = position.as_i64().unwrap_or_default() as i32;
        self.moving = current != target;
        if !self.moving {
            return;
        }
        let next = current + (target - current).clamp(-STEP, STEP);
        if let Err(e) = position.set_integer(next) {
            warn!("cannot move focuser: {}", e);
        }
    }

    fn status(&self) -> Option<(u32, u32)> {
        let bits = if self.moving {
            DeviceStatus::MOVING
        } else {
            DeviceStatus::MOVE_IDLE
        };
        Some((DeviceStatus::MOVE_MASK, bits))
    }
}

fn create_values(block: &mut Block) -> obsbus::Result<()> {
    block.create_value(Value::integer(POSITION, "focuser position", 0))?;
    block.create_value(Value::double(TARGET, "focuser target", 0.0).writable())?;
    block.create_value(Value::selection(MODE, "focusing mode", &["manual", "auto", "temperature"]).writable())?;
    block.create_value(Value::rectangle(WINDOW, "readout window", BaseType::Integer).writable())?;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("obsbus-device")
        .version("0.1.0")
        .author("Observatory Systems Engineering Team")
        .about("🔭 Simulated focuser daemon speaking the value protocol")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("listen")
                .short("l")
                .long("listen")
                .value_name("ADDRESS")
                .help("Address to accept peers on")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("name")
                .short("n")
                .long("name")
                .value_name("NAME")
                .help("Device name")
                .takes_value(true),
        )
        .get_matches();

    let mut config = match matches.value_of("config") {
        Some(path) => BlockConfig::from_json_file(path)?,
        None => BlockConfig {
            name: "FOC".to_string(),
            ..BlockConfig::default()
        },
    };
    if let Some(listen) = matches.value_of("listen") {
        config.listen = Some(listen.to_string());
    }
    if let Some(name) = matches.value_of("name") {
        config.name = name.to_string();
    }
    config.validate()?;

    let level = config
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    println!("{}", format!("🔭 {} focuser simulator", config.name).bright_blue().bold());
    println!("{}", "=".repeat(32).dimmed());

    let listen = config
        .listen
        .clone()
        .unwrap_or_else(|| "127.0.0.1:6170".to_string());
    let mut block = Block::new(config);
    create_values(&mut block)?;
    block.set_device(Focuser::default());
    let address = block.listen(&listen)?;
    println!("{} Listening on {}", "✅".green(), address.to_string().bright_cyan());

    tokio::select! {
        _ = block.run() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("cannot wait for Ctrl+C: {}", e);
            }
            println!("\n{}", "🛑 Shutting down".yellow());
        }
    }

    block.broadcast_message(MessageType::Info, "shutting down");
    block.shutdown();
    info!("focuser simulator stopped");
    Ok(())
}
