use slot_bridge::config::BridgeConfig;
use slot_bridge::scripting::HostRuntime;
use slot_bridge::{BridgeError, BridgeResult};
use std::path::PathBuf;
use std::time::Duration;

const USAGE: &str = "usage: slot_bridge <script> [--config <file>] [--frames <n>] [--wait-ms <ms>]";

struct Args {
    script: PathBuf,
    config: Option<PathBuf>,
    frames: u64,
    wait: Duration,
}

fn parse_args() -> Result<Args, String> {
    let mut script = None;
    let mut config = None;
    let mut frames = 1;
    let mut wait = Duration::from_secs(5);

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config = Some(PathBuf::from(args.next().ok_or(USAGE)?)),
            "--frames" => {
                frames = args
                    .next()
                    .and_then(|n| n.parse().ok())
                    .ok_or("--frames expects a non-negative integer")?
            }
            "--wait-ms" => {
                let ms: u64 = args
                    .next()
                    .and_then(|n| n.parse().ok())
                    .ok_or("--wait-ms expects a non-negative integer")?;
                wait = Duration::from_millis(ms);
            }
            _ if script.is_none() && !arg.starts_with("--") => script = Some(PathBuf::from(arg)),
            _ => return Err(USAGE.to_string()),
        }
    }

    Ok(Args {
        script: script.ok_or(USAGE)?,
        config,
        frames,
        wait,
    })
}

fn run(args: Args) -> BridgeResult<()> {
    let mut config = match &args.config {
        Some(path) => BridgeConfig::from_file(path)?,
        None => BridgeConfig::load_or_default(),
    };
    config.apply_env_overrides();
    config.logging.install();

    let mut runtime = HostRuntime::new(config)?;
    let result = (|| -> BridgeResult<()> {
        runtime.load_file(&args.script)?;
        for _ in 0..args.frames {
            runtime.tick()?;
        }
        runtime.run_until_idle(args.wait)?;
        Ok(())
    })();

    if let Err(BridgeError::Script(_)) = &result {
        eprintln!("{}", runtime.errors().render());
    }
    runtime.teardown();
    result
}

fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{}", message);
            std::process::exit(2);
        }
    };

    if let Err(e) = run(args) {
        eprintln!("Bridge failed: {}", e);
        std::process::exit(1);
    }
}
