//! Line-oriented control commands, read from stdin by button and alarm
//! integrations (or typed by hand).

use crate::models::lighting::{SceneId, ZoneId};
use crate::services::coordinator::Coordinator;
use log::{debug, info, warn};
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Brightness(i32),
    Warmth(i32),
    Scene(SceneId),
    Reset,
    Enable(ZoneId),
    Disable(ZoneId),
    Status(ZoneId),
    Cycle,
}

pub fn parse_command(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let verb = words.next().ok_or_else(|| "empty command".to_string())?;
    let arg = words.next();
    if let Some(extra) = words.next() {
        return Err(format!("unexpected argument: {}", extra));
    }

    let required = |what: &str| arg.ok_or_else(|| format!("`{}` requires {}", verb, what));
    let delta = |what: &str| -> Result<i32, String> {
        let raw = required(what)?;
        raw.trim_start_matches('+')
            .parse::<i32>()
            .map_err(|e| format!("invalid delta {:?}: {}", raw, e))
    };
    let none = || match arg {
        Some(a) => Err(format!("`{}` takes no argument (got {})", verb, a)),
        None => Ok(()),
    };

    match verb.to_ascii_lowercase().as_str() {
        "brightness" => Ok(Command::Brightness(delta("a delta")?)),
        "warmth" => Ok(Command::Warmth(delta("a delta in kelvin")?)),
        "scene" => Ok(Command::Scene(SceneId(required("a scene id")?.to_string()))),
        "reset" => none().map(|_| Command::Reset),
        "enable" => Ok(Command::Enable(ZoneId(required("a zone id")?.to_string()))),
        "disable" => Ok(Command::Disable(ZoneId(required("a zone id")?.to_string()))),
        "status" => Ok(Command::Status(ZoneId(required("a zone id")?.to_string()))),
        "cycle" => none().map(|_| Command::Cycle),
        other => Err(format!("unknown command: {}", other)),
    }
}

/// Run one command. `Ok(Some(_))` carries output for the caller to print.
pub fn execute(coordinator: &Coordinator, command: Command) -> Result<Option<String>, String> {
    match command {
        Command::Brightness(delta) => coordinator.adjust_brightness(delta),
        Command::Warmth(delta) => coordinator.adjust_warmth(delta),
        Command::Scene(scene) => coordinator.apply_scene(&scene).map_err(|e| e.to_string())?,
        Command::Reset => coordinator.reset(),
        Command::Enable(zone) => coordinator.enable_zone(&zone, true).map_err(|e| e.to_string())?,
        Command::Disable(zone) => coordinator.enable_zone(&zone, false).map_err(|e| e.to_string())?,
        Command::Status(zone) => {
            let status = coordinator.get_zone_status(&zone).map_err(|e| e.to_string())?;
            let json = serde_json::to_string(&status).map_err(|e| format!("serializing status failed: {}", e))?;
            return Ok(Some(json));
        }
        Command::Cycle => coordinator.run_cycle(),
    }
    Ok(None)
}

/// Process commands from `input` until EOF, writing status output to `output`.
pub fn serve<R: BufRead, W: Write>(coordinator: &Coordinator, input: R, mut output: W) -> io::Result<()> {
    for line in input.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        debug!("Control: {}", line);
        match parse_command(line).and_then(|cmd| execute(coordinator, cmd)) {
            Ok(Some(out)) => {
                writeln!(output, "{}", out)?;
                output.flush()?;
            }
            Ok(None) => {}
            Err(e) => warn!("Control command {:?} rejected: {}", line, e),
        }
    }
    Ok(())
}

/// Serve stdin on a background thread.
pub fn spawn_stdin_reader(coordinator: Arc<Coordinator>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new().name("control".to_string()).spawn(move || {
        let stdin = io::stdin();
        match serve(&coordinator, stdin.lock(), io::stdout()) {
            Ok(()) => info!("Control input closed"),
            Err(e) => warn!("Control input failed: {}", e),
        }
    })
}
