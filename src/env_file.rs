//! `.env` support: `--env-file <path>` on the command line, otherwise `./.env`
//! when present. Variables already set in the process environment win.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

#[derive(Debug, PartialEq, Eq)]
pub struct LoadedEnvFile {
    pub path: PathBuf,
    /// Named with `--env-file` rather than picked up from the working directory.
    pub explicit: bool,
}

/// Parse the command line and load the selected env file, if any.
pub fn load_from_cli() -> Result<Option<LoadedEnvFile>, String> {
    let explicit = env_file_arg(std::env::args_os().skip(1))?;
    let (path, explicit) = match explicit {
        Some(path) => {
            if !path.is_file() {
                return Err(format!("env file not found: {}", path.display()));
            }
            (path, true)
        }
        None => {
            let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
            let path = cwd.join(".env");
            if !path.is_file() {
                return Ok(None);
            }
            (path, false)
        }
    };
    apply(&path)?;
    Ok(Some(LoadedEnvFile { path, explicit }))
}

fn env_file_arg<I: IntoIterator<Item = OsString>>(args: I) -> Result<Option<PathBuf>, String> {
    let mut args = args.into_iter();
    let mut found: Option<PathBuf> = None;
    while let Some(arg) = args.next() {
        let arg = arg
            .into_string()
            .map_err(|_| "argument contains invalid UTF-8".to_string())?;
        let value = if arg == "--env-file" {
            args.next()
                .map(PathBuf::from)
                .ok_or_else(|| "`--env-file` requires a path argument".to_string())?
        } else if let Some(v) = arg.strip_prefix("--env-file=") {
            if v.is_empty() {
                return Err("`--env-file` requires a path argument".to_string());
            }
            PathBuf::from(v)
        } else if arg == "--" {
            break;
        } else {
            return Err(format!("unrecognised argument: {}", arg));
        };
        if found.replace(value).is_some() {
            return Err("`--env-file` provided more than once".to_string());
        }
    }
    Ok(found)
}

fn apply(path: &Path) -> Result<(), String> {
    let raw = std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    for (key, value) in parse(&raw).map_err(|e| format!("{}:{}", path.display(), e))? {
        if std::env::var_os(&key).is_none() {
            // SAFETY: runs in main before any other thread is started.
            unsafe {
                std::env::set_var(key, value);
            }
        }
    }
    Ok(())
}

/// Parse env file contents into assignments. Errors carry the 1-based line number.
pub fn parse(raw: &str) -> Result<Vec<(String, String)>, String> {
    let mut vars = Vec::new();
    for (index, line) in raw.lines().enumerate() {
        if let Some(pair) = parse_line(line).map_err(|e| format!("{}: {}", index + 1, e))? {
            vars.push(pair);
        }
    }
    Ok(vars)
}

fn parse_line(line: &str) -> Result<Option<(String, String)>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);
    let (key, value) = line
        .split_once('=')
        .ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();
    if key.is_empty() {
        return Err("environment variable name cannot be empty".to_string());
    }
    if key.contains(char::is_whitespace) {
        return Err(format!("environment variable name contains whitespace: {}", key));
    }
    Ok(Some((key.to_string(), parse_value(value.trim())?)))
}

fn parse_value(value: &str) -> Result<String, String> {
    let (quote, body) = match value.chars().next() {
        Some(q @ ('"' | '\'')) => (q, &value[1..]),
        _ => {
            let bare = value.split('#').next().unwrap_or_default();
            return Ok(bare.trim_end().to_string());
        }
    };

    let mut out = String::new();
    let mut chars = body.char_indices();
    while let Some((i, ch)) = chars.next() {
        if ch == quote {
            let rest = body[i + ch.len_utf8()..].trim();
            if rest.is_empty() || rest.starts_with('#') {
                return Ok(out);
            }
            return Err("unexpected characters after closing quote".to_string());
        }
        // single quotes are literal; double quotes understand backslash escapes
        if ch == '\\' && quote == '"' {
            let Some((_, escaped)) = chars.next() else {
                break;
            };
            out.push(match escaped {
                'n' => '\n',
                'r' => '\r',
                't' => '\t',
                other => other,
            });
        } else {
            out.push(ch);
        }
    }
    Err(format!("unterminated {} value", if quote == '"' { "double-quoted" } else { "single-quoted" }))
}
