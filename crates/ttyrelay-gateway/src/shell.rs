//! Turning configured [`ShellSettings`] into a concrete [`ShellConfig`].

use std::path::{Path, PathBuf};

use ttyrelay_core::config::{ShellSettings, DEFAULT_TERM};
use ttyrelay_terminal::ShellConfig;

use crate::error::{GatewayError, Result};

/// Value of `TERM_PROGRAM` in every spawned shell.
pub const TERM_PROGRAM: &str = "ttyrelay";

/// Shell config for a session, starting in `cwd` when given and otherwise in
/// the configured directory (or the host's own working directory).
pub fn shell_config(settings: &ShellSettings, cwd: Option<&Path>) -> Result<ShellConfig> {
    let cwd = match cwd {
        Some(dir) => dir.to_path_buf(),
        None => configured_cwd(settings)?,
    };
    let mut config = ShellConfig::new(resolve_program(settings), cwd)
        .with_args(settings.args.iter().cloned())
        .with_size(settings.cols, settings.rows)
        .with_env("TERM", DEFAULT_TERM)
        .with_env("COLORTERM", "truecolor")
        .with_env("TERM_PROGRAM", TERM_PROGRAM)
        .with_env("TERM_PROGRAM_VERSION", env!("CARGO_PKG_VERSION"));
    for (key, value) in &settings.env {
        config = config.with_env(key.clone(), value.clone());
    }
    Ok(config)
}

fn resolve_program(settings: &ShellSettings) -> String {
    if let Some(program) = settings.program.as_deref().filter(|p| !p.trim().is_empty()) {
        return program.to_string();
    }
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| default_shell().to_string())
}

fn default_shell() -> &'static str {
    if cfg!(windows) {
        "powershell.exe"
    } else {
        "bash"
    }
}

fn configured_cwd(settings: &ShellSettings) -> Result<PathBuf> {
    match settings.cwd.as_deref() {
        Some(dir) => Ok(expand_home(dir)),
        None => std::env::current_dir().map_err(GatewayError::NoWorkingDirectory),
    }
}

/// `~` and `~/…` relative to `$HOME`.
fn expand_home(dir: &str) -> PathBuf {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    match (dir, home) {
        ("~", Some(home)) => home,
        (d, Some(home)) if d.starts_with("~/") => home.join(&d[2..]),
        (d, _) => PathBuf::from(d),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ShellSettings {
        ShellSettings {
            program: Some("/bin/sh".into()),
            cwd: Some("/".into()),
            ..Default::default()
        }
    }

    #[test]
    fn terminal_identity_is_advertised() {
        let cfg = shell_config(&settings(), None).unwrap();
        assert_eq!(cfg.shell, "/bin/sh");
        assert_eq!(cfg.env["TERM"], "xterm-256color");
        assert_eq!(cfg.env["COLORTERM"], "truecolor");
        assert_eq!(cfg.env["TERM_PROGRAM"], "ttyrelay");
        assert!(cfg.env.contains_key("TERM_PROGRAM_VERSION"));
        assert_eq!((cfg.size.cols, cfg.size.rows), (80, 24));
    }

    #[test]
    fn configured_env_overrides_defaults() {
        let mut s = settings();
        s.env.insert("TERM".into(), "vt100".into());
        s.env.insert("EDITOR".into(), "vi".into());
        let cfg = shell_config(&s, None).unwrap();
        assert_eq!(cfg.term(), "vt100");
        assert_eq!(cfg.env["EDITOR"], "vi");
    }

    #[test]
    fn explicit_cwd_wins_over_configured() {
        let cfg = shell_config(&settings(), Some(Path::new("/tmp"))).unwrap();
        assert_eq!(cfg.cwd, PathBuf::from("/tmp"));
        let cfg = shell_config(&settings(), None).unwrap();
        assert_eq!(cfg.cwd, PathBuf::from("/"));
    }

    #[test]
    fn blank_program_falls_back() {
        let mut s = settings();
        s.program = Some("  ".into());
        assert!(!shell_config(&s, None).unwrap().shell.trim().is_empty());
    }
}
