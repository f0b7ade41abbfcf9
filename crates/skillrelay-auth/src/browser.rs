//! Opening the system browser.

use std::process::{Command, Stdio};
use std::sync::Arc;

/// Opens a URL for the user. Returns `false` when no browser could be
/// launched, in which case the caller falls back to printing the URL.
pub type BrowserLauncher = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Launcher that hands the URL to the platform opener.
pub fn system_browser() -> BrowserLauncher {
    Arc::new(|url: &str| {
        let mut command = opener_command(url);
        match command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "could not launch browser");
                false
            }
        }
    })
}

/// Launcher for headless environments.
pub fn no_browser() -> BrowserLauncher {
    Arc::new(|_url: &str| false)
}

#[cfg(target_os = "macos")]
fn opener_command(url: &str) -> Command {
    let mut command = Command::new("open");
    command.arg(url);
    command
}

#[cfg(target_os = "windows")]
fn opener_command(url: &str) -> Command {
    let mut command = Command::new("cmd");
    command.args(["/C", "start", "", url]);
    command
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn opener_command(url: &str) -> Command {
    let mut command = Command::new("xdg-open");
    command.arg(url);
    command
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_browser_never_opens() {
        let launcher = no_browser();
        assert!(!launcher("https://example.com"));
    }

    #[test]
    fn opener_command_carries_url() {
        let command = opener_command("https://example.com/a?b=c");
        let args: Vec<_> = command.get_args().collect();
        assert!(args.iter().any(|a| *a == "https://example.com/a?b=c"));
    }
}
