//! Installation and authentication probes for the wrapped CLIs.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use super::types::{AuthStatus, BackendKind, InstallStatus};

const CLI_VERSION_TIMEOUT: Duration = Duration::from_secs(3);

pub fn binary_name(kind: BackendKind) -> &'static str {
    match kind {
        BackendKind::Claude => "claude",
        BackendKind::Codex => "codex",
    }
}

#[cfg(not(target_os = "windows"))]
fn common_paths(kind: BackendKind, home: &Path) -> Vec<PathBuf> {
    let binary = binary_name(kind);
    let mut paths = vec![home.join(".local/bin").join(binary)];
    if kind == BackendKind::Claude {
        paths.push(home.join(".claude/local/bin/claude"));
    }
    paths.push(PathBuf::from("/usr/local/bin").join(binary));
    #[cfg(target_os = "macos")]
    paths.push(PathBuf::from("/opt/homebrew/bin").join(binary));
    paths
}

#[cfg(target_os = "windows")]
fn common_paths(kind: BackendKind, home: &Path) -> Vec<PathBuf> {
    let binary = binary_name(kind);
    let mut paths = vec![home.join(".local\\bin").join(format!("{binary}.exe"))];
    if kind == BackendKind::Claude {
        paths.push(home.join(".claude\\local\\claude.exe"));
    }
    if let Some(app_data) = std::env::var_os("APPDATA") {
        paths.push(PathBuf::from(app_data).join("npm").join(format!("{binary}.cmd")));
    }
    paths
}

/// Configured override, then well-known install locations, then `PATH`.
pub fn resolve_cli(kind: BackendKind, configured: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = configured {
        if path.is_file() {
            return Some(path.to_path_buf());
        }
        log::warn!("configured {kind} CLI path {} does not exist", path.display());
    }

    if let Some(home) = dirs::home_dir() {
        if let Some(found) = common_paths(kind, &home).into_iter().find(|p| p.is_file()) {
            return Some(found);
        }
    }

    which::which(binary_name(kind)).ok()
}

/// Run a CLI with no stdin, giving up after `limit`.
pub async fn run_with_timeout(program: &Path, args: &[&str], limit: Duration) -> Option<Output> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        cmd.creation_flags(super::utils::CREATE_NO_WINDOW);
    }

    match timeout(limit, cmd.output()).await {
        Ok(Ok(output)) => Some(output),
        Ok(Err(e)) => {
            log::debug!("failed to run {}: {e}", program.display());
            None
        }
        Err(_) => {
            log::debug!("{} {:?} timed out after {limit:?}", program.display(), args);
            None
        }
    }
}

async fn cli_version(path: &Path) -> Option<String> {
    run_with_timeout(path, &["--version"], CLI_VERSION_TIMEOUT)
        .await
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .filter(|v| !v.is_empty())
}

pub async fn detect_install(kind: BackendKind, configured: Option<&Path>) -> InstallStatus {
    let Some(path) = resolve_cli(kind, configured) else {
        return InstallStatus {
            installed: false,
            version: None,
            path: None,
        };
    };
    InstallStatus {
        installed: true,
        version: cli_version(&path).await,
        path: Some(path.to_string_lossy().to_string()),
    }
}

#[cfg(target_os = "macos")]
fn claude_oauth_config(home: &Path) -> PathBuf {
    home.join("Library/Application Support/Claude/config.json")
}

#[cfg(target_os = "windows")]
fn claude_oauth_config(home: &Path) -> PathBuf {
    home.join("AppData").join("Roaming").join("Claude").join("config.json")
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn claude_oauth_config(home: &Path) -> PathBuf {
    home.join(".config/Claude/config.json")
}

/// Where Claude credentials were found without running the CLI.
fn claude_credential_source(home: Option<&Path>, api_key: Option<String>) -> Option<&'static str> {
    if api_key.is_some_and(|k| !k.is_empty()) {
        return Some("api_key");
    }
    let home = home?;
    let has_oauth = std::fs::read_to_string(claude_oauth_config(home))
        .map(|content| content.contains("\"oauth:tokenCache\""))
        .unwrap_or(false);
    if has_oauth {
        return Some("oauth");
    }
    if home.join(".claude").join(".credentials.json").exists() {
        return Some("credentials_file");
    }
    None
}

fn codex_credential_source(home: Option<&Path>, api_key: Option<String>) -> Option<&'static str> {
    if api_key.is_some_and(|k| !k.is_empty()) {
        return Some("api_key");
    }
    if home?.join(".codex").join("auth.json").is_file() {
        return Some("auth_file");
    }
    None
}

pub async fn check_claude_auth(cli: Option<&Path>, probe_timeout: Duration) -> AuthStatus {
    let home = dirs::home_dir();
    if let Some(source) =
        claude_credential_source(home.as_deref(), std::env::var("ANTHROPIC_API_KEY").ok())
    {
        return authenticated(source);
    }

    // Credentials stored somewhere we don't know about: ask the CLI itself.
    if let Some(path) = resolve_cli(BackendKind::Claude, cli) {
        let probe = run_with_timeout(&path, &["-p", "hi", "--model", "haiku"], probe_timeout).await;
        if probe.is_some_and(|o| o.status.success() && !o.stdout.is_empty()) {
            return authenticated("cli_probe");
        }
    }
    AuthStatus {
        authenticated: false,
        method: None,
    }
}

pub async fn check_codex_auth(cli: Option<&Path>, probe_timeout: Duration) -> AuthStatus {
    let home = dirs::home_dir();
    if let Some(source) =
        codex_credential_source(home.as_deref(), std::env::var("OPENAI_API_KEY").ok())
    {
        return authenticated(source);
    }

    if let Some(path) = resolve_cli(BackendKind::Codex, cli) {
        let probe = run_with_timeout(
            &path,
            &[
                "--sandbox",
                "read-only",
                "exec",
                "--json",
                "--skip-git-repo-check",
                "Reply with exactly: OK",
            ],
            probe_timeout,
        )
        .await;
        if probe.is_some_and(|o| o.status.success()) {
            return authenticated("cli_probe");
        }
    }
    AuthStatus {
        authenticated: false,
        method: None,
    }
}

fn authenticated(method: &str) -> AuthStatus {
    AuthStatus {
        authenticated: true,
        method: Some(method.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_wins_over_files() {
        assert_eq!(claude_credential_source(None, Some("sk-ant".into())), Some("api_key"));
        assert_eq!(claude_credential_source(None, Some(String::new())), None);
        assert_eq!(codex_credential_source(None, Some("sk-proj".into())), Some("api_key"));
    }

    #[test]
    fn claude_credentials_detected_on_disk() {
        let home = tempfile::tempdir().unwrap();
        assert_eq!(claude_credential_source(Some(home.path()), None), None);

        let oauth = claude_oauth_config(home.path());
        std::fs::create_dir_all(oauth.parent().unwrap()).unwrap();
        std::fs::write(&oauth, r#"{"theme": "dark"}"#).unwrap();
        assert_eq!(claude_credential_source(Some(home.path()), None), None);

        std::fs::write(&oauth, r#"{"oauth:tokenCache": "abc"}"#).unwrap();
        assert_eq!(claude_credential_source(Some(home.path()), None), Some("oauth"));
    }

    #[test]
    fn legacy_claude_credentials_file_counts() {
        let home = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(home.path().join(".claude")).unwrap();
        std::fs::write(home.path().join(".claude/.credentials.json"), "{}").unwrap();
        assert_eq!(
            claude_credential_source(Some(home.path()), None),
            Some("credentials_file")
        );
    }

    #[test]
    fn codex_auth_file_detected() {
        let home = tempfile::tempdir().unwrap();
        assert_eq!(codex_credential_source(Some(home.path()), None), None);
        std::fs::create_dir_all(home.path().join(".codex")).unwrap();
        std::fs::write(home.path().join(".codex/auth.json"), "{}").unwrap();
        assert_eq!(codex_credential_source(Some(home.path()), None), Some("auth_file"));
    }

    #[test]
    fn configured_path_is_preferred_when_it_exists() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(
            resolve_cli(BackendKind::Codex, Some(file.path())),
            Some(file.path().to_path_buf())
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_with_timeout_gives_up_on_hung_process() {
        let started = std::time::Instant::now();
        let output = run_with_timeout(
            Path::new("sh"),
            &["-c", "sleep 5"],
            Duration::from_millis(100),
        )
        .await;
        assert!(output.is_none());
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
