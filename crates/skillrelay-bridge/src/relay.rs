//! Subprocess relay: hand a prompt to the external CLI and collect its answer.
//!
//! stdout is streamed line by line so activity can be reported while the
//! program runs. stderr is drained concurrently and only used when stdout is
//! empty. A timed-out child is killed; everything else is left to finish.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

use crate::activity::{ActivityThrottle, INITIAL_ACTIVITY, classify_line};

/// Receives activity strings as they are detected.
pub type ActivityCallback = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

static THINKING_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<thinking>.*?</thinking>\s*").expect("regex"));

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a relay produced no answer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("relay timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("relay program not found: {program}")]
    NotFound { program: String },

    #[error("relay failed: {reason}")]
    Failed { reason: String },
}

/// Canned texts posted in place of an answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayReplies {
    /// The program exited without printing anything useful.
    pub empty: String,
    pub timeout: String,
    pub not_found: String,
}

impl Default for RelayReplies {
    fn default() -> Self {
        Self {
            empty: "Processed, but no response generated.".to_string(),
            timeout: "Sorry, that took too long (5 min timeout). Try a simpler request?"
                .to_string(),
            not_found: "Error: Claude Code not found. Make sure 'claude' is in PATH.".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Relay trait
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRequest {
    pub prompt: String,
    /// Pass `--continue` so the program resumes its previous session.
    pub continue_session: bool,
}

/// Anything that turns a prompt into answer text.
#[async_trait]
pub trait Relay: Send + Sync {
    async fn run(
        &self,
        request: RelayRequest,
        on_activity: Option<ActivityCallback>,
    ) -> Result<String, RelayError>;

    /// Text posted to the user when [`Relay::run`] fails.
    fn failure_reply(&self, error: &RelayError) -> String {
        match error {
            RelayError::Timeout { .. } => RelayReplies::default().timeout,
            RelayError::NotFound { .. } => RelayReplies::default().not_found,
            RelayError::Failed { reason } => format!("Error: {}", truncate_chars(reason, 200)),
        }
    }
}

// ---------------------------------------------------------------------------
// CliRelay
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub program: String,
    pub base_args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Added on top of the inherited environment.
    pub env: HashMap<String, String>,
    pub timeout: Duration,
    /// How much of stderr makes it into an `Error: ...` reply.
    pub stderr_limit: usize,
    pub replies: RelayReplies,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            base_args: vec!["-p".to_string(), "--dangerously-skip-permissions".to_string()],
            working_dir: None,
            env: HashMap::new(),
            timeout: Duration::from_secs(300),
            stderr_limit: 500,
            replies: RelayReplies::default(),
        }
    }
}

/// Runs `<program> <base_args> [--continue] <prompt>`.
pub struct CliRelay {
    config: RelayConfig,
}

impl CliRelay {
    pub fn new(config: RelayConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    fn command(&self, request: &RelayRequest) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.base_args);
        if request.continue_session {
            cmd.arg("--continue");
        }
        cmd.arg(&request.prompt);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        cmd.envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Trim, fall back to stderr, strip thinking blocks, fall back to the
    /// empty-answer text.
    fn finish_output(&self, stdout: &str, stderr: &str) -> String {
        let mut response = stdout.trim().to_string();
        if response.is_empty() && !stderr.trim().is_empty() {
            response = format!("Error: {}", truncate_chars(stderr, self.config.stderr_limit));
        }
        let response = THINKING_BLOCK.replace_all(&response, "");
        let response = response.trim();
        if response.is_empty() {
            self.config.replies.empty.clone()
        } else {
            response.to_string()
        }
    }
}

#[async_trait]
impl Relay for CliRelay {
    async fn run(
        &self,
        request: RelayRequest,
        on_activity: Option<ActivityCallback>,
    ) -> Result<String, RelayError> {
        let program = self.config.program.clone();
        let timeout_secs = self.config.timeout.as_secs();

        if let Some(cb) = &on_activity {
            cb(INITIAL_ACTIVITY.to_string()).await;
        }

        let mut child = self.command(&request).spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RelayError::NotFound {
                    program: program.clone(),
                }
            } else {
                RelayError::Failed {
                    reason: format!("failed to spawn {program}: {e}"),
                }
            }
        })?;
        tracing::debug!(program = %program, continue_session = request.continue_session, "relay started");

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(RelayError::Failed {
                reason: "child pipes were not captured".to_string(),
            });
        };

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Err(e) = BufReader::new(stderr).read_to_string(&mut buf).await {
                tracing::debug!(error = %e, "failed to read relay stderr");
            }
            buf
        });

        let collect = async {
            let mut lines = BufReader::new(stdout).lines();
            let mut output = String::new();
            let mut throttle = ActivityThrottle::new(Instant::now());
            while let Some(line) = lines.next_line().await? {
                if let Some(activity) = classify_line(&line)
                    && throttle.offer(activity, Instant::now())
                {
                    tracing::debug!(activity, "relay activity");
                    if let Some(cb) = &on_activity {
                        cb(activity.to_string()).await;
                    }
                }
                output.push_str(&line);
                output.push('\n');
            }
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((output, status))
        };

        let outcome = tokio::time::timeout(self.config.timeout, collect).await;
        let (stdout, status) = match outcome {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => {
                stderr_task.abort();
                return Err(RelayError::Failed {
                    reason: format!("reading relay output: {e}"),
                });
            }
            Err(_) => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "failed to kill timed-out relay");
                }
                stderr_task.abort();
                tracing::warn!(program = %program, timeout_secs, "relay timed out");
                return Err(RelayError::Timeout { secs: timeout_secs });
            }
        };

        let stderr = stderr_task.await.unwrap_or_default();
        if !status.success() {
            tracing::debug!(code = ?status.code(), "relay exited unsuccessfully");
        }
        Ok(self.finish_output(&stdout, &stderr))
    }

    fn failure_reply(&self, error: &RelayError) -> String {
        match error {
            RelayError::Timeout { .. } => self.config.replies.timeout.clone(),
            RelayError::NotFound { .. } => self.config.replies.not_found.clone(),
            RelayError::Failed { reason } => format!("Error: {}", truncate_chars(reason, 200)),
        }
    }
}

/// The first `limit` characters of `s`.
pub fn truncate_chars(s: &str, limit: usize) -> &str {
    match s.char_indices().nth(limit) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn sh(script: &str) -> CliRelay {
        CliRelay::new(RelayConfig {
            program: "sh".to_string(),
            base_args: vec!["-c".to_string(), script.to_string()],
            timeout: Duration::from_secs(5),
            ..RelayConfig::default()
        })
    }

    fn request(prompt: &str) -> RelayRequest {
        RelayRequest {
            prompt: prompt.to_string(),
            continue_session: false,
        }
    }

    #[test]
    fn thinking_blocks_are_stripped() {
        let relay = CliRelay::new(RelayConfig::default());
        let out = relay.finish_output("<thinking>\nhmm\n</thinking>\n  The answer.\n", "");
        assert_eq!(out, "The answer.");
    }

    #[test]
    fn empty_output_uses_stderr_then_fallback() {
        let relay = CliRelay::new(RelayConfig {
            stderr_limit: 5,
            ..RelayConfig::default()
        });
        assert_eq!(relay.finish_output("  \n", "boom and more"), "Error: boom ");
        assert_eq!(
            relay.finish_output("<thinking>x</thinking>", ""),
            "Processed, but no response generated."
        );
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn failure_replies_are_canned() {
        let relay = CliRelay::new(RelayConfig::default());
        assert!(relay
            .failure_reply(&RelayError::Timeout { secs: 300 })
            .contains("took too long"));
        assert!(relay
            .failure_reply(&RelayError::NotFound {
                program: "claude".into()
            })
            .contains("PATH"));
        assert_eq!(
            relay.failure_reply(&RelayError::Failed {
                reason: "exit 2".into()
            }),
            "Error: exit 2"
        );
    }

    #[tokio::test]
    async fn missing_program_is_not_found() {
        let relay = CliRelay::new(RelayConfig {
            program: "definitely-not-a-real-program-9f3a".to_string(),
            ..RelayConfig::default()
        });
        let err = relay.run(request("hi"), None).await.unwrap_err();
        assert!(matches!(err, RelayError::NotFound { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn collects_stdout_and_passes_prompt() {
        // With `sh -c`, the prompt lands in $0.
        let relay = sh("echo \"got: $0\"");
        let out = relay.run(request("hello"), None).await.unwrap();
        assert_eq!(out, "got: hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn continue_flag_precedes_prompt() {
        let relay = sh("echo \"$0 $1\"");
        let out = relay
            .run(
                RelayRequest {
                    prompt: "again".to_string(),
                    continue_session: true,
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(out, "--continue again");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stderr_used_when_stdout_empty() {
        let relay = sh("echo oops >&2; exit 1");
        let out = relay.run(request("x"), None).await.unwrap();
        assert_eq!(out, "Error: oops");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_program_times_out() {
        let relay = CliRelay::new(RelayConfig {
            program: "sh".to_string(),
            base_args: vec!["-c".to_string(), "sleep 5".to_string()],
            timeout: Duration::from_millis(200),
            ..RelayConfig::default()
        });
        let started = Instant::now();
        let err = relay.run(request("x"), None).await.unwrap_err();
        assert_eq!(err, RelayError::Timeout { secs: 0 });
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn env_is_passed_through() {
        let mut env = HashMap::new();
        env.insert("CRM_BRIDGE_TOKEN".to_string(), "secret".to_string());
        let relay = CliRelay::new(RelayConfig {
            program: "sh".to_string(),
            base_args: vec!["-c".to_string(), "echo $CRM_BRIDGE_TOKEN".to_string()],
            env,
            timeout: Duration::from_secs(5),
            ..RelayConfig::default()
        });
        assert_eq!(relay.run(request("x"), None).await.unwrap(), "secret");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn activity_is_reported() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cb: ActivityCallback = {
            let seen = Arc::clone(&seen);
            Arc::new(move |activity: String| {
                let seen = Arc::clone(&seen);
                Box::pin(async move {
                    seen.lock().unwrap().push(activity);
                })
            })
        };
        let relay = sh("sleep 0.7; echo 'Let me read the file'; echo done");
        let out = relay.run(request("x"), Some(cb)).await.unwrap();
        assert_eq!(out, "Let me read the file\ndone");

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], INITIAL_ACTIVITY);
        assert_eq!(seen[1], "📖 Reading files...");
        assert_eq!(seen.len(), 2);
    }
}
