//! Transport that shells out to the daemon's CLI.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::VecDeque;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};

use tailtray_localapi::FrameSplitter;

use super::{CommandGateway, FrameStream, LoginFlags, UpFlags};
use crate::config::TrayConfig;
use crate::error::{Result, TrayError};
use crate::extract::extract_json_object;
use crate::types::Preference;

static RE_LOGIN_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(https?://[A-Za-z0-9./?=&_\-]+)").unwrap());

const READ_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct CliGateway {
    binary: String,
    timeout: Duration,
    login_timeout: Duration,
    privilege_helper: Option<String>,
}

impl CliGateway {
    pub fn new(binary: impl Into<String>) -> Self {
        let defaults = TrayConfig::default();
        Self {
            binary: binary.into(),
            timeout: defaults.command_timeout(),
            login_timeout: defaults.connect_timeout(),
            privilege_helper: defaults.privilege_helper().map(str::to_string),
        }
    }

    pub fn from_config(config: &TrayConfig) -> Self {
        Self {
            binary: config.cli_binary.clone(),
            timeout: config.command_timeout(),
            login_timeout: config.connect_timeout(),
            privilege_helper: config.privilege_helper().map(str::to_string),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_privilege_helper(mut self, helper: Option<String>) -> Self {
        self.privilege_helper = helper;
        self
    }

    /// Program and arguments, prefixed with the privilege helper when asked.
    fn argv(&self, args: &[String], privileged: bool) -> Vec<String> {
        let mut argv = Vec::with_capacity(args.len() + 2);
        if privileged {
            if let Some(helper) = &self.privilege_helper {
                argv.push(helper.clone());
            }
        }
        argv.push(self.binary.clone());
        argv.extend(args.iter().cloned());
        argv
    }

    async fn exec(&self, argv: &[String]) -> Result<Output> {
        let describe = argv.join(" ");
        let Some((program, args)) = argv.split_first() else {
            return Err(TrayError::CommandFailed {
                command: describe,
                details: "empty command line".to_string(),
            });
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(command = %describe, "Running daemon command");
        match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => Err(TrayError::transport(format!("spawning {}", describe), err)),
            Err(_) => Err(TrayError::timeout(describe, self.timeout)),
        }
    }

    async fn run(&self, args: &[String], privileged: bool) -> Result<String> {
        let argv = self.argv(args, privileged);
        let output = self.exec(&argv).await?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let details = if stderr.is_empty() {
            format!("exited with {}", output.status)
        } else {
            stderr
        };
        Err(TrayError::CommandFailed {
            command: argv.join(" "),
            details,
        })
    }

    /// Runs `args`; on "access denied" runs `retry_args` through the privilege helper.
    async fn run_with_retry(&self, args: &[String], retry_args: &[String]) -> Result<String> {
        match self.run(args, false).await {
            Err(err) if err.is_access_denied() && self.privilege_helper.is_some() => {
                tracing::info!(error = %err, "Retrying through privilege helper");
                self.run(retry_args, true).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl CommandGateway for CliGateway {
    async fn fetch_status(&self) -> Result<String> {
        self.run(&strings(&["status", "--json"]), false).await
    }

    async fn fetch_prefs(&self) -> Result<String> {
        self.run(&strings(&["debug", "prefs"]), false).await
    }

    async fn watch(&self) -> Result<Option<Box<dyn FrameStream>>> {
        let argv = self.argv(&strings(&["debug", "watch-ipn"]), false);
        let describe = argv.join(" ");
        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| TrayError::transport(format!("spawning {}", describe), err))?;

        let stdout = child.stdout.take().ok_or_else(|| TrayError::CommandFailed {
            command: describe,
            details: "stdout was not captured".to_string(),
        })?;

        Ok(Some(Box::new(CliFrameStream {
            _child: child,
            stdout,
            splitter: FrameSplitter::new(),
            ready: VecDeque::new(),
        })))
    }

    async fn up(&self, flags: &UpFlags) -> Result<String> {
        self.run_with_retry(&strings(&["up"]), &up_retry_args(flags))
            .await
    }

    async fn down(&self) -> Result<String> {
        self.run(&strings(&["down"]), false).await
    }

    async fn login(&self, flags: &LoginFlags) -> Result<String> {
        let argv = self.argv(&login_args(flags, self.login_timeout), true);
        // `up --timeout` exits non-zero once the timeout passes, after printing the URL.
        let output = self.exec(&argv).await?;
        let mut merged = String::from_utf8_lossy(&output.stdout).into_owned();
        merged.push_str(&String::from_utf8_lossy(&output.stderr));

        if let Some(url) = find_login_url(&merged) {
            return Ok(url);
        }

        tracing::debug!("No login URL in command output; checking status AuthURL");
        let status = self.fetch_status().await?;
        extract_json_object(&status)
            .and_then(|status| {
                status
                    .get("AuthURL")
                    .and_then(|url| url.as_str())
                    .filter(|url| !url.is_empty())
                    .map(str::to_string)
            })
            .ok_or_else(|| TrayError::CommandFailed {
                command: argv.join(" "),
                details: "no login URL reported".to_string(),
            })
    }

    async fn logout(&self) -> Result<String> {
        let args = strings(&["logout"]);
        self.run_with_retry(&args, &args).await
    }

    async fn set_exit_node(&self, node: Option<&str>) -> Result<String> {
        let flag = format!("--exit-node={}", node.unwrap_or_default());
        self.run(&["set".to_string(), flag], false).await
    }

    async fn set_preference(&self, preference: Preference, enabled: bool) -> Result<String> {
        let flag = format!("{}={}", preference.cli_flag(), enabled);
        self.run(&["set".to_string(), flag], false).await
    }
}

struct CliFrameStream {
    // Held so the process is killed when the stream is dropped.
    _child: Child,
    stdout: ChildStdout,
    splitter: FrameSplitter,
    ready: VecDeque<String>,
}

#[async_trait]
impl FrameStream for CliFrameStream {
    async fn next_frame(&mut self) -> Result<Option<String>> {
        let mut chunk = vec![0u8; READ_CHUNK_BYTES];
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(Some(frame));
            }
            let read = self
                .stdout
                .read(&mut chunk)
                .await
                .map_err(|err| TrayError::transport("reading watch output", err))?;
            if read == 0 {
                return Ok(None);
            }
            self.ready.extend(self.splitter.push(&chunk[..read]));
        }
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| arg.to_string()).collect()
}

fn up_retry_args(flags: &UpFlags) -> Vec<String> {
    let mut args = strings(&["up", "--reset"]);
    if let Some(operator) = &flags.operator {
        args.push(format!("--operator={}", operator));
    }
    if flags.accept_routes {
        args.push("--accept-routes".to_string());
    }
    args
}

fn login_args(flags: &LoginFlags, timeout: Duration) -> Vec<String> {
    let mut args = strings(&["up", "--reset"]);
    args.push(format!("--timeout={}s", timeout.as_secs().max(1)));
    if let Some(operator) = &flags.operator {
        args.push(format!("--operator={}", operator));
    }
    if flags.accept_routes {
        args.push("--accept-routes=true".to_string());
    }
    if let Some(server) = &flags.login_server {
        args.push(format!("--login-server={}", server));
    }
    args
}

fn find_login_url(output: &str) -> Option<String> {
    RE_LOGIN_URL
        .captures(output)
        .and_then(|captures| captures.get(1))
        .map(|url| url.as_str().to_string())
}
