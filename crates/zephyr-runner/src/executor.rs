//! Step executor: runs one job's ordered steps to a terminal result.
//!
//! Steps run strictly sequentially. Output streams are captured line by
//! line, masked, forwarded to the log sink, and accumulated for
//! `::set-output` extraction. Timeouts and cancellation terminate the
//! running process; everything after a failed step (without
//! `continue_on_error`) is skipped.

use crate::runner::{
    ExecutionTarget, ExecutorConfig, JobReport, JobRequest, StepOutcome, StepReport, StepStatus,
};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zephyr_core::ids::JobId;
use zephyr_core::interpolation::InterpolationContext;
use zephyr_core::pipeline::{StepDefinition, StepKind};
use zephyr_core::ports::LogSink;
use zephyr_core::run::{JobStatus, LogStream};
use zephyr_core::{Error, Result};

const TIMEOUT_MARKER: &str = "[TIMEOUT] Step exceeded timeout limit";
const TIMEOUT_EXIT_CODE: i32 = 124;

fn set_output_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^::set-output name=([A-Za-z0-9_.\-]+)::(.*)$").unwrap()
    })
}

/// Executes one job's steps against a local shell or an acquired microVM.
pub struct StepExecutor {
    config: ExecutorConfig,
    sink: Arc<dyn LogSink>,
}

enum WaitEnd {
    Exited(i32),
    TimedOut,
    Cancelled,
}

struct RawStepResult {
    exit_code: i32,
    output: String,
    timed_out: bool,
    cancelled: bool,
}

impl StepExecutor {
    pub fn new(config: ExecutorConfig, sink: Arc<dyn LogSink>) -> Self {
        Self { config, sink }
    }

    /// Run the job's steps in order and aggregate the result.
    pub async fn execute(
        &self,
        req: &JobRequest,
        cancel: &CancellationToken,
    ) -> Result<JobReport> {
        let mut ctx = InterpolationContext::new();
        ctx.secrets = req.secrets.clone();
        ctx.needs_outputs = req.needs_outputs.clone();
        ctx.needs_status = req.needs_status.clone();
        ctx.branch = req.branch.clone();
        ctx.event_type = req.event_type.clone();

        let mut reports: Vec<StepReport> = Vec::new();
        let mut path_prefixes: Vec<PathBuf> = Vec::new();
        let mut job_failed = false;
        let mut failure_reason: Option<String> = None;

        info!(job_id = %req.job_id, steps = req.definition.steps.len(), "Executing job");

        for step in &req.definition.steps {
            let step_key = step.output_id().to_string();

            if let Some(condition) = &step.condition {
                if !ctx.evaluate_condition(condition) {
                    debug!(step = %step.name, "Condition false, skipping step");
                    ctx.step_outcomes.insert(step_key, "skipped".to_string());
                    reports.push(StepReport::skipped(step.output_id(), &step.name));
                    continue;
                }
            }

            if cancel.is_cancelled() || (job_failed && !step.continue_on_error) {
                ctx.step_outcomes.insert(step_key, "skipped".to_string());
                reports.push(StepReport::skipped(step.output_id(), &step.name));
                continue;
            }

            let started = Instant::now();
            let raw = self.run_step(req, step, &ctx, &path_prefixes, cancel).await?;
            let duration_ms = started.elapsed().as_millis() as u64;

            if let StepKind::Setup { runtime, version } = &step.kind {
                if raw.exit_code == 0 {
                    path_prefixes.push(self.toolchain_bin(runtime, version));
                }
            }

            let mut outputs = HashMap::new();
            for caps in set_output_re().captures_iter(&raw.output) {
                let name = caps[1].to_string();
                let value = caps[2].to_string();
                ctx.step_outputs
                    .insert(format!("{}.{}", step.output_id(), name), value.clone());
                outputs.insert(name, value);
            }

            let outcome = if raw.exit_code == 0 {
                StepOutcome::Success
            } else {
                StepOutcome::Failure
            };
            let status = match outcome {
                StepOutcome::Success => StepStatus::Success,
                StepOutcome::Failure if step.continue_on_error => StepStatus::Success,
                StepOutcome::Failure => StepStatus::Failure,
            };

            ctx.step_outcomes
                .insert(step_key, outcome.as_str().to_string());

            if outcome == StepOutcome::Failure && !step.continue_on_error && !raw.cancelled {
                job_failed = true;
                failure_reason = Some(if raw.timed_out {
                    format!("step '{}' exceeded its timeout", step.name)
                } else {
                    format!(
                        "step '{}' failed with exit code {}",
                        step.name, raw.exit_code
                    )
                });
            }

            reports.push(StepReport {
                id: step.output_id().to_string(),
                name: step.name.clone(),
                status,
                outcome: Some(outcome),
                exit_code: Some(raw.exit_code),
                duration_ms,
                outputs,
            });
        }

        let status = if cancel.is_cancelled() {
            JobStatus::Cancelled
        } else if job_failed {
            JobStatus::Failure
        } else {
            JobStatus::Success
        };

        let mut outputs = HashMap::new();
        for report in &reports {
            outputs.extend(report.outputs.clone());
        }

        Ok(JobReport {
            status,
            steps: reports,
            outputs,
            failure_reason,
        })
    }

    fn toolchain_bin(&self, runtime: &str, version: &str) -> PathBuf {
        self.config
            .toolchain_root
            .join(format!("{}-{}", runtime, version))
            .join("bin")
    }

    /// Compose the effective environment for one step: job env, then step
    /// env, then the ambient CI markers, with placeholders resolved.
    fn compose_env(
        &self,
        req: &JobRequest,
        step: &StepDefinition,
        ctx: &InterpolationContext,
        path_prefixes: &[PathBuf],
    ) -> HashMap<String, String> {
        let mut env = req.definition.env.clone();
        env.extend(step.env.clone());
        env.insert("CI".to_string(), "true".to_string());
        env.insert("ZEPHYR".to_string(), "true".to_string());

        for value in env.values_mut() {
            *value = ctx.interpolate(value);
        }

        if !path_prefixes.is_empty() {
            let base = env
                .get("PATH")
                .cloned()
                .or_else(|| std::env::var("PATH").ok())
                .unwrap_or_else(|| "/usr/local/bin:/usr/bin:/bin".to_string());
            let prefixed: Vec<String> = path_prefixes
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            env.insert("PATH".to_string(), format!("{}:{}", prefixed.join(":"), base));
        }

        env
    }

    fn resolve_workdir(&self, req: &JobRequest, step: &StepDefinition) -> PathBuf {
        match &step.workdir {
            Some(dir) if Path::new(dir).is_absolute() => PathBuf::from(dir),
            Some(dir) => req.workdir.join(dir),
            None => req.workdir.clone(),
        }
    }

    async fn run_step(
        &self,
        req: &JobRequest,
        step: &StepDefinition,
        ctx: &InterpolationContext,
        path_prefixes: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Result<RawStepResult> {
        let command_text = match &step.kind {
            StepKind::Run { command } => ctx.interpolate(command),
            // Setup steps are idempotent provisioning stubs: ensure the
            // toolchain directory exists; the caller puts it on PATH.
            StepKind::Setup { runtime, version } => {
                format!(
                    "mkdir -p {}",
                    shell_quote(&self.toolchain_bin(runtime, version).display().to_string())
                )
            }
        };

        let env = self.compose_env(req, step, ctx, path_prefixes);
        let workdir = self.resolve_workdir(req, step);

        let mut command = match &req.target {
            ExecutionTarget::Local => {
                tokio::fs::create_dir_all(&workdir).await?;
                let mut cmd = Command::new(&step.shell);
                cmd.arg("-c")
                    .arg(&command_text)
                    .current_dir(&workdir)
                    .envs(&env);
                cmd
            }
            ExecutionTarget::MicroVm(vm) => {
                let mut script = String::new();
                for (key, value) in &env {
                    script.push_str(&format!("export {}={}; ", key, shell_quote(value)));
                }
                let dir = workdir.display().to_string();
                script.push_str(&format!(
                    "mkdir -p {dir} && cd {dir} && ",
                    dir = shell_quote(&dir)
                ));
                script.push_str(&format!("{} -c {}", step.shell, shell_quote(&command_text)));

                let mut cmd = Command::new("ssh");
                cmd.args([
                    "-o",
                    "StrictHostKeyChecking=no",
                    "-o",
                    "UserKnownHostsFile=/dev/null",
                ])
                .arg(format!("root@{}", vm.guest_ip))
                .arg(script);
                cmd
            }
        };

        debug!(step = %step.name, workdir = %workdir.display(), "Spawning step process");

        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Internal(format!("failed to spawn step process: {e}")))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (tx, rx) = mpsc::channel::<(LogStream, String)>(256);
        if let Some(stdout) = stdout {
            spawn_line_reader(stdout, LogStream::Stdout, tx.clone());
        }
        if let Some(stderr) = stderr {
            spawn_line_reader(stderr, LogStream::Stderr, tx);
        }

        let collector = {
            let sink = self.sink.clone();
            let job_id = req.job_id.clone();
            let secrets = ctx.secrets.clone();
            tokio::spawn(collect_output(sink, job_id, secrets, rx))
        };

        let timeout = step.timeout_seconds.map(std::time::Duration::from_secs);
        let end = self.wait_child(&mut child, timeout, cancel).await;

        let mut output = collector.await.unwrap_or_default();

        match end {
            WaitEnd::Exited(exit_code) => Ok(RawStepResult {
                exit_code,
                output,
                timed_out: false,
                cancelled: false,
            }),
            WaitEnd::TimedOut => {
                warn!(step = %step.name, "Step timed out, process killed");
                output.push_str(TIMEOUT_MARKER);
                output.push('\n');
                let _ = self
                    .sink
                    .append(&req.job_id, LogStream::Stderr, TIMEOUT_MARKER)
                    .await;
                Ok(RawStepResult {
                    exit_code: TIMEOUT_EXIT_CODE,
                    output,
                    timed_out: true,
                    cancelled: false,
                })
            }
            WaitEnd::Cancelled => Ok(RawStepResult {
                exit_code: -1,
                output,
                timed_out: false,
                cancelled: true,
            }),
        }
    }

    async fn wait_child(
        &self,
        child: &mut Child,
        timeout: Option<std::time::Duration>,
        cancel: &CancellationToken,
    ) -> WaitEnd {
        let end = if let Some(timeout) = timeout {
            tokio::select! {
                status = child.wait() => {
                    WaitEnd::Exited(status.ok().and_then(|s| s.code()).unwrap_or(-1))
                }
                _ = tokio::time::sleep(timeout) => WaitEnd::TimedOut,
                _ = cancel.cancelled() => WaitEnd::Cancelled,
            }
        } else {
            tokio::select! {
                status = child.wait() => {
                    WaitEnd::Exited(status.ok().and_then(|s| s.code()).unwrap_or(-1))
                }
                _ = cancel.cancelled() => WaitEnd::Cancelled,
            }
        };

        match end {
            WaitEnd::TimedOut => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                WaitEnd::TimedOut
            }
            WaitEnd::Cancelled => {
                self.terminate(child).await;
                WaitEnd::Cancelled
            }
            exited => exited,
        }
    }

    /// SIGTERM, then SIGKILL after the grace period.
    async fn terminate(&self, child: &mut Child) {
        if let Some(pid) = child.id() {
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        tokio::select! {
            _ = child.wait() => {}
            _ = tokio::time::sleep(self.config.kill_grace) => {
                let _ = child.kill().await;
            }
        }
    }
}

fn spawn_line_reader<R: AsyncRead + Unpin + Send + 'static>(
    reader: R,
    stream: LogStream,
    tx: mpsc::Sender<(LogStream, String)>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send((stream, line)).await.is_err() {
                break;
            }
        }
    });
}

/// Drain the merged stream: mask, forward to the sink, accumulate in
/// reader-observed interleaving order.
async fn collect_output(
    sink: Arc<dyn LogSink>,
    job_id: JobId,
    secrets: HashMap<String, String>,
    mut rx: mpsc::Receiver<(LogStream, String)>,
) -> String {
    let mut buffer = String::new();
    while let Some((stream, line)) = rx.recv().await {
        let masked = zephyr_core::interpolation::mask_secrets(&line, &secrets);
        if let Err(e) = sink.append(&job_id, stream, &masked).await {
            warn!(error = %e, "Failed to append job log");
        }
        buffer.push_str(&masked);
        buffer.push('\n');
    }
    buffer
}

/// Single-quote a string for POSIX shells.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use zephyr_core::ids::RunId;
    use zephyr_core::pipeline::{Condition, JobDefinition, RunnerSpec};

    struct TestSink {
        lines: Mutex<Vec<(LogStream, String)>>,
    }

    impl TestSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                lines: Mutex::new(Vec::new()),
            })
        }

        fn contents(&self) -> Vec<(LogStream, String)> {
            self.lines.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LogSink for TestSink {
        async fn append(
            &self,
            _job_id: &JobId,
            stream: LogStream,
            content: &str,
        ) -> Result<u64> {
            let mut lines = self.lines.lock().unwrap();
            lines.push((stream, content.to_string()));
            Ok(lines.len() as u64)
        }
    }

    fn run_step(name: &str, command: &str) -> StepDefinition {
        StepDefinition {
            id: None,
            name: name.to_string(),
            kind: StepKind::Run {
                command: command.to_string(),
            },
            env: HashMap::new(),
            workdir: None,
            shell: "bash".to_string(),
            condition: None,
            continue_on_error: false,
            timeout_seconds: None,
        }
    }

    fn request(steps: Vec<StepDefinition>, workdir: PathBuf) -> JobRequest {
        JobRequest {
            job_id: JobId::new(RunId::new(), "test"),
            definition: JobDefinition {
                name: "test".to_string(),
                runner: RunnerSpec {
                    image: "ubuntu:24.04".to_string(),
                    kind: zephyr_core::pipeline::RunnerKind::Local,
                },
                depends_on: vec![],
                env: HashMap::new(),
                steps,
                matrix: None,
            },
            workdir,
            target: ExecutionTarget::Local,
            secrets: HashMap::new(),
            needs_outputs: HashMap::new(),
            needs_status: HashMap::new(),
            branch: Some("main".to_string()),
            event_type: Some("push".to_string()),
        }
    }

    fn executor(sink: Arc<TestSink>, root: &Path) -> StepExecutor {
        StepExecutor::new(
            ExecutorConfig {
                toolchain_root: root.join("toolchains"),
                kill_grace: std::time::Duration::from_millis(200),
            },
            sink,
        )
    }

    #[tokio::test]
    async fn test_single_step_success() {
        let dir = tempfile::tempdir().unwrap();
        let sink = TestSink::new();
        let exec = executor(sink.clone(), dir.path());
        let req = request(vec![run_step("hello", "echo hello")], dir.path().into());

        let report = exec.execute(&req, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.status, JobStatus::Success);
        assert_eq!(report.steps[0].exit_code, Some(0));
        assert!(sink
            .contents()
            .iter()
            .any(|(s, l)| *s == LogStream::Stdout && l == "hello"));
    }

    #[tokio::test]
    async fn test_failure_skips_remaining_steps() {
        let dir = tempfile::tempdir().unwrap();
        let sink = TestSink::new();
        let exec = executor(sink, dir.path());
        let req = request(
            vec![
                run_step("boom", "exit 3"),
                run_step("after", "echo nope"),
            ],
            dir.path().into(),
        );

        let report = exec.execute(&req, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.status, JobStatus::Failure);
        assert_eq!(report.steps[0].outcome, Some(StepOutcome::Failure));
        assert_eq!(report.steps[1].status, StepStatus::Skipped);
        assert!(report
            .failure_reason
            .as_deref()
            .unwrap()
            .contains("exit code 3"));
    }

    #[tokio::test]
    async fn test_continue_on_error_status_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let sink = TestSink::new();
        let exec = executor(sink, dir.path());
        let mut tolerant = run_step("tolerant", "exit 1");
        tolerant.continue_on_error = true;
        let req = request(
            vec![tolerant, run_step("after", "echo ran")],
            dir.path().into(),
        );

        let report = exec.execute(&req, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.status, JobStatus::Success);
        assert_eq!(report.steps[0].status, StepStatus::Success);
        assert_eq!(report.steps[0].outcome, Some(StepOutcome::Failure));
        assert_eq!(report.steps[1].status, StepStatus::Success);
    }

    #[tokio::test]
    async fn test_step_output_flows_into_env() {
        let dir = tempfile::tempdir().unwrap();
        let sink = TestSink::new();
        let exec = executor(sink.clone(), dir.path());

        let mut build = run_step("build", "echo '::set-output name=version::1.2.3'");
        build.id = Some("build".to_string());
        let mut consume = run_step("consume", "echo version=$VER");
        consume.env.insert(
            "VER".to_string(),
            "${{ steps.build.outputs.version }}".to_string(),
        );

        let req = request(vec![build, consume], dir.path().into());
        let report = exec.execute(&req, &CancellationToken::new()).await.unwrap();

        assert_eq!(report.status, JobStatus::Success);
        assert_eq!(
            report.outputs.get("version").map(String::as_str),
            Some("1.2.3")
        );
        assert!(sink
            .contents()
            .iter()
            .any(|(_, l)| l == "version=1.2.3"));
    }

    #[tokio::test]
    async fn test_timeout_kills_and_reports_124() {
        let dir = tempfile::tempdir().unwrap();
        let sink = TestSink::new();
        let exec = executor(sink.clone(), dir.path());
        let mut slow = run_step("slow", "sleep 5");
        slow.timeout_seconds = Some(1);
        let req = request(vec![slow], dir.path().into());

        let report = exec.execute(&req, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.status, JobStatus::Failure);
        assert_eq!(report.steps[0].exit_code, Some(124));
        assert_eq!(report.steps[0].outcome, Some(StepOutcome::Failure));
        assert!(sink.contents().iter().any(|(_, l)| l == TIMEOUT_MARKER));
    }

    #[tokio::test]
    async fn test_condition_gate_skips_step() {
        let dir = tempfile::tempdir().unwrap();
        let sink = TestSink::new();
        let exec = executor(sink, dir.path());
        let mut gated = run_step("gated", "echo secret-deploy");
        gated.condition = Some(Condition::Expression("branch == 'release'".to_string()));
        let req = request(vec![gated], dir.path().into());

        let report = exec.execute(&req, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.status, JobStatus::Success);
        assert_eq!(report.steps[0].status, StepStatus::Skipped);
        assert_eq!(report.steps[0].duration_ms, 0);
    }

    #[tokio::test]
    async fn test_ci_markers_in_environment() {
        let dir = tempfile::tempdir().unwrap();
        let sink = TestSink::new();
        let exec = executor(sink.clone(), dir.path());
        let req = request(vec![run_step("env", "echo ci=$CI zephyr=$ZEPHYR")], dir.path().into());

        exec.execute(&req, &CancellationToken::new()).await.unwrap();
        assert!(sink
            .contents()
            .iter()
            .any(|(_, l)| l == "ci=true zephyr=true"));
    }

    #[tokio::test]
    async fn test_setup_step_prepends_path() {
        let dir = tempfile::tempdir().unwrap();
        let sink = TestSink::new();
        let exec = executor(sink.clone(), dir.path());

        let setup = StepDefinition {
            id: None,
            name: "install node".to_string(),
            kind: StepKind::Setup {
                runtime: "node".to_string(),
                version: "20".to_string(),
            },
            env: HashMap::new(),
            workdir: None,
            shell: "bash".to_string(),
            condition: None,
            continue_on_error: false,
            timeout_seconds: None,
        };
        let probe = run_step("probe", "echo $PATH");

        let req = request(vec![setup, probe], dir.path().into());
        let report = exec.execute(&req, &CancellationToken::new()).await.unwrap();

        assert_eq!(report.status, JobStatus::Success);
        let toolchain = dir.path().join("toolchains/node-20/bin");
        assert!(toolchain.is_dir());
        assert!(sink
            .contents()
            .iter()
            .any(|(_, l)| l.starts_with(&toolchain.display().to_string())));
    }

    #[tokio::test]
    async fn test_secrets_masked_in_captured_output() {
        let dir = tempfile::tempdir().unwrap();
        let sink = TestSink::new();
        let exec = executor(sink.clone(), dir.path());

        let mut req = request(
            vec![run_step("leak", "echo token=${{ secrets.TOKEN }}")],
            dir.path().into(),
        );
        req.secrets
            .insert("TOKEN".to_string(), "hunter22".to_string());

        exec.execute(&req, &CancellationToken::new()).await.unwrap();
        assert!(sink.contents().iter().any(|(_, l)| l == "token=***"));
    }

    #[tokio::test]
    async fn test_cancellation_terminates_and_skips() {
        let dir = tempfile::tempdir().unwrap();
        let sink = TestSink::new();
        let exec = executor(sink, dir.path());
        let req = request(
            vec![run_step("long", "sleep 30"), run_step("after", "echo hi")],
            dir.path().into(),
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let report = exec.execute(&req, &cancel).await.unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
        assert_eq!(report.status, JobStatus::Cancelled);
        assert_eq!(report.steps[1].status, StepStatus::Skipped);
    }
}
