//! Command execution utilities
//!
//! Every external tool the engine drives (parted, cryptsetup, mkfs, mount...)
//! goes through a [`CommandExecutor`]. Production code uses
//! [`SystemExecutor`]; tests inject [`crate::utils::mock::MockDisk`].

use crate::utils::audit::{AuditLog, AuditStatus};
use crate::utils::error::{ProvisionError, Result};
use std::cell::RefCell;
use std::io::Write;
use std::process::{Command, Stdio};
use tracing::{debug, warn};

/// Captured result of one external command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code (-1 when terminated by a signal)
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Runs a privileged program and reports its exit status and output.
///
/// Implementations must not interpret the exit status; [`CommandRunner`]
/// turns non-zero exits into errors.
pub trait CommandExecutor {
    fn execute(&self, program: &str, args: &[&str], stdin: Option<&[u8]>) -> Result<CommandOutput>;
}

/// Executes commands on the host
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

impl CommandExecutor for SystemExecutor {
    fn execute(&self, program: &str, args: &[&str], stdin: Option<&[u8]>) -> Result<CommandOutput> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProvisionError::CommandNotFound(program.to_string())
            } else {
                ProvisionError::Io(e)
            }
        })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input)?;
            // Dropping the pipe closes it so the child sees EOF
        }

        let output = child.wait_with_output()?;
        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Log a command that would be run (for dry-run mode)
pub fn log_dry_run(program: &str, args: &[&str]) {
    println!("  [dry-run] {} {}", program, args.join(" "));
}

fn command_line(program: &str, args: &[&str]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

/// Wrapper for command execution that respects dry-run mode and keeps an
/// audit trail of every destructive action.
pub struct CommandRunner {
    executor: Box<dyn CommandExecutor>,
    dry_run: bool,
    audit: RefCell<AuditLog>,
}

impl CommandRunner {
    pub fn new(dry_run: bool) -> Self {
        Self::with_executor(SystemExecutor, dry_run)
    }

    pub fn with_executor(executor: impl CommandExecutor + 'static, dry_run: bool) -> Self {
        Self {
            executor: Box::new(executor),
            dry_run,
            audit: RefCell::new(AuditLog::default()),
        }
    }

    /// Run a command that changes system state. Recorded in the audit log;
    /// skipped in dry-run mode.
    pub fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        self.run_journaled(program, args, None)
    }

    /// Like [`CommandRunner::run`], feeding `input` on stdin. The input is
    /// never logged.
    pub fn run_with_input(&self, program: &str, args: &[&str], input: &[u8]) -> Result<CommandOutput> {
        self.run_journaled(program, args, Some(input))
    }

    /// Run a read-only command and return its trimmed stdout. Executes even
    /// in dry-run mode and is not journaled.
    pub fn query(&self, program: &str, args: &[&str]) -> Result<String> {
        let output = self.execute_checked(program, args, None)?;
        Ok(output.stdout.trim().to_string())
    }

    /// Read-only command allowed to fail
    pub fn query_optional(&self, program: &str, args: &[&str]) -> Option<String> {
        self.query(program, args).ok()
    }

    /// Run a command that only touches private scratch state (read-only
    /// probe mounts). Executes even in dry-run mode and is not journaled.
    pub fn run_scratch(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        self.execute_checked(program, args, None)
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Snapshot of the destructive actions taken so far
    pub fn audit_log(&self) -> AuditLog {
        self.audit.borrow().clone()
    }

    fn run_journaled(&self, program: &str, args: &[&str], input: Option<&[u8]>) -> Result<CommandOutput> {
        let line = command_line(program, args);

        if self.dry_run {
            log_dry_run(program, args);
            self.audit.borrow_mut().record(line, AuditStatus::DryRun);
            return Ok(CommandOutput::default());
        }

        let result = self.execute_checked(program, args, input);
        let status = match &result {
            Ok(_) => AuditStatus::Ok,
            Err(ProvisionError::CommandFailed { stderr, .. }) => AuditStatus::Failed {
                detail: stderr.trim().to_string(),
            },
            Err(e) => AuditStatus::Failed {
                detail: e.to_string(),
            },
        };
        self.audit.borrow_mut().record(line, status);
        result
    }

    fn execute_checked(&self, program: &str, args: &[&str], input: Option<&[u8]>) -> Result<CommandOutput> {
        debug!("Running: {}", command_line(program, args));

        let output = self.executor.execute(program, args, input)?;
        if !output.success() {
            warn!(
                "Command failed: {}\n  stderr: {}",
                command_line(program, args),
                output.stderr.trim()
            );
            return Err(ProvisionError::CommandFailed {
                command: command_line(program, args),
                stderr: output.stderr,
            });
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct Recorder {
        calls: Rc<RefCell<Vec<(String, Option<Vec<u8>>)>>>,
        fail: bool,
    }

    impl CommandExecutor for Recorder {
        fn execute(&self, program: &str, args: &[&str], stdin: Option<&[u8]>) -> Result<CommandOutput> {
            self.calls
                .borrow_mut()
                .push((command_line(program, args), stdin.map(<[u8]>::to_vec)));
            if self.fail {
                Ok(CommandOutput::failed(1, "boom"))
            } else {
                Ok(CommandOutput::ok("  out \n"))
            }
        }
    }

    #[test]
    fn query_trims_and_skips_audit() {
        let recorder = Recorder::default();
        let runner = CommandRunner::with_executor(recorder.clone(), false);

        assert_eq!(runner.query("lsblk", &["-J"]).unwrap(), "out");
        assert!(runner.audit_log().entries().is_empty());
        assert_eq!(recorder.calls.borrow().len(), 1);
    }

    #[test]
    fn run_records_failures() {
        let recorder = Recorder {
            fail: true,
            ..Default::default()
        };
        let runner = CommandRunner::with_executor(recorder, false);

        let err = runner.run("parted", &["-s", "/dev/sda", "rm", "3"]).unwrap_err();
        assert!(matches!(err, ProvisionError::CommandFailed { .. }));

        let log = runner.audit_log();
        assert_eq!(log.entries().len(), 1);
        assert_eq!(log.entries()[0].command, "parted -s /dev/sda rm 3");
        assert!(matches!(log.entries()[0].status, AuditStatus::Failed { .. }));
    }

    #[test]
    fn dry_run_does_not_execute_destructive_commands() {
        let recorder = Recorder::default();
        let runner = CommandRunner::with_executor(recorder.clone(), true);

        runner.run("mkfs.btrfs", &["-f", "/dev/sda2"]).unwrap();
        assert!(recorder.calls.borrow().is_empty());
        assert!(matches!(runner.audit_log().entries()[0].status, AuditStatus::DryRun));
    }

    #[test]
    fn stdin_is_passed_but_not_logged() {
        let recorder = Recorder::default();
        let runner = CommandRunner::with_executor(recorder.clone(), false);

        runner
            .run_with_input("cryptsetup", &["open", "/dev/sda2", "cryptroot"], b"hunter2")
            .unwrap();

        assert_eq!(recorder.calls.borrow()[0].1.as_deref(), Some(&b"hunter2"[..]));
        let json = runner.audit_log().to_json().unwrap();
        assert!(!json.contains("hunter2"));
    }
}
