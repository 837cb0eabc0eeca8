//! Running host-side programs.

use std::io;
use std::path::Path;
use std::process::Command;

use fanout_utils::exit::ExitCode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    /// Standard output followed by standard error.
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub trait CommandRunner: Send + Sync {
    /// Runs `program` to completion. An `Err` means the program could not be started at all.
    fn run(&self, program: &Path, args: &[String]) -> io::Result<CommandOutput>;
}

/// Runs programs as child processes of this one.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &Path, args: &[String]) -> io::Result<CommandOutput> {
        tracing::debug!(program = %program.display(), ?args, "Running host command");
        let out = Command::new(program).args(args).output()?;

        let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&out.stderr));

        Ok(CommandOutput {
            exit_code: ExitCode::from(out.status).get(),
            output,
        })
    }
}

#[cfg(test)]
mod test {
    use std::io;
    use std::path::Path;

    use super::{CommandRunner, SystemCommandRunner};

    #[test]
    fn captures_exit_code_and_output() {
        let out = SystemCommandRunner
            .run(
                Path::new("sh"),
                &["-c".to_string(), "echo out; echo err >&2; exit 4".to_string()],
            )
            .unwrap();
        assert_eq!(out.exit_code, 4);
        assert_eq!(out.output, "out\nerr\n");
        assert!(!out.success());
    }

    #[test]
    fn missing_program_is_not_found() {
        let err = SystemCommandRunner
            .run(Path::new("/definitely/not/a/forwarder"), &[])
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
