/// Exit code to issue if fanout itself fails, rather than a test it ran.
pub const CODE_ERROR: i32 = 101;

#[derive(PartialEq, Eq, Debug, Clone, Copy, PartialOrd, Ord)]
pub struct ExitCode(i32);

impl ExitCode {
    pub const SUCCESS: ExitCode = ExitCode(0);
    /// At least one test did not pass.
    pub const TESTS_FAILED: ExitCode = ExitCode(1);
    /// The dispatch could not be performed at all, e.g. there were no tests to run.
    pub const DISPATCH_ERROR: ExitCode = ExitCode(CODE_ERROR);

    pub const fn get(&self) -> i32 {
        self.0
    }

    pub const fn new(code: i32) -> Self {
        Self(code)
    }

    pub const fn is_success(&self) -> bool {
        self.0 == 0
    }
}

impl From<std::process::ExitStatus> for ExitCode {
    fn from(es: std::process::ExitStatus) -> Self {
        // Killed by a signal; there is no code to forward.
        let code = es.code().unwrap_or(CODE_ERROR);
        Self::new(code)
    }
}
