#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,

    /// The run finished but one or more virtual users failed.
    VusersFailed = 10,

    /// Invalid CLI/script input (bad flags, unreadable YAML, invalid phases or scenarios).
    InvalidInput = 30,

    /// Internal/runtime error (IO errors, plugin failures, panics caught at top-level).
    RuntimeError = 40,
}

impl ExitCode {
    #[must_use]
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    #[must_use]
    pub fn from_failed_vusers(failed: u64) -> Self {
        if failed == 0 {
            Self::Success
        } else {
            Self::VusersFailed
        }
    }
}
