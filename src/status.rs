use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

/// Lifecycle/outcome state of an execution record.
///
/// The numeric id is the single stored representation; everything else is
/// derived through the pure conversions below. Ids 1 and 2 are the only
/// non-terminal states, every id >= 3 is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    InQueue,
    Processing,
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    CompilationError,
    RuntimeSigsegv,
    RuntimeSigxfsz,
    RuntimeSigfpe,
    RuntimeSigabrt,
    RuntimeNzec,
    RuntimeOther,
    BoxError,
    ExecFormatError,
}

impl Status {
    pub fn id(self) -> i64 {
        match self {
            Self::InQueue => 1,
            Self::Processing => 2,
            Self::Accepted => 3,
            Self::WrongAnswer => 4,
            Self::TimeLimitExceeded => 5,
            Self::MemoryLimitExceeded => 6,
            Self::CompilationError => 7,
            Self::RuntimeSigsegv => 8,
            Self::RuntimeSigxfsz => 9,
            Self::RuntimeSigfpe => 10,
            Self::RuntimeSigabrt => 11,
            Self::RuntimeNzec => 12,
            Self::RuntimeOther => 13,
            Self::BoxError => 14,
            Self::ExecFormatError => 15,
        }
    }

    pub fn from_id(id: i64) -> Option<Self> {
        Some(match id {
            1 => Self::InQueue,
            2 => Self::Processing,
            3 => Self::Accepted,
            4 => Self::WrongAnswer,
            5 => Self::TimeLimitExceeded,
            6 => Self::MemoryLimitExceeded,
            7 => Self::CompilationError,
            8 => Self::RuntimeSigsegv,
            9 => Self::RuntimeSigxfsz,
            10 => Self::RuntimeSigfpe,
            11 => Self::RuntimeSigabrt,
            12 => Self::RuntimeNzec,
            13 => Self::RuntimeOther,
            14 => Self::BoxError,
            15 => Self::ExecFormatError,
            _ => return None,
        })
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::InQueue => "In Queue",
            Self::Processing => "Processing",
            Self::Accepted => "Accepted",
            Self::WrongAnswer => "Wrong Answer",
            Self::TimeLimitExceeded => "Time Limit Exceeded",
            Self::MemoryLimitExceeded => "Memory Limit Exceeded",
            Self::CompilationError => "Compilation Error",
            Self::RuntimeSigsegv => "Runtime Error (SIGSEGV)",
            Self::RuntimeSigxfsz => "Runtime Error (SIGXFSZ)",
            Self::RuntimeSigfpe => "Runtime Error (SIGFPE)",
            Self::RuntimeSigabrt => "Runtime Error (SIGABRT)",
            Self::RuntimeNzec => "Runtime Error (NZEC)",
            Self::RuntimeOther => "Runtime Error (Other)",
            Self::BoxError => "Internal Error",
            Self::ExecFormatError => "Exec Format Error",
        }
    }

    pub fn is_terminal(self) -> bool {
        self.id() >= 3
    }

    /// WA and TLE are unsuccessful runs but deliberately *not* errors;
    /// clients depend on the id >= 6 boundary.
    pub fn is_error(self) -> bool {
        self.id() >= 6
    }

    pub fn is_runtime_error(self) -> bool {
        (8..=13).contains(&self.id())
    }

    pub fn is_successful(self) -> bool {
        self == Self::Accepted
    }

    /// Maps the terminating signal of a sandboxed process to a status.
    /// An unknown or missing signal code is reported as the generic
    /// runtime-error status.
    pub fn from_signal(signal: Option<i32>) -> Self {
        match signal {
            Some(libc::SIGSEGV) => Self::RuntimeSigsegv,
            Some(libc::SIGXFSZ) => Self::RuntimeSigxfsz,
            Some(libc::SIGFPE) => Self::RuntimeSigfpe,
            Some(libc::SIGABRT) => Self::RuntimeSigabrt,
            _ => Self::RuntimeOther,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Status", 2)?;
        s.serialize_field("id", &self.id())?;
        s.serialize_field("description", self.description())?;
        s.end()
    }
}
