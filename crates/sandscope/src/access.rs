//! Access requests from the interceptor and the decisions returned to it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::accounting::{CodecError, IoClass, ProcessId};
use crate::policy::PolicyBits;

/// The kind of file-system operation being attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Operation {
    /// Reading file contents
    Read = 0,
    /// Writing file contents
    Write = 1,
    /// Checking existence or attributes
    Probe = 2,
    /// Listing directory contents
    EnumerateDirectory = 3,
    /// Deleting a file or directory
    Delete = 4,
    /// Renaming/moving a file or directory
    Rename = 5,
    /// Creating a directory
    CreateDirectory = 6,
}

impl Operation {
    /// Every operation, in wire-code order.
    pub const ALL: [Operation; 7] = [
        Operation::Read,
        Operation::Write,
        Operation::Probe,
        Operation::EnumerateDirectory,
        Operation::Delete,
        Operation::Rename,
        Operation::CreateDirectory,
    ];

    /// Permission bits a policy must grant for this operation.
    pub fn required(self) -> PolicyBits {
        match self {
            Operation::Read | Operation::Probe => PolicyBits::ALLOW_READ,
            Operation::EnumerateDirectory => PolicyBits::ALLOW_ENUMERATE,
            Operation::Write | Operation::Delete | Operation::Rename => PolicyBits::ALLOW_WRITE,
            Operation::CreateDirectory => PolicyBits::ALLOW_CREATE_DIRECTORY,
        }
    }

    /// Accounting bucket for this operation.
    pub fn io_class(self) -> IoClass {
        match self {
            Operation::Read => IoClass::Read,
            Operation::Write => IoClass::Write,
            _ => IoClass::Other,
        }
    }

    /// Returns true if this operation never modifies the file system.
    pub fn is_read_only(self) -> bool {
        matches!(
            self,
            Operation::Read | Operation::Probe | Operation::EnumerateDirectory
        )
    }

    /// Wire code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Operation for a wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(usize::from(code)).copied()
    }

    /// Short lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Probe => "probe",
            Operation::EnumerateDirectory => "enumerate",
            Operation::Delete => "delete",
            Operation::Rename => "rename",
            Operation::CreateDirectory => "mkdir",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing an [`Operation`] name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown operation: {0}")]
pub struct UnknownOperation(pub String);

impl FromStr for Operation {
    type Err = UnknownOperation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Operation::Read),
            "write" => Ok(Operation::Write),
            "probe" => Ok(Operation::Probe),
            "enumerate" | "enumerate_directory" => Ok(Operation::EnumerateDirectory),
            "delete" => Ok(Operation::Delete),
            "rename" => Ok(Operation::Rename),
            "mkdir" | "create_directory" => Ok(Operation::CreateDirectory),
            other => Err(UnknownOperation(other.to_string())),
        }
    }
}

/// One intercepted access, as delivered by the interceptor.
///
/// The path must already be canonical; the engine only splits it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRequest<'a> {
    /// Absolute canonical path.
    pub path: &'a str,
    /// Operation being attempted.
    pub operation: Operation,
    /// Requesting process.
    pub process_id: ProcessId,
    /// Parent of the requesting process, when the interceptor knows it.
    pub parent_process_id: Option<ProcessId>,
    /// Bytes moved by the operation, for accounting.
    pub bytes: u64,
    /// Whether the target existed when the access was observed.
    pub target_exists: bool,
}

impl<'a> AccessRequest<'a> {
    /// Create a request for an existing target with no byte count.
    pub fn new(path: &'a str, operation: Operation, process_id: ProcessId) -> Self {
        Self {
            path,
            operation,
            process_id,
            parent_process_id: None,
            bytes: 0,
            target_exists: true,
        }
    }

    /// Set the parent process id.
    pub fn with_parent(mut self, parent: ProcessId) -> Self {
        self.parent_process_id = Some(parent);
        self
    }

    /// Set the number of bytes transferred.
    pub fn with_bytes(mut self, bytes: u64) -> Self {
        self.bytes = bytes;
        self
    }

    /// Mark the target as absent.
    pub fn nonexistent(mut self) -> Self {
        self.target_exists = false;
        self
    }

    /// Whether `policy` grants this request without a veto.
    ///
    /// Read-like operations on absent targets are also covered by
    /// [`PolicyBits::ALLOW_READ_IF_NONEXISTENT`].
    pub fn is_covered_by(&self, policy: PolicyBits) -> bool {
        if policy.covers(self.operation.required()) {
            return true;
        }
        !self.target_exists
            && matches!(self.operation, Operation::Read | Operation::Probe)
            && policy.covers(PolicyBits::ALLOW_READ_IF_NONEXISTENT)
    }
}

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DecisionReason {
    /// Nested call on a thread already arbitrating; passed through.
    Suppressed = 0,
    /// A rule covers the operation.
    Granted = 1,
    /// No rule grants the operation.
    NoCoveringGrant = 2,
    /// The resolved policy carries the deny bit.
    ExplicitDeny = 3,
    /// Arbitration itself failed; failed closed.
    InternalFault = 4,
    /// The job is being torn down; no new accesses are admitted.
    TearingDown = 5,
}

impl DecisionReason {
    fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Suppressed,
            1 => Self::Granted,
            2 => Self::NoCoveringGrant,
            3 => Self::ExplicitDeny,
            4 => Self::InternalFault,
            5 => Self::TearingDown,
            _ => return None,
        })
    }
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Suppressed => "nested call passed through",
            Self::Granted => "granted by policy",
            Self::NoCoveringGrant => "no rule grants this access",
            Self::ExplicitDeny => "denied by policy rule",
            Self::InternalFault => "policy could not be determined",
            Self::TearingDown => "job is tearing down",
        })
    }
}

/// What happens to the access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultAction {
    /// Proceeds, covered by policy.
    Allow,
    /// Blocked.
    Deny,
    /// Proceeds although no rule covers it.
    Warn,
}

/// How prominently an access is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportLevel {
    /// Not reported.
    Ignore,
    /// Reported because it was unexpected or all accesses are reported.
    Report,
    /// Reported because a rule asked for it.
    ReportExplicit,
}

/// Verdict for one intercepted access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessDecision {
    /// Whether the access may proceed.
    pub allowed: bool,
    /// Whether the access is reported to the host.
    pub reported: bool,
    /// Whether no rule covered the access.
    pub unexpected: bool,
    /// Depth of the deepest rule that shaped the policy.
    pub matched_depth: u16,
    /// Diagnostic reason.
    pub reason: DecisionReason,
}

const FLAG_ALLOWED: u8 = 1 << 0;
const FLAG_REPORTED: u8 = 1 << 1;
const FLAG_UNEXPECTED: u8 = 1 << 2;

impl AccessDecision {
    /// Size of the wire frame.
    pub const FRAME_LEN: usize = 8;

    /// Decision for a nested call: allowed, unreported, never looked up.
    pub const fn passthrough() -> Self {
        Self {
            allowed: true,
            reported: false,
            unexpected: false,
            matched_depth: 0,
            reason: DecisionReason::Suppressed,
        }
    }

    /// Denied-and-reported decision for when policy cannot be trusted.
    pub const fn fail_closed(reason: DecisionReason) -> Self {
        Self {
            allowed: false,
            reported: true,
            unexpected: true,
            matched_depth: 0,
            reason,
        }
    }

    /// Outcome as an action.
    pub fn action(&self) -> ResultAction {
        match (self.allowed, self.unexpected) {
            (false, _) => ResultAction::Deny,
            (true, true) => ResultAction::Warn,
            (true, false) => ResultAction::Allow,
        }
    }

    /// Encode as `[flags, reason, depth_lo, depth_hi, 0, 0, 0, 0]`.
    pub fn encode(&self) -> [u8; Self::FRAME_LEN] {
        let mut flags = 0;
        if self.allowed {
            flags |= FLAG_ALLOWED;
        }
        if self.reported {
            flags |= FLAG_REPORTED;
        }
        if self.unexpected {
            flags |= FLAG_UNEXPECTED;
        }
        let depth = self.matched_depth.to_le_bytes();
        [flags, self.reason as u8, depth[0], depth[1], 0, 0, 0, 0]
    }

    /// Decode a wire frame.
    pub fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        let frame: &[u8; Self::FRAME_LEN] = frame.try_into().map_err(|_| CodecError::Length {
            expected: Self::FRAME_LEN,
            actual: frame.len(),
        })?;
        let flags = frame[0];
        if flags & !(FLAG_ALLOWED | FLAG_REPORTED | FLAG_UNEXPECTED) != 0 {
            return Err(CodecError::InvalidField {
                field: "flags",
                value: flags,
            });
        }
        let reason = DecisionReason::from_code(frame[1]).ok_or(CodecError::InvalidField {
            field: "reason",
            value: frame[1],
        })?;
        Ok(Self {
            allowed: flags & FLAG_ALLOWED != 0,
            reported: flags & FLAG_REPORTED != 0,
            unexpected: flags & FLAG_UNEXPECTED != 0,
            matched_depth: u16::from_le_bytes([frame[2], frame[3]]),
            reason,
        })
    }
}
