//! Permission and report bits carried by scope rules.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Bit set over the permission/report vocabulary of a scope rule.
    ///
    /// The same type is used for a rule's `mask` (bits to keep from the
    /// inherited value) and its `policy` (bits to add), as well as for the
    /// effective value produced by resolution.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct PolicyBits: u32 {
        /// Reading file contents.
        const ALLOW_READ = 1 << 0;
        /// Writing, deleting or renaming.
        const ALLOW_WRITE = 1 << 1;
        /// Listing directory contents.
        const ALLOW_ENUMERATE = 1 << 2;
        /// Creating directories.
        const ALLOW_CREATE_DIRECTORY = 1 << 3;
        /// Probing or reading a path that turns out not to exist.
        const ALLOW_READ_IF_NONEXISTENT = 1 << 4;
        /// Veto: no operation is covered while this bit is set.
        const DENY = 1 << 5;
        /// Every access under the scope is reported to the host.
        const REPORT_ACCESS = 1 << 6;
        /// Directory enumerations under the scope are reported.
        const REPORT_DIRECTORY_ENUMERATION = 1 << 7;

        /// All permission bits.
        const ALLOW_ALL = Self::ALLOW_READ.bits()
            | Self::ALLOW_WRITE.bits()
            | Self::ALLOW_ENUMERATE.bits()
            | Self::ALLOW_CREATE_DIRECTORY.bits()
            | Self::ALLOW_READ_IF_NONEXISTENT.bits();
        /// Mask clearing every inherited bit, so the rule's policy replaces
        /// whatever the parent granted.
        const MASK_ALL = 0;
        /// Mask clearing nothing; the inherited value passes through.
        const MASK_NONE = !0;
    }
}

impl PolicyBits {
    /// Combine an inherited effective value with one node's rule.
    ///
    /// The mask clears inherited bits, the policy sets new ones. Routing
    /// nodes use `(MASK_NONE, empty)` and leave `inherited` untouched.
    #[inline]
    pub const fn combine(inherited: PolicyBits, mask: PolicyBits, policy: PolicyBits) -> PolicyBits {
        PolicyBits::from_bits_retain((inherited.bits() & mask.bits()) | policy.bits())
    }

    /// Whether `required` is fully granted and not vetoed.
    #[inline]
    pub fn covers(self, required: PolicyBits) -> bool {
        self.contains(required) && !self.contains(PolicyBits::DENY)
    }

    /// Whether accesses under this policy are allowed and never reported.
    ///
    /// Hosts use this to skip tracking for scopes like system directories.
    pub fn is_untracked(self) -> bool {
        self.contains(PolicyBits::ALLOW_ALL)
            && !self.contains(PolicyBits::DENY)
            && !self.intersects(PolicyBits::REPORT_ACCESS | PolicyBits::REPORT_DIRECTORY_ENUMERATION)
    }
}

impl Default for PolicyBits {
    fn default() -> Self {
        PolicyBits::empty()
    }
}
