//! Per-page attribute words.
//!
//! DPMI clients see one 16-bit word per page (functions 0506h/0507h). The
//! layout is kept verbatim so words can be passed through unchanged, but all
//! reasoning about them happens on typed fields and in
//! [`PageAttr::transition`], which does no I/O.

use bitfield_struct::bitfield;

use crate::mapping::Protection;

/// Commit state of a page (bits 0-1 of the attribute word).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommitType {
    /// Address space only, no memory behind it.
    Uncommitted = 0,
    /// Backed by accounted private memory.
    Committed = 1,
    /// Backed by something else, e.g. aliased conventional memory.
    Mapped = 2,
    /// In requests only: keep the commit state, change attributes.
    AttrOnly = 3,
}

impl CommitType {
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 3 {
            0 => CommitType::Uncommitted,
            1 => CommitType::Committed,
            2 => CommitType::Mapped,
            _ => CommitType::AttrOnly,
        }
    }

    pub const fn into_bits(self) -> u8 {
        self as u8
    }
}

/// One page's attribute word.
///
/// | Bits | Field        | Meaning |
/// |------|--------------|---------|
/// | 0-1  | `commit`     | [`CommitType`] |
/// | 2    | `shared`     | page belongs to a shared memory block |
/// | 3    | `writable`   | read/write if set, read-only if clear |
/// | 4    | `set_access` | request: copy bits 4-7 verbatim |
/// | 5    | `accessed`   | access bit |
/// | 6    | `dirty`      | dirty bit |
/// | 7    | `no_exec`    | execution forbidden |
#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub struct PageAttr {
    #[bits(2)]
    pub commit: CommitType,
    pub shared: bool,
    pub writable: bool,
    pub set_access: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub no_exec: bool,
    #[bits(8)]
    __: u8,
}

/// Host-side consequence of an attribute change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// The page is backed: apply this protection. Failure is fatal.
    Protect(Protection),
    /// The page has no private backing any more: revoke all access.
    /// Failure is only reported.
    Revoke,
}

/// Result of applying a request to one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// The page's new attribute word.
    pub attr: PageAttr,
    /// Pages entering (+1) or leaving (-1) the committed state.
    pub commit_delta: i8,
    /// Host work to do, if anything observable changed.
    pub effect: Option<Effect>,
}

/// Why a request was refused for a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrError {
    /// Making a page writable needs it committed before or after.
    WriteOnUncommitted,
    /// No-execute can only be toggled on a committed page.
    NoExecOnUncommitted,
}

impl AttrError {
    /// The attribute the request tried to change.
    pub fn what(self) -> &'static str {
        match self {
            AttrError::WriteOnUncommitted => "read/write",
            AttrError::NoExecOnUncommitted => "no-execute",
        }
    }
}

impl PageAttr {
    /// Committed, read/write.
    pub const COMMITTED_RW: PageAttr = PageAttr::from_bits(0x09);
    /// Uncommitted, read/write once committed.
    pub const UNCOMMITTED_RW: PageAttr = PageAttr::from_bits(0x08);
    /// Committed, read/write, shared.
    pub const SHARED_RW: PageAttr = PageAttr::from_bits(0x0d);

    /// Whether the page counts as committed (bit 0).
    pub fn is_committed(self) -> bool {
        self.into_bits() & 1 != 0
    }

    /// Whether a request asks for an attribute-only change: commit type 3
    /// and no shared bit.
    pub fn is_attr_only(self) -> bool {
        self.into_bits() & 7 == 3
    }

    /// Bits 4-7 as a nibble.
    pub fn access_nibble(self) -> u8 {
        ((self.into_bits() >> 4) & 0xf) as u8
    }

    /// The word as reported to clients: the set-access request bit is
    /// never reported.
    pub fn reported(self) -> PageAttr {
        self.with_set_access(false)
    }

    /// Protection a committed page with these attributes gets.
    pub fn committed_protection(self) -> Protection {
        let mut prot = Protection::READ | Protection::EXEC;
        if self.writable() {
            prot |= Protection::WRITE;
        }
        if self.no_exec() {
            prot -= Protection::EXEC;
        }
        prot
    }

    /// Host protection this page should have, or `None` if it is backed by
    /// something this word does not describe.
    pub fn host_protection(self) -> Option<Protection> {
        match self.commit() {
            CommitType::Committed => Some(self.committed_protection()),
            CommitType::Uncommitted => Some(Protection::NONE),
            CommitType::Mapped | CommitType::AttrOnly => None,
        }
    }

    /// Apply `request` to this page.
    ///
    /// Commit type 2 in a request leaves the commit bits alone and is treated
    /// as uncommitted when judging the other bits. Commit type 3 keeps the
    /// current commit state, so on an uncommitted page it can clear read/write
    /// but cannot set it or touch no-execute.
    pub fn transition(self, request: PageAttr) -> Result<Transition, AttrError> {
        let old = self;
        let old_com = old.is_committed();
        let mut attr = old;
        let mut change = false;
        let mut commit_delta = 0;

        let com = match request.commit() {
            CommitType::Uncommitted => {
                if old_com {
                    commit_delta = -1;
                    change = true;
                }
                attr = attr.with_commit(CommitType::Uncommitted).with_shared(false);
                false
            }
            CommitType::Committed => {
                if !old_com {
                    commit_delta = 1;
                    change = true;
                }
                attr = attr.with_commit(CommitType::Committed).with_shared(false);
                true
            }
            CommitType::Mapped => false,
            CommitType::AttrOnly => old_com,
        };

        if request.writable() {
            if !old.writable() {
                if !com && !old_com {
                    return Err(AttrError::WriteOnUncommitted);
                }
                change = true;
                attr.set_writable(true);
            }
        } else if old.writable() {
            // Tolerated on uncommitted pages; some games rely on it.
            change = true;
            attr.set_writable(false);
        }

        if request.no_exec() != old.no_exec() {
            if !com {
                return Err(AttrError::NoExecOnUncommitted);
            }
            change = true;
            attr.set_no_exec(request.no_exec());
        }

        if request.set_access() {
            attr = PageAttr::from_bits((attr.into_bits() & 0x0f) | (request.into_bits() & 0xf0));
        }

        let effect = change.then(|| {
            if com {
                Effect::Protect(request.committed_protection())
            } else {
                Effect::Revoke
            }
        });

        Ok(Transition {
            attr,
            commit_delta,
            effect,
        })
    }
}
