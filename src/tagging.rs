//! High-bit pointer tagging used to fence blocked fibers off from the marker.
//!
//! During a detecting snapshot, the pointer to every blocked fiber's heap
//! descriptor is stored with [`TAG`] set, both in the blocked suffix of the
//! root job array and in the wait structures the fiber is parked on. The heap
//! scanner refuses to follow tagged values, which is what makes "not traced"
//! actually mean not traced: without the tag, one fiber in a wait cycle would
//! mark the next through its wait-queue pointer.
//!
//! The tag occupies high virtual-address bits that are guaranteed zero for
//! user-space addresses on the supported 64-bit targets. On targets without
//! that guarantee the feature degrades to ordinary tracing by configuring
//! [`DeadlockPolicy::Disabled`], in which case [`tag`] is the identity.

use crate::config::DeadlockPolicy;

// The tag relies on the upper address bits being clear; 32-bit targets are
// unsupported for detection.
const _: () = assert!(usize::BITS == 64);

/// Mask of the pointer bits reserved for the deadlock tag.
pub const TAG: usize = 0x7000_0000_0000_0000;

/// Complement of [`TAG`]; AND-ing with this recovers the raw pointer.
pub const TAG_CLEAR: usize = !TAG;

/// Whether `p` carries the deadlock tag.
///
/// # Examples
///
/// ```
/// use weftgc::config::DeadlockPolicy;
/// use weftgc::tagging::{is_tagged, tag, untag};
///
/// let p = 0x1000usize;
/// let t = tag(p, DeadlockPolicy::Reclaim);
/// assert!(is_tagged(t));
/// assert_eq!(untag(t), p);
/// assert_eq!(tag(p, DeadlockPolicy::Disabled), p);
/// ```
#[inline]
pub fn is_tagged(p: usize) -> bool {
    p & TAG == TAG
}

/// Apply the tag to `p`, or return `p` unchanged when detection is disabled.
#[inline]
pub fn tag(p: usize, policy: DeadlockPolicy) -> usize {
    if policy.detecting() {
        p | TAG
    } else {
        p
    }
}

/// Strip the tag from `p`.
#[inline]
pub fn untag(p: usize) -> usize {
    p & TAG_CLEAR
}
