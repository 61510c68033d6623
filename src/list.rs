// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Offset-based intrusive circular doubly-linked list. `prev`/`next` are
// offsets rather than native pointers so that structure identity survives
// processes mapping the same segment at different virtual addresses. All
// operations assume the caller already holds whatever lock serializes access
// to the segment; no internal synchronization is performed here.

use crate::offset::{Base, Offset};

/// A node in an offset-linked list. Used both as a free-list head (embedded
/// in the segment header) and as an intrusive node (embedded in a chunk).
#[repr(C)]
pub struct ListNode {
    pub prev: Offset,
    pub next: Offset,
}

impl ListNode {
    /// Initialize `node` as an empty, self-referential list (or list head).
    ///
    /// # Safety
    /// `node` must point to valid, writable memory within `base`'s segment.
    pub unsafe fn init(node: *mut ListNode, base: Base) {
        let self_off = base.offset_of(node as *const u8);
        (*node).prev = self_off;
        (*node).next = self_off;
    }

    /// # Safety
    /// `head` must point to a valid node within `base`'s segment.
    pub unsafe fn is_empty(head: *const ListNode, base: Base) -> bool {
        base.addr_of((*head).next) == head as *mut u8
    }

    /// Insert `node` immediately after `after`.
    ///
    /// # Safety
    /// `after` and `node` must point to valid, writable nodes within the
    /// same segment as `base`; `node` must not already be linked.
    pub unsafe fn add(base: Base, after: *mut ListNode, node: *mut ListNode) {
        let after_off = base.offset_of(after as *const u8);
        let node_off = base.offset_of(node as *const u8);
        let succ_off = (*after).next;
        let succ = base.addr_of(succ_off) as *mut ListNode;

        (*node).prev = after_off;
        (*node).next = succ_off;
        (*after).next = node_off;
        (*succ).prev = node_off;
    }

    /// Unlink `node` from whatever list it is on and re-initialize it as a
    /// standalone, self-referential node.
    ///
    /// # Safety
    /// `node` must point to a valid, linked node within `base`'s segment.
    pub unsafe fn del(base: Base, node: *mut ListNode) {
        let prev = base.addr_of((*node).prev) as *mut ListNode;
        let next = base.addr_of((*node).next) as *mut ListNode;
        (*prev).next = (*node).next;
        (*next).prev = (*node).prev;
        Self::init(node, base);
    }

    /// Detach and return the first node after `head`, or `None` if empty.
    ///
    /// # Safety
    /// `head` must point to a valid list head within `base`'s segment.
    pub unsafe fn pop_front(base: Base, head: *mut ListNode) -> Option<*mut ListNode> {
        if Self::is_empty(head, base) {
            return None;
        }
        let first = base.addr_of((*head).next) as *mut ListNode;
        Self::del(base, first);
        Some(first)
    }
}
