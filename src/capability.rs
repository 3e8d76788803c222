//! Capability operations: create, derive, degrade, revoke (spec 4.2).
//!
//! Grounded on the original `kernel/cap/capability.c`'s `fetch_cap` /
//! `lookup_slot` / `create_cap` / `derive_cap` / `degrade_cap`, re-expressed
//! against the arena + CSpace split instead of raw pointers.

use alloc::vec::Vec;

use crate::arena::{CapArena, CapId, CapKind, CapNode, NotificationAux, Payload};
use crate::cspace::{CapabilityIndex, CSpaceTable};
use crate::error::{KernelError, KernelResult};
use crate::priv_bits::{derivable, PrivFlags};
use crate::process::Pid;

/// Resolves a `(cspace, cindex)` index to the `CapId` it currently names,
/// applying every check `fetch_cap` performs in the original: range, slot
/// populated (spec 4.2).
pub fn fetch(cspaces: &CSpaceTable, idx: CapabilityIndex) -> KernelResult<CapId> {
    if idx.is_invalid() || !idx.in_range() {
        log::warn!("fetch: invalid capability index {:?}", idx);
        return Err(KernelError::InvalidIndex);
    }
    cspaces.get(idx).ok_or_else(|| {
        log::warn!("fetch: no capability at {:?}", idx);
        KernelError::NoSuchCapability
    })
}

pub fn fetch_node<'a>(
    arena: &'a CapArena,
    cspaces: &CSpaceTable,
    idx: CapabilityIndex,
) -> KernelResult<&'a CapNode> {
    let id = fetch(cspaces, idx)?;
    arena.get(id).ok_or_else(|| {
        log::warn!("fetch_node: arena has no live node for {:?}", idx);
        KernelError::NoSuchCapability
    })
}

/// Places `id` at an explicit slot, failing if it is already populated
/// (spec 4.2, `insert_cap_at`).
pub fn insert_at(cspaces: &mut CSpaceTable, idx: CapabilityIndex, id: CapId) -> KernelResult<()> {
    if idx.is_invalid() || !idx.in_range() {
        log::warn!("insert_at: invalid capability index {:?}", idx);
        return Err(KernelError::InvalidIndex);
    }
    if cspaces.is_occupied(idx) {
        log::warn!("insert_at: slot {:?} already occupied", idx);
        return Err(KernelError::SlotOccupied);
    }
    cspaces.insert_at(idx, id);
    Ok(())
}

/// Places `id` at the first free slot, deterministically scanned
/// (spec 4.2, `insert_cap`).
pub fn insert(cspaces: &mut CSpaceTable, id: CapId) -> KernelResult<CapabilityIndex> {
    let idx = cspaces.lookup_free_slot().ok_or_else(|| {
        log::warn!("insert: no free slot in cspace table");
        KernelError::TableFull
    })?;
    cspaces.insert_at(idx, id);
    Ok(idx)
}

/// Creates a brand-new, parentless capability and inserts it into `cspaces`
/// at a freely chosen slot (spec 4.2, `create_cap`). Direct user-triggered
/// creation of PCB/TCB/Memory capabilities is not part of the syscall
/// surface (spec 4.3-4.5 expose only derive/degrade to user code); this
/// primitive is invoked by the kernel itself when standing up a new process,
/// thread, memory region or notification object.
pub fn create(
    arena: &mut CapArena,
    cspaces: &mut CSpaceTable,
    owner: Pid,
    kind: CapKind,
    payload: Payload,
    priv_word: PrivFlags,
    aux: Option<NotificationAux>,
) -> KernelResult<CapabilityIndex> {
    let id = arena.insert(CapNode {
        kind,
        payload,
        priv_word,
        aux,
        owner,
        index: CapabilityIndex::INVALID,
        parent: None,
        children: Vec::new(),
    });
    let idx = match insert(cspaces, id) {
        Ok(idx) => idx,
        Err(e) => {
            arena.remove(id);
            return Err(e);
        }
    };
    arena.get_mut(id).unwrap().index = idx;
    Ok(idx)
}

/// Derives a child capability sharing `parent_id`'s payload, narrowed to
/// `child_priv`, owned by `new_owner` and inserted into `target_cspaces`
/// (spec 4.2, `derive_cap`). Requires both that `child_priv` is derivable
/// from the parent's privilege word and that the parent itself carries
/// `DERIVE` (spec 4.1, `I-CAP-2`).
pub fn derive(
    arena: &mut CapArena,
    parent_id: CapId,
    new_owner: Pid,
    target_cspaces: &mut CSpaceTable,
    child_priv: PrivFlags,
) -> KernelResult<CapabilityIndex> {
    let parent = arena.get(parent_id).ok_or_else(|| {
        log::warn!("derive: parent capability {:?} not found", parent_id);
        KernelError::NoSuchCapability
    })?;
    if !derivable(parent.priv_word, child_priv) || !derivable(parent.priv_word, PrivFlags::DERIVE) {
        log::warn!(
            "derive: {:?} cannot derive {:?} from held {:?}",
            parent_id, child_priv, parent.priv_word
        );
        return Err(KernelError::InsufficientPrivilege);
    }
    let aux = match (&parent.aux, parent.kind) {
        (Some(aux), CapKind::Notification) => Some(*aux),
        _ => None,
    };

    let child = CapNode {
        kind: parent.kind,
        payload: parent.payload.clone(),
        priv_word: child_priv,
        aux,
        owner: new_owner,
        index: CapabilityIndex::INVALID,
        parent: Some(parent_id),
        children: Vec::new(),
    };
    let child_id = arena.insert(child);

    let idx = match insert(target_cspaces, child_id) {
        Ok(idx) => idx,
        Err(e) => {
            arena.remove(child_id);
            return Err(e);
        }
    };
    arena.get_mut(child_id).unwrap().index = idx;
    arena.get_mut(parent_id).unwrap().children.push(child_id);
    Ok(idx)
}

/// Narrows a capability's own privilege word in place. Existing descendants
/// keep whatever privilege they were derived with - degrade does not
/// cascade (spec 4.2, `degrade_cap`; spec 9 records this as a deliberate
/// choice, matching the original `degrade_cap`, which never walks
/// `children`).
pub fn degrade(arena: &mut CapArena, cap_id: CapId, new_priv: PrivFlags) -> KernelResult<()> {
    let node = arena.get_mut(cap_id).ok_or_else(|| {
        log::warn!("degrade: capability {:?} not found", cap_id);
        KernelError::NoSuchCapability
    })?;
    if !derivable(node.priv_word, new_priv) {
        log::warn!("degrade: {:?} cannot widen held {:?} to {:?}", cap_id, node.priv_word, new_priv);
        return Err(KernelError::InsufficientPrivilege);
    }
    node.priv_word = new_priv;
    Ok(())
}

/// Collects `cap_id` and every descendant in post-order (children fully
/// processed before their parent), the order `revoke` destroys in
/// (spec 4.2, `I-CAP-3`).
fn post_order(arena: &CapArena, cap_id: CapId, out: &mut Vec<CapId>) {
    if let Some(node) = arena.get(cap_id) {
        for &child in &node.children {
            post_order(arena, child, out);
        }
        out.push(cap_id);
    }
}

/// Destroys `cap_id` and its entire derivation subtree, post-order
/// (spec 4.2, `revoke_cap`, `I-CAP-3`: no descendant of a revoked
/// capability remains reachable afterward).
///
/// `unlink` is called once per destroyed node, owner's CSpace slot removal
/// included, so that cross-process children - which this module cannot
/// reach on its own, since it only ever sees one `CSpaceTable` at a time -
/// get unlinked from whichever process actually owns them.
pub fn revoke<F: FnMut(&CapNode)>(arena: &mut CapArena, cap_id: CapId, mut unlink: F) -> KernelResult<()> {
    if arena.get(cap_id).is_none() {
        log::warn!("revoke: capability {:?} not found", cap_id);
        return Err(KernelError::NoSuchCapability);
    }
    let mut order = Vec::new();
    post_order(arena, cap_id, &mut order);

    // Detach from the parent's children list before deleting, so a
    // partially-revoked tree is never left pointing at a freed id.
    let parent = arena.get(cap_id).and_then(|n| n.parent);
    if let Some(parent_id) = parent {
        if let Some(p) = arena.get_mut(parent_id) {
            p.children.retain(|&c| c != cap_id);
        }
    }

    for id in order {
        if let Some(node) = arena.get(id) {
            unlink(node);
        }
        arena.remove(id);
    }
    Ok(())
}
