//! Branch targets.
//!
//! A label that is referenced before it is bound threads every pending
//! reference site into a singly linked list stored inside the unresolved
//! displacement fields themselves: each 4-byte field holds the offset of the
//! previous pending site, and the first one holds [`NO_LINK`]. Binding walks
//! the list from the most recent site and overwrites each field with its final
//! relative displacement.

use crate::{Error, Result, buffer::CodeBuffer};
use tracing::trace;

/// Chain terminator stored in the oldest pending site.
pub const NO_LINK: i32 = -1;

/// Identifies the assembler whose buffer a label refers into.
pub(crate) type OwnerId = u64;

/// A branch target.
///
/// The state is opaque: a pending chain lives in exactly one label, and a
/// linked or bound label only makes sense in the buffer of the assembler
/// that linked or bound it. Labels are neither `Clone` nor `Copy`.
#[derive(Debug, Default)]
pub struct Label {
    state: State,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Not bound and never referenced
    #[default]
    Unbound,
    /// Not bound; holds the offset of the most recent pending reference
    Linked { site: usize, owner: OwnerId },
    /// Bound to the given code offset
    Bound { pos: usize, owner: OwnerId },
}

impl Label {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_bound(&self) -> bool {
        matches!(self.state, State::Bound { .. })
    }

    pub fn is_linked(&self) -> bool {
        matches!(self.state, State::Linked { .. })
    }

    pub fn is_unbound(&self) -> bool {
        matches!(self.state, State::Unbound)
    }

    /// Returns the bound code offset, if any
    pub fn position(&self) -> Option<usize> {
        match self.state {
            State::Bound { pos, .. } => Some(pos),
            _ => None,
        }
    }

    /// Fails unless the label is unbound or belongs to `owner`.
    pub(crate) fn check_owner(&self, owner: OwnerId) -> Result<()> {
        match self.state {
            State::Unbound => Ok(()),
            State::Linked { owner: o, .. } | State::Bound { owner: o, .. } if o == owner => Ok(()),
            _ => Err(Error::InvalidLabelUse(
                "label belongs to a different assembler".to_string(),
            )),
        }
    }

    /// Emits a 4-byte relative displacement to this label at the cursor.
    ///
    /// `trailing` is the number of instruction bytes from the start of the
    /// displacement field to the end of the instruction. A bound label gets
    /// its final displacement right away; otherwise the site is linked.
    pub(crate) fn emit_reference(
        &mut self,
        owner: OwnerId,
        buf: &mut CodeBuffer,
        trailing: usize,
    ) -> Result<()> {
        self.check_owner(owner)?;
        match self.state {
            State::Bound { pos, .. } => {
                let end = buf.size() + trailing;
                buf.emit_i32(displacement(pos, end))
            }
            State::Unbound | State::Linked { .. } => self.link(owner, buf),
        }
    }

    /// Appends a placeholder holding the current chain head and makes the new
    /// site the head.
    pub(crate) fn link(&mut self, owner: OwnerId, buf: &mut CodeBuffer) -> Result<()> {
        self.check_owner(owner)?;
        let previous = match self.state {
            State::Unbound => NO_LINK,
            State::Linked { site, .. } => site as i32,
            State::Bound { pos, .. } => {
                return Err(Error::InvalidLabelUse(format!(
                    "cannot link a label already bound at offset {}",
                    pos
                )));
            }
        };
        let site = buf.size();
        buf.emit_i32(previous)?;
        self.state = State::Linked { site, owner };
        Ok(())
    }

    /// Binds the label to the current end of `buf`, patching every pending
    /// site. Returns the number of patched sites.
    ///
    /// The whole chain is validated before anything is patched, so a failed
    /// bind leaves both the buffer and the label untouched.
    pub(crate) fn bind(&mut self, owner: OwnerId, buf: &mut CodeBuffer) -> Result<usize> {
        self.check_owner(owner)?;
        let bound = buf.size();
        let sites = match self.state {
            State::Bound { pos, .. } => {
                return Err(Error::InvalidLabelUse(format!(
                    "label is already bound at offset {}",
                    pos
                )));
            }
            State::Unbound => Vec::new(),
            State::Linked { site, .. } => pending_sites(buf, site)?,
        };
        for &site in &sites {
            buf.store_i32(site, displacement(bound, site + 4))?;
        }
        trace!("Label bound at offset {} ({} sites patched)", bound, sites.len());
        self.state = State::Bound { pos: bound, owner };
        Ok(sites.len())
    }
}

/// Walks the chain starting at `head` and returns every pending site.
fn pending_sites(buf: &CodeBuffer, head: usize) -> Result<Vec<usize>> {
    let mut sites = Vec::new();
    let mut site = head;
    loop {
        let next = buf.load_i32(site)?;
        sites.push(site);
        if next == NO_LINK {
            return Ok(sites);
        }
        // Sites are linked in emission order, so the chain only ever moves
        // backwards.
        site = match usize::try_from(next) {
            Ok(prev) if prev < site => prev,
            _ => {
                return Err(Error::InvalidLabelUse(format!(
                    "corrupted patch chain at offset {}",
                    site
                )));
            }
        };
    }
}

/// Relative displacement from the end of an instruction to `target`.
/// Both offsets are below `i32::MAX`, so the difference fits.
fn displacement(target: usize, end: usize) -> i32 {
    (target as i64 - end as i64) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER: OwnerId = 1;

    fn head(label: &Label) -> Option<usize> {
        match label.state {
            State::Linked { site, .. } => Some(site),
            _ => None,
        }
    }

    #[test]
    fn links_sites_into_chain() {
        let mut buf = CodeBuffer::default();
        let mut label = Label::new();
        assert!(label.is_unbound());

        buf.emit_u8(0xe9).unwrap();
        label.link(OWNER, &mut buf).unwrap();
        assert_eq!(head(&label), Some(1));
        assert_eq!(buf.load_i32(1).unwrap(), NO_LINK);

        buf.emit_u8(0xe9).unwrap();
        label.link(OWNER, &mut buf).unwrap();
        assert_eq!(head(&label), Some(6));
        assert_eq!(buf.load_i32(6).unwrap(), 1);

        buf.emit_u8(0xe9).unwrap();
        label.emit_reference(OWNER, &mut buf, 4).unwrap();
        assert_eq!(head(&label), Some(11));
        assert_eq!(buf.load_i32(11).unwrap(), 6);
    }

    #[test]
    fn bind_patches_every_site() {
        let mut buf = CodeBuffer::default();
        let mut label = Label::new();
        let mut sites = Vec::new();
        for _ in 0..4 {
            buf.emit_u8(0x90).unwrap();
            sites.push(buf.size());
            label.link(OWNER, &mut buf).unwrap();
        }
        buf.emit_u8(0xc3).unwrap();

        let patched = label.bind(OWNER, &mut buf).unwrap();
        assert_eq!(patched, 4);
        let bound = buf.size();
        assert!(label.is_bound());
        assert_eq!(label.position(), Some(bound));
        for site in sites {
            assert_eq!(buf.load_i32(site).unwrap(), (bound - (site + 4)) as i32);
        }
    }

    #[test]
    fn bind_unreferenced_label() {
        let mut buf = CodeBuffer::default();
        buf.emit_u8(0x90).unwrap();
        let mut label = Label::new();
        assert_eq!(label.bind(OWNER, &mut buf).unwrap(), 0);
        assert_eq!(label.position(), Some(1));
        assert_eq!(buf.as_bytes(), &[0x90]);
    }

    #[test]
    fn bound_reference_is_resolved_immediately() {
        let mut buf = CodeBuffer::default();
        let mut label = Label::new();
        label.bind(OWNER, &mut buf).unwrap();
        buf.emit_bytes(&[0x90; 3]).unwrap();
        buf.emit_u8(0xe9).unwrap();
        label.emit_reference(OWNER, &mut buf, 4).unwrap();
        // jmp at 3, ends at 8, target 0
        assert_eq!(buf.load_i32(4).unwrap(), -8);
        assert_eq!(label.position(), Some(0));
    }

    #[test]
    fn rebinding_fails() {
        let mut buf = CodeBuffer::default();
        let mut label = Label::new();
        label.bind(OWNER, &mut buf).unwrap();
        let err = label.bind(OWNER, &mut buf).unwrap_err();
        assert!(matches!(err, Error::InvalidLabelUse(_)));
        assert!(label.link(OWNER, &mut buf).is_err());
    }

    #[test]
    fn corrupted_chain_leaves_buffer_untouched() {
        let mut buf = CodeBuffer::default();
        let mut label = Label::new();
        label.link(OWNER, &mut buf).unwrap();
        label.link(OWNER, &mut buf).unwrap();
        // Point the head back at itself.
        buf.store_i32(4, 4).unwrap();
        let before = buf.as_bytes().to_vec();
        assert!(matches!(
            label.bind(OWNER, &mut buf),
            Err(Error::InvalidLabelUse(_))
        ));
        assert_eq!(buf.as_bytes(), &before[..]);
        assert_eq!(head(&label), Some(4));
    }

    #[test]
    fn foreign_owner_is_rejected() {
        let mut buf = CodeBuffer::default();
        let mut linked = Label::new();
        linked.link(OWNER, &mut buf).unwrap();
        let before = buf.as_bytes().to_vec();
        assert!(matches!(
            linked.bind(OWNER + 1, &mut buf),
            Err(Error::InvalidLabelUse(_))
        ));
        assert!(linked.link(OWNER + 1, &mut buf).is_err());
        assert_eq!(buf.as_bytes(), &before[..]);
        assert!(linked.is_linked());

        let mut bound = Label::new();
        bound.bind(OWNER, &mut buf).unwrap();
        assert!(bound.emit_reference(OWNER + 1, &mut buf, 4).is_err());
        assert_eq!(buf.as_bytes(), &before[..]);
    }
}
