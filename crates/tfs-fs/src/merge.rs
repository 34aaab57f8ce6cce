//! Three-way merge of filesystem trees.

use std::collections::HashMap;
use std::sync::Arc;

use tfs_btree::{iterate_delta, Node, TreeError};
use tfs_hugger::{HuggerError, Transaction};
use tracing::trace;

use crate::key::{BlockKey, SubType};
use crate::meta::InodeMeta;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    /// Apply the `src -> dst` change
    New,
    /// Keep what the transaction has
    Existing,
    /// Drop every key of the inode
    None,
}

fn ctime(data: &[u8]) -> Result<u64, HuggerError> {
    let meta: InodeMeta = bincode::deserialize(data).map_err(TreeError::from)?;
    Ok(meta.ctime_ns)
}

fn meta_verdict(
    current: Option<&[u8]>,
    old: Option<&[u8]>,
    new: Option<&[u8]>,
) -> Result<Verdict, HuggerError> {
    Ok(match (new, current) {
        // Deleted on both sides
        (None, None) => Verdict::None,
        (None, Some(current)) => {
            let old = old.map(ctime).transpose()?.unwrap_or_default();
            if old >= ctime(current)? {
                Verdict::None
            } else {
                Verdict::Existing
            }
        }
        (Some(_), None) => Verdict::New,
        (Some(new), Some(current)) => {
            if ctime(new)? > ctime(current)? {
                Verdict::New
            } else {
                Verdict::Existing
            }
        }
    })
}

/// Whether a directory entry change applies to the current value.
///
/// Entries are merged one by one so concurrent creates in the same
/// directory both survive. A remote delete or update only lands on an entry
/// that still holds the base value, unless the directory verdict is `New`.
fn entry_applies(
    verdict: Option<Verdict>,
    current: Option<&[u8]>,
    old: Option<&[u8]>,
    new: Option<&[u8]>,
) -> bool {
    if current == new || verdict == Some(Verdict::None) {
        return false;
    }
    current == old || (new.is_some() && verdict == Some(Verdict::New))
}

/// Replay the change `src -> dst` into `tr`.
///
/// Conflicts are settled per inode by comparing change times of the
/// metadata records. Directory entries are the exception: each one is merged
/// against the current tree on its own. With `local` the change comes from
/// a lost commit race on the same tree; changes of inodes whose metadata did
/// not move are then applied as they are.
pub fn merge_to3(
    tr: &mut Transaction,
    src: &Arc<Node>,
    dst: &Arc<Node>,
    local: bool,
) -> tfs_hugger::Result<()> {
    let tree = tr.tree().clone();
    let mut verdicts: HashMap<u64, Verdict> = HashMap::new();
    let mut apply = |raw: &[u8],
                     old: Option<&[u8]>,
                     new: Option<&[u8]>|
     -> Result<(), HuggerError> {
        let key = BlockKey::from_bytes(raw)
            .ok_or_else(|| TreeError::Corrupt(format!("bad filesystem key {raw:02x?}")))?;
        let ino = key.ino();

        if key.sub_type() == Some(SubType::DirName2Inode) {
            let verdict = match verdicts.get(&ino) {
                Some(v) => Some(*v),
                None if local => Some(Verdict::New),
                None => None,
            };
            let current = tr.get(raw)?;
            if entry_applies(verdict, current.as_deref(), old, new) {
                set_or_delete(tr, &key, raw, new)?;
            }
            return Ok(());
        }

        let verdict = match verdicts.get(&ino) {
            Some(v) => *v,
            None if key.sub_type() == Some(SubType::Meta) => {
                let current = tr.get(raw)?;
                let v = meta_verdict(current.as_deref(), old, new)?;
                if !local {
                    verdicts.insert(ino, v);
                }
                v
            }
            None if !local => return Ok(()),
            None => Verdict::New,
        };
        if verdict == Verdict::New {
            set_or_delete(tr, &key, raw, new)?;
        }
        Ok(())
    };
    iterate_delta(&tree, src, dst, &mut apply)?;

    for (ino, verdict) in verdicts {
        if verdict == Verdict::None {
            let start = BlockKey::first(ino, SubType::None);
            let end = BlockKey::first(ino, SubType::Last);
            tr.delete_range(start.as_bytes(), end.as_bytes())?;
        }
    }
    Ok(())
}

fn set_or_delete(
    tr: &mut Transaction,
    key: &BlockKey,
    raw: &[u8],
    new: Option<&[u8]>,
) -> Result<(), HuggerError> {
    match new {
        None => {
            if tr.delete(raw)? {
                trace!(?key, "merge delete");
            }
        }
        Some(value) => {
            trace!(?key, "merge set");
            tr.set(raw, value)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::S_IFREG;

    fn meta_at(ctime_ns: u64) -> Vec<u8> {
        let mut meta = InodeMeta::new(S_IFREG | 0o644, 0, 0, 1);
        meta.ctime_ns = ctime_ns;
        meta.encode().unwrap()
    }

    #[test]
    fn test_meta_verdicts() {
        let (t5, t10, t20) = (meta_at(5), meta_at(10), meta_at(20));

        assert_eq!(meta_verdict(None, Some(&t5), None).unwrap(), Verdict::None);
        assert_eq!(
            meta_verdict(Some(&t10), Some(&t10), None).unwrap(),
            Verdict::None
        );
        assert_eq!(
            meta_verdict(Some(&t20), Some(&t10), None).unwrap(),
            Verdict::Existing
        );
        assert_eq!(meta_verdict(None, None, Some(&t5)).unwrap(), Verdict::New);
        assert_eq!(
            meta_verdict(Some(&t10), Some(&t5), Some(&t20)).unwrap(),
            Verdict::New
        );
        assert_eq!(
            meta_verdict(Some(&t20), Some(&t5), Some(&t10)).unwrap(),
            Verdict::Existing
        );
        // Equal change times keep the existing record
        assert_eq!(
            meta_verdict(Some(&t10), Some(&t5), Some(&t10)).unwrap(),
            Verdict::Existing
        );
    }

    #[test]
    fn test_entry_applies_only_over_base_value() {
        let (base, ours, theirs) = (&b"1"[..], &b"2"[..], &b"3"[..]);
        let existing = Some(Verdict::Existing);

        // Sibling create in a directory whose metadata lost
        assert!(entry_applies(existing, None, None, Some(theirs)));
        assert!(entry_applies(None, None, None, Some(theirs)));
        // Untouched locally
        assert!(entry_applies(existing, Some(base), Some(base), None));
        assert!(entry_applies(existing, Some(base), Some(base), Some(theirs)));
        // Changed locally since the base
        assert!(!entry_applies(existing, Some(ours), Some(base), None));
        assert!(!entry_applies(existing, Some(ours), Some(base), Some(theirs)));
        assert!(!entry_applies(Some(Verdict::New), Some(ours), Some(base), None));
        assert!(entry_applies(Some(Verdict::New), Some(ours), Some(base), Some(theirs)));
        // Deleted directory is dropped as a whole
        assert!(!entry_applies(Some(Verdict::None), None, None, Some(theirs)));
        // Nothing to do
        assert!(!entry_applies(existing, Some(theirs), None, Some(theirs)));
    }
}
