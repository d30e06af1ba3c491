//! Per-channel read positions

use crate::types::EntryId;

/// Read id meaning "only entries never delivered to this group"
pub const NEW_ENTRIES: &str = ">";

/// Where the next read of a channel starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    /// Direct read: the last delivered id
    Direct(EntryId),

    /// Consumer-group read
    Group(GroupCursor),
}

/// Consumer-group read position
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupCursor {
    /// Re-reading this consumer's unacknowledged entries after the given id
    Pending(EntryId),

    /// Reading new entries; `last_delivered` is kept for diagnostics only
    New { last_delivered: Option<EntryId> },
}

impl Cursor {
    /// Group cursor that first drains this consumer's pending entries
    pub fn group() -> Self {
        Cursor::Group(GroupCursor::Pending(EntryId::zero()))
    }

    /// Id to pass to the broker read
    pub fn read_id(&self) -> &str {
        match self {
            Cursor::Direct(id) => id.as_str(),
            Cursor::Group(GroupCursor::Pending(id)) => id.as_str(),
            Cursor::Group(GroupCursor::New { .. }) => NEW_ENTRIES,
        }
    }

    /// Move past a read that returned `last` as its highest id
    ///
    /// An empty pending read means the backlog is drained and the
    /// cursor switches to new entries.
    pub fn advance(&mut self, last: Option<&EntryId>) {
        match self {
            Cursor::Direct(current) => {
                if let Some(last) = last {
                    if last > current {
                        *current = last.clone();
                    }
                }
            }
            Cursor::Group(GroupCursor::Pending(current)) => match last {
                Some(last) => *current = last.clone(),
                None => *self = Cursor::Group(GroupCursor::New { last_delivered: None }),
            },
            Cursor::Group(GroupCursor::New { last_delivered }) => {
                if let Some(last) = last {
                    *last_delivered = Some(last.clone());
                }
            }
        }
    }

    /// True while the cursor is replaying pending entries
    pub fn is_replaying(&self) -> bool {
        matches!(self, Cursor::Group(GroupCursor::Pending(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_cursor_only_moves_forward() {
        let mut cursor = Cursor::Direct(EntryId::new("5-0"));
        cursor.advance(Some(&EntryId::new("7-1")));
        assert_eq!(cursor.read_id(), "7-1");
        cursor.advance(Some(&EntryId::new("6-0")));
        assert_eq!(cursor.read_id(), "7-1");
        cursor.advance(None);
        assert_eq!(cursor.read_id(), "7-1");
    }

    #[test]
    fn test_group_cursor_drains_pending_then_reads_new() {
        let mut cursor = Cursor::group();
        assert!(cursor.is_replaying());
        assert_eq!(cursor.read_id(), "0-0");

        cursor.advance(Some(&EntryId::new("3-0")));
        assert_eq!(cursor.read_id(), "3-0");

        cursor.advance(None);
        assert!(!cursor.is_replaying());
        assert_eq!(cursor.read_id(), NEW_ENTRIES);

        cursor.advance(Some(&EntryId::new("9-0")));
        assert_eq!(cursor.read_id(), NEW_ENTRIES);
        assert_eq!(
            cursor,
            Cursor::Group(GroupCursor::New {
                last_delivered: Some(EntryId::new("9-0"))
            })
        );
    }
}
