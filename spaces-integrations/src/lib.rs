pub mod ids;

/// Status labels published by the daemon, as seen by control clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatusLabel {
    Archived,
    Synced,
    Copying,
    Removing,
    Updating,
    Partial,
    Conflict,
}

impl EntryStatusLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Archived => "archived",
            Self::Synced => "synced",
            Self::Copying => "copying",
            Self::Removing => "removing",
            Self::Updating => "updating",
            Self::Partial => "partial",
            Self::Conflict => "conflict",
        }
    }
}
