//! Folder-to-label mapping: pure translation from an IMAP mailbox name to
//! the Gmail labels the migrated copy should carry.

/// Gmail system labels a source folder can map onto.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SystemLabel {
    Inbox,
    Sent,
    Trash,
    Spam,
    Draft,
}

impl SystemLabel {
    pub fn gmail_id(&self) -> &'static str {
        match self {
            SystemLabel::Inbox => "INBOX",
            SystemLabel::Sent => "SENT",
            SystemLabel::Trash => "TRASH",
            SystemLabel::Spam => "SPAM",
            SystemLabel::Draft => "DRAFT",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelMapping {
    /// Custom label path under the configured prefix, `/`-separated.
    pub custom_label: String,
    pub system_label: Option<SystemLabel>,
}

/// Maps an IMAP folder to `(custom label, optional system label)`.
///
/// `delimiter` is the hierarchy separator the server reported on LIST; it is
/// normalized to `/` and empty or whitespace-only components are collapsed.
/// Leaf matching is case-insensitive, first rule wins.
pub fn map_folder(folder: &str, delimiter: Option<&str>, prefix: &str) -> LabelMapping {
    let components = split_components(folder, delimiter);
    let path = components.join("/");
    let leaf = components.last().map(String::as_str).unwrap_or("");
    let leaf_lower = leaf.to_ascii_lowercase();

    if leaf_lower == "inbox" {
        return LabelMapping {
            custom_label: format!("{prefix}/Inbox"),
            system_label: Some(SystemLabel::Inbox),
        };
    }

    let system_label = if leaf_lower.starts_with("sent") {
        Some(SystemLabel::Sent)
    } else if leaf_lower.starts_with("trash") || leaf_lower.starts_with("deleted") {
        Some(SystemLabel::Trash)
    } else if leaf_lower.starts_with("spam") || leaf_lower.starts_with("junk") {
        Some(SystemLabel::Spam)
    } else if leaf_lower.starts_with("draft") {
        Some(SystemLabel::Draft)
    } else {
        None
    };

    LabelMapping {
        custom_label: format!("{prefix}/{path}"),
        system_label,
    }
}

fn split_components(folder: &str, delimiter: Option<&str>) -> Vec<String> {
    let mut parts: Vec<String> = Vec::new();
    let mut pieces: Vec<&str> = Vec::new();
    match delimiter {
        Some(delim) if !delim.is_empty() => pieces.extend(folder.split(delim)),
        // Servers that report NIL delimiters still tend to use `/` or `.`
        // in practice; `/` covers iCloud.
        _ => pieces.extend(folder.split('/')),
    }
    for piece in pieces {
        let trimmed = piece.trim();
        if !trimmed.is_empty() {
            parts.push(trimmed.to_string());
        }
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbox_maps_to_system_inbox() {
        let mapping = map_folder("INBOX", Some("/"), "iCloud");
        assert_eq!(mapping.custom_label, "iCloud/Inbox");
        assert_eq!(mapping.system_label, Some(SystemLabel::Inbox));
    }

    #[test]
    fn sent_messages_keeps_original_path() {
        let mapping = map_folder("Sent Messages", Some("/"), "iCloud");
        assert_eq!(mapping.custom_label, "iCloud/Sent Messages");
        assert_eq!(mapping.system_label, Some(SystemLabel::Sent));
    }

    #[test]
    fn nested_folder_has_no_system_label() {
        let mapping = map_folder("Projects/2024", Some("/"), "iCloud");
        assert_eq!(mapping.custom_label, "iCloud/Projects/2024");
        assert_eq!(mapping.system_label, None);
    }

    #[test]
    fn dot_delimiter_is_normalized() {
        let mapping = map_folder("Archive.Old.Receipts", Some("."), "iCloud");
        assert_eq!(mapping.custom_label, "iCloud/Archive/Old/Receipts");
        assert_eq!(mapping.system_label, None);
    }

    #[test]
    fn blank_components_are_collapsed() {
        let mapping = map_folder("Projects//  /2024", Some("/"), "iCloud");
        assert_eq!(mapping.custom_label, "iCloud/Projects/2024");
    }

    #[test]
    fn deleted_items_maps_to_trash() {
        let mapping = map_folder("Deleted Items", Some("/"), "iCloud");
        assert_eq!(mapping.system_label, Some(SystemLabel::Trash));
    }

    #[test]
    fn junk_maps_to_spam_case_insensitive() {
        let mapping = map_folder("JUNK", Some("/"), "iCloud");
        assert_eq!(mapping.system_label, Some(SystemLabel::Spam));
    }
}
