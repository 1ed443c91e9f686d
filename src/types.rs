use chrono::Utc;

/// Per-message lifecycle. `Skipped` and `Failed` are terminal unless an
/// explicit reset is applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageStatus {
    Discovered,
    Downloaded,
    Skipped,
    Imported,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Discovered => "discovered",
            MessageStatus::Downloaded => "downloaded",
            MessageStatus::Skipped => "skipped",
            MessageStatus::Imported => "imported",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn from_str(raw: &str) -> Option<Self> {
        match raw {
            "discovered" => Some(MessageStatus::Discovered),
            "downloaded" => Some(MessageStatus::Downloaded),
            "skipped" => Some(MessageStatus::Skipped),
            "imported" => Some(MessageStatus::Imported),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointStatus {
    Scanning,
    Done,
    Error,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Scanning => "scanning",
            CheckpointStatus::Done => "done",
            CheckpointStatus::Error => "error",
        }
    }

    pub fn from_str(raw: &str) -> Option<Self> {
        match raw {
            "scanning" => Some(CheckpointStatus::Scanning),
            "done" => Some(CheckpointStatus::Done),
            "error" => Some(CheckpointStatus::Error),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct FolderCheckpoint {
    pub folder: String,
    pub uidvalidity: u32,
    pub highest_uid_done: u32,
    pub last_scan_ts: Option<i64>,
    pub message_count: Option<u32>,
    pub status: CheckpointStatus,
}

/// The header fields the pipeline needs before deciding whether a body is
/// worth fetching: filter evaluation plus the fingerprint inputs.
#[derive(Clone, Debug, Default)]
pub struct HeaderSummary {
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub cc: Option<String>,
    pub bcc: Option<String>,
    pub delivered_to: Vec<String>,
    pub date_raw: Option<String>,
    pub date_epoch: Option<i64>,
    /// IMAP INTERNALDATE of the fetch, not a header field; filled in by the
    /// pipeline after the header parse.
    pub received_epoch: Option<i64>,
}

/// One unit of work on the ingestion queue: a message that has reached
/// `downloaded` and is waiting for its Gmail call.
#[derive(Clone, Debug)]
pub struct WorkItem {
    pub row_id: i64,
    pub fingerprint: String,
    pub folder: String,
    pub evidence_path: String,
    pub date_epoch: Option<i64>,
}

/// Outcome of `reserve_discovery`. `Duplicate` means the reference row was
/// already recorded inside the same transaction.
#[derive(Clone, Debug)]
pub enum Reservation {
    New { row_id: i64 },
    Resumed { row_id: i64, status: MessageStatus },
    Duplicate,
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}
