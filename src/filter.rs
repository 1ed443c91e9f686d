//! Address filter: decides whether a discovered message belongs to the
//! migration based on who sent or received it.

use mailparse::{addrparse, dateparse, parse_headers, MailAddr, MailHeaderMap};

use crate::config::FilterConfig;
use crate::errors::{MigResult, MigrateError};
use crate::types::HeaderSummary;

/// Headers consulted on the recipient side. `To`/`Cc`/`Bcc` cover the
/// addressed copy; the delivery headers catch alias deliveries that never
/// appear in the visible recipients (custom-domain forwarding).
const DELIVERY_HEADERS: &[&str] = &["Delivered-To", "X-Original-To", "Envelope-To"];

#[derive(Clone, Debug)]
pub struct AddressFilter {
    targets: Vec<String>,
    include_sender: bool,
    include_recipients: bool,
}

impl AddressFilter {
    pub fn new(config: &FilterConfig) -> Self {
        Self {
            targets: config.target_addresses.clone(),
            include_sender: config.include_sender,
            include_recipients: config.include_recipients,
        }
    }

    /// True when the message should be downloaded and imported. An empty
    /// target list admits everything.
    pub fn matches(&self, headers: &HeaderSummary) -> bool {
        if self.targets.is_empty() {
            return true;
        }
        if self.include_sender {
            if let Some(from) = &headers.from {
                if self.header_matches(from) {
                    return true;
                }
            }
        }
        if self.include_recipients {
            for value in [&headers.to, &headers.cc, &headers.bcc]
                .into_iter()
                .flatten()
            {
                if self.header_matches(value) {
                    return true;
                }
            }
            for value in &headers.delivered_to {
                if self.header_matches(value) {
                    return true;
                }
            }
        }
        false
    }

    fn header_matches(&self, raw: &str) -> bool {
        if let Ok(addrs) = addrparse(raw) {
            for addr in addrs.iter() {
                let specs: Vec<&str> = match addr {
                    MailAddr::Single(info) => vec![info.addr.as_str()],
                    MailAddr::Group(group) => {
                        group.addrs.iter().map(|a| a.addr.as_str()).collect()
                    }
                };
                for spec in specs {
                    let lowered = spec.to_ascii_lowercase();
                    if self.targets.iter().any(|t| t == &lowered) {
                        return true;
                    }
                }
            }
        }
        // Unparseable header: substring match keeps malformed but
        // recognizable deliveries in scope.
        let lowered = raw.to_ascii_lowercase();
        self.targets.iter().any(|t| lowered.contains(t))
    }
}

/// Parses the raw header block of a message into the fields the pipeline
/// needs for filter evaluation and fingerprinting.
pub fn parse_header_summary(header_bytes: &[u8]) -> MigResult<HeaderSummary> {
    let (headers, _) = parse_headers(header_bytes)
        .map_err(|e| MigrateError::Parse(format!("header block did not parse: {e}")))?;

    let date_raw = headers.get_first_value("Date");
    let date_epoch = date_raw
        .as_deref()
        .and_then(|raw| dateparse(raw).ok())
        .filter(|epoch| *epoch > 0);

    let mut delivered_to = Vec::new();
    for name in DELIVERY_HEADERS {
        delivered_to.extend(headers.get_all_values(name));
    }

    Ok(HeaderSummary {
        message_id: headers.get_first_value("Message-Id"),
        subject: headers.get_first_value("Subject"),
        from: headers.get_first_value("From"),
        to: headers.get_first_value("To"),
        cc: headers.get_first_value("Cc"),
        bcc: headers.get_first_value("Bcc"),
        delivered_to,
        date_raw,
        date_epoch,
        received_epoch: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter_for(targets: &[&str]) -> AddressFilter {
        AddressFilter::new(&FilterConfig {
            target_addresses: targets.iter().map(|t| t.to_string()).collect(),
            include_sender: true,
            include_recipients: true,
        })
    }

    #[test]
    fn empty_target_list_admits_everything() {
        let filter = filter_for(&[]);
        assert!(filter.matches(&HeaderSummary::default()));
    }

    #[test]
    fn matches_sender() {
        let filter = filter_for(&["x@d.com"]);
        let headers = HeaderSummary {
            from: Some("X Sender <X@D.com>".into()),
            ..Default::default()
        };
        assert!(filter.matches(&headers));
    }

    #[test]
    fn matches_delivery_headers() {
        let filter = filter_for(&["alias@custom.com"]);
        let headers = HeaderSummary {
            from: Some("a@d.com".into()),
            to: Some("b@d.com".into()),
            delivered_to: vec!["alias@custom.com".into()],
            ..Default::default()
        };
        assert!(filter.matches(&headers));
    }

    #[test]
    fn misses_unrelated_message() {
        let filter = filter_for(&["alias@custom.com"]);
        let headers = HeaderSummary {
            from: Some("a@d.com".into()),
            to: Some("b@d.com".into()),
            ..Default::default()
        };
        assert!(!filter.matches(&headers));
    }

    #[test]
    fn parses_header_block() {
        let raw = concat!(
            "Message-Id: <abc@d.com>\r\n",
            "Date: Mon, 01 Jan 2024 00:00:00 +0000\r\n",
            "From: a@d.com\r\n",
            "To: b@d.com\r\n",
            "Delivered-To: alias@custom.com\r\n",
            "Subject: hi\r\n",
            "\r\n",
        );
        let summary = parse_header_summary(raw.as_bytes()).unwrap();
        assert_eq!(summary.message_id.as_deref(), Some("<abc@d.com>"));
        assert_eq!(summary.date_epoch, Some(1_704_067_200));
        assert_eq!(summary.delivered_to, vec!["alias@custom.com".to_string()]);
    }
}
