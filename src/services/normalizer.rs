//! Raw message normalization.
//!
//! Turns the RFC 5322 source fetched from the server into a
//! [`NormalizedMessage`]. Parsing is pure and never retried: a message that
//! fails here is logged and dropped by the caller.

use chrono::{DateTime, Utc};
use mail_parser::{Addr, Address as ParsedAddress, Message as ParsedMessage, MessageParser, MimeHeaders};
use thiserror::Error;

use crate::domain::{Address, AttachmentRef, NormalizedMessage, RawMessage};

/// Errors produced while normalizing a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("message payload is empty")]
    Empty,

    #[error("message payload could not be parsed")]
    Unparseable,

    #[error("required header missing: {0}")]
    MissingHeader(&'static str),
}

/// Parses a raw message into its canonical form.
///
/// The `Date` header wins over the server arrival time; when both are missing
/// the current time is used.
pub fn normalize(raw: &RawMessage) -> Result<NormalizedMessage, ParseError> {
    if raw.source.iter().all(u8::is_ascii_whitespace) {
        return Err(ParseError::Empty);
    }

    let message = MessageParser::default()
        .parse(&raw.source)
        .ok_or(ParseError::Unparseable)?;

    let sender = message
        .from()
        .and_then(|from| addresses(from).into_iter().next())
        .ok_or(ParseError::MissingHeader("From"))?;

    let mut recipients = message.to().map(addresses).unwrap_or_default();
    recipients.extend(message.cc().map(addresses).unwrap_or_default());

    let sent_at = message
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0))
        .or(raw.internal_date)
        .unwrap_or_else(Utc::now);

    Ok(NormalizedMessage {
        account_id: raw.account_id.clone(),
        folder: raw.folder.clone(),
        server_uid: raw.uid,
        message_id: message.message_id().map(|id| id.to_string()),
        subject: message.subject().unwrap_or_default().trim().to_string(),
        sender,
        recipients,
        sent_at,
        plain_body: message.body_text(0).map(|b| b.into_owned()),
        html_body: message.body_html(0).map(|b| b.into_owned()),
        attachment_refs: attachments(&message),
    })
}

/// Flattens an address header, including group members.
fn addresses(header: &ParsedAddress) -> Vec<Address> {
    let list: Vec<&Addr> = match header {
        ParsedAddress::List(list) => list.iter().collect(),
        ParsedAddress::Group(groups) => groups.iter().flat_map(|g| g.addresses.iter()).collect(),
    };

    list.into_iter().filter_map(convert_address).collect()
}

fn convert_address(addr: &Addr) -> Option<Address> {
    let email = addr.address()?.trim();
    if email.is_empty() {
        return None;
    }
    Some(Address {
        email: email.to_string(),
        name: addr
            .name()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string),
    })
}

fn attachments(message: &ParsedMessage) -> Vec<AttachmentRef> {
    message
        .attachments()
        .map(|part| AttachmentRef {
            filename: part.attachment_name().map(str::to_string),
            content_type: part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            size_bytes: part.contents().len() as u64,
        })
        .collect()
}
