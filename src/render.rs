//! Plain-text rendering of messages and pages.

use crate::model::MessageDescriptor;
use std::fmt::Write as _;

/// Bytes shown in a binary body dump.
pub const HEX_PREVIEW_BYTES: usize = 1024;

/// Truncate to at most `max_chars` characters, appending "..." if truncated.
///
/// Works on char boundaries, so multi-byte text is never split.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", s[..idx].trim_end()),
        None => s.to_string(),
    }
}

/// Pad or cut `s` to exactly `width` characters for a table cell.
pub fn fit_column(s: &str, width: usize) -> String {
    let flat: String = s
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    let count = flat.chars().count();
    if count <= width {
        return format!("{flat:<width$}");
    }
    if width <= 3 {
        return flat.chars().take(width).collect();
    }
    let cut: String = flat.chars().take(width - 3).collect();
    format!("{cut:<w$}...", w = width - 3)
}

/// Body as pretty JSON, else UTF-8 text, else a hex dump.
pub fn format_body(body: &[u8]) -> String {
    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(body) {
        if let Ok(pretty) = serde_json::to_string_pretty(&json) {
            return pretty;
        }
    }
    if let Ok(text) = std::str::from_utf8(body) {
        return text.to_string();
    }

    let shown = body.len().min(HEX_PREVIEW_BYTES);
    format!(
        "<binary {} bytes>\n{}",
        body.len(),
        hex::encode_upper(&body[..shown])
    )
}

fn header_line(out: &mut String, key: &str, value: Option<&str>) {
    let _ = writeln!(out, "{key}: {}", value.unwrap_or(""));
}

/// Header block, a `---` separator, then the formatted body.
pub fn format_message(message: &MessageDescriptor) -> String {
    let mut out = String::new();
    header_line(&mut out, "MessageId", message.message_id.as_deref());
    header_line(&mut out, "Subject", message.subject.as_deref());
    let _ = writeln!(out, "SequenceNumber: {}", message.sequence_number);
    if let Some(session) = &message.session_id {
        let _ = writeln!(out, "SessionId: {session}");
    }
    let enqueued = message
        .enqueued_time
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3fZ").to_string());
    header_line(&mut out, "Enqueued", enqueued.as_deref());
    header_line(&mut out, "ContentType", message.content_type.as_deref());
    if let Some(correlation) = &message.correlation_id {
        let _ = writeln!(out, "CorrelationId: {correlation}");
    }
    let _ = writeln!(out, "DeliveryCount: {}", message.delivery_count);

    if !message.application_properties.is_empty() {
        out.push_str("ApplicationProperties:\n");
        for (key, value) in &message.application_properties {
            let _ = writeln!(out, "  {key}: {value}");
        }
    }

    out.push_str("---\n");
    out.push_str(&format_body(&message.body));
    out
}

/// One-line preview of a body for table cells.
pub fn body_preview(body: &[u8]) -> String {
    match std::str::from_utf8(body) {
        Ok(text) => text.split_whitespace().collect::<Vec<_>>().join(" "),
        Err(_) => format!("<binary {} bytes>", body.len()),
    }
}

const COLUMNS: [(&str, usize); 5] = [
    ("Seq", 10),
    ("Enqueued", 19),
    ("Session", 16),
    ("MessageId", 24),
    ("Preview", 48),
];

/// Fixed-width table of a page of messages.
pub fn format_page(messages: &[MessageDescriptor]) -> String {
    let mut out = String::new();
    let header: Vec<String> = COLUMNS.iter().map(|(name, w)| fit_column(name, *w)).collect();
    let _ = writeln!(out, "{}", header.join(" ").trim_end());

    for message in messages {
        let cells = [
            message.sequence_number.to_string(),
            message
                .enqueued_time
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default(),
            message.session_id.clone().unwrap_or_default(),
            message.message_id.clone().unwrap_or_default(),
            body_preview(&message.body),
        ];
        let row: Vec<String> = cells
            .iter()
            .zip(COLUMNS.iter())
            .map(|(cell, (_, w))| fit_column(cell, *w))
            .collect();
        let _ = writeln!(out, "{}", row.join(" ").trim_end());
    }
    out
}
