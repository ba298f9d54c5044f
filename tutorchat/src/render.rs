//! Plain-text rendering of session state for the line-mode client.

use chrono::{Local, TimeZone};
use tutorchat_proto::event::Notification;
use tutorchat_proto::ids::{Timestamp, UserId};
use tutorchat_proto::message::{ChatRequest, MessageKind};

use crate::session::{DeliveryState, LocalMessage};

/// Format an epoch-millisecond timestamp in local time.
pub fn format_timestamp(ts: Timestamp, format: &str) -> String {
    let ms = ts.as_millis();
    let Ok(secs) = i64::try_from(ms / 1000) else {
        return "??:??".to_string();
    };
    let nsecs = u32::try_from((ms % 1000) * 1_000_000).unwrap_or(0);
    match Local.timestamp_opt(secs, nsecs) {
        chrono::LocalResult::Single(dt) => dt.format(format).to_string(),
        _ => "??:??".to_string(),
    }
}

const fn status_marker(state: &DeliveryState) -> &'static str {
    match state {
        DeliveryState::Pending => "\u{22ef}",
        DeliveryState::Sent => "\u{2713}",
        DeliveryState::Read => "\u{2713}\u{2713}",
        DeliveryState::Failed(_) => "\u{2717}",
    }
}

/// One display line for `message`, numbered by its position.
pub fn message_line(index: usize, message: &LocalMessage, me: &UserId, format: &str) -> String {
    let time = format_timestamp(message.timestamp, format);
    let who = if message.is_from(me) {
        "you"
    } else {
        message.sender_name.as_str()
    };
    let body = if message.deleted {
        "[message deleted]".to_string()
    } else {
        match (message.kind, message.file_url.as_deref()) {
            (MessageKind::Text | MessageKind::System, _) | (_, None) => message.content.clone(),
            (kind, Some(url)) if message.content.is_empty() => format!("[{}] {url}", kind.as_str()),
            (kind, Some(url)) => format!("[{}] {url} {}", kind.as_str(), message.content),
        }
    };

    let mut line = format!("{index:>3} [{time}] {who}: {body}");
    if message.is_from(me) {
        line.push(' ');
        line.push_str(status_marker(&message.state));
        if let DeliveryState::Failed(reason) = &message.state {
            line.push_str(&format!(" ({reason}; /retry to resend)"));
        }
    }
    line
}

/// One display line for a chat request.
pub fn request_line(request: &ChatRequest, format: &str) -> String {
    format!(
        "[{}] {} ({}): {}",
        format_timestamp(request.time, format),
        request.student_name,
        request.student_id,
        request.message
    )
}

/// One display line for a notification.
pub fn notification_line(notification: &Notification) -> String {
    format!(
        "* {} [{}] {}",
        notification.title, notification.kind, notification.message
    )
}
