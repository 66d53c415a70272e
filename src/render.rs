//! Raw message to markdown rendering
//!
//! A pure function of its inputs: identical message sequences always produce
//! byte-identical output, because the incremental append strategy and the
//! idempotence guarantee both depend on it. Unresolvable mentions degrade to
//! the raw ID, never to a render failure.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::rolodex::Rolodex;
use crate::sync::types::{ts_value, RawMessage};

static USER_MENTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<@([A-Z0-9]+)>").expect("user mention regex"));
static CHANNEL_MENTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<#([A-Z0-9]+)(?:\|([^>]+))?>").expect("channel mention regex"));
static LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<(https?://[^>|]+)(?:\|([^>]+))?>").expect("link regex"));
static CODE_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```([^`]+)```").expect("code block regex"));
static BOLD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(^|[^\\*])\*([^*\n]+)\*").expect("bold regex"));
static ITALIC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(^|[^\\_\w])_([^_\n]+)_").expect("italic regex"));
static STRIKE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(^|[^\\~])~([^~\n]+)~").expect("strike regex"));

/// Rendered output for one channel: header block plus one line per message.
/// Derived value, recomputed each run; never persisted on its own.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedConversation {
    pub header: Vec<String>,
    pub lines: Vec<String>,
    pub message_count: usize,
}

/// Render an ordered message sequence. `exported_at` is passed in rather
/// than read from the clock so the function stays deterministic.
pub fn render(
    channel_name: &str,
    channel_id: &str,
    messages: &[RawMessage],
    rolodex: &Rolodex,
    exported_at: DateTime<Utc>,
) -> RenderedConversation {
    let header = header_lines(channel_name, channel_id, messages.len(), exported_at);
    let lines = messages
        .iter()
        .map(|m| markdown_line(m, rolodex))
        .collect();

    RenderedConversation {
        header,
        lines,
        message_count: messages.len(),
    }
}

fn header_lines(
    channel_name: &str,
    channel_id: &str,
    count: usize,
    exported_at: DateTime<Utc>,
) -> Vec<String> {
    vec![
        format!("# {}", channel_name),
        String::new(),
        format!("**Channel ID:** {}", channel_id),
        format!("**Exported:** {}", exported_at.format("%Y-%m-%d %H:%M:%S")),
        format!("**Message Count:** {}", count),
        String::new(),
        "---".to_string(),
        String::new(),
    ]
}

/// One markdown line for one message.
pub fn markdown_line(msg: &RawMessage, rolodex: &Rolodex) -> String {
    let ts_str = format_ts(&msg.ts);
    let author = author_name(msg, rolodex);

    // System messages get a fixed phrasing and no body.
    if let Some(action) = system_action(msg.subtype.as_deref()) {
        return format!("- **{}** *{}* {}", ts_str, author, action);
    }

    let mut text = rewrite_mrkdwn(&msg.text, rolodex);

    for file in &msg.files {
        let rendered = match &file.url {
            Some(url) => format!("[{}]({})", file.name, url),
            None => format!("(file: {})", file.name),
        };
        if text.is_empty() {
            text = rendered;
        } else {
            text.push(' ');
            text.push_str(&rendered);
        }
    }

    if !msg.reactions.is_empty() {
        let summary = msg
            .reactions
            .iter()
            .map(|r| format!(":{}: {}", r.name, r.count))
            .collect::<Vec<_>>()
            .join(", ");
        text.push_str(&format!(" [{}]", summary));
    }

    let thread_info = match msg.reply_count {
        Some(1) => " (1 reply)".to_string(),
        Some(n) if n > 1 => format!(" ({} replies)", n),
        _ => String::new(),
    };

    // Embedded newlines become markdown hard breaks so one message stays
    // one logical line.
    let text = text.replace('\n', "  \n");

    if msg.is_thread_reply() {
        format!("    - **{}** *{}*: \u{21b3} {}", ts_str, author, text)
    } else {
        format!("- **{}** *{}*{}: {}", ts_str, author, thread_info, text)
    }
}

fn format_ts(ts: &str) -> String {
    let secs = ts_value(ts) as i64;
    DateTime::<Utc>::from_timestamp(secs, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn author_name(msg: &RawMessage, rolodex: &Rolodex) -> String {
    if let Some(bot) = &msg.bot_name {
        return bot.clone();
    }
    match &msg.user {
        Some(uid) => rolodex
            .display_name(uid)
            .unwrap_or(uid.as_str())
            .to_string(),
        None => "System".to_string(),
    }
}

fn system_action(subtype: Option<&str>) -> Option<&'static str> {
    match subtype? {
        "channel_join" => Some("joined the channel"),
        "channel_leave" => Some("left the channel"),
        "channel_topic" => Some("changed the channel topic"),
        "channel_purpose" => Some("changed the channel purpose"),
        _ => None,
    }
}

/// Rewrite Slack mrkdwn into regular markdown: mentions, links, then the
/// inline styling tokens.
fn rewrite_mrkdwn(text: &str, rolodex: &Rolodex) -> String {
    if text.is_empty() {
        return String::new();
    }

    let text = USER_MENTION_RE.replace_all(text, |caps: &Captures| {
        let uid = &caps[1];
        format!("@{}", rolodex.display_name(uid).unwrap_or(uid))
    });

    let text = CHANNEL_MENTION_RE.replace_all(&text, |caps: &Captures| {
        let name = caps.get(2).map(|m| m.as_str()).unwrap_or(&caps[1]);
        format!("#{}", name)
    });

    let text = LINK_RE.replace_all(&text, |caps: &Captures| {
        let url = &caps[1];
        let label = caps.get(2).map(|m| m.as_str()).unwrap_or(url);
        format!("[{}]({})", label, url)
    });

    let text = CODE_BLOCK_RE.replace_all(&text, "```\n$1\n```");
    let text = BOLD_RE.replace_all(&text, "$1**$2**");
    let text = ITALIC_RE.replace_all(&text, "$1*$2*");
    let text = STRIKE_RE.replace_all(&text, "$1~~$2~~");

    text.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::types::{FileAttachment, Provenance, Reaction};

    fn msg(ts: &str, user: Option<&str>, text: &str) -> RawMessage {
        RawMessage {
            ts: ts.into(),
            user: user.map(String::from),
            text: text.into(),
            thread_ts: None,
            reply_count: None,
            reactions: vec![],
            files: vec![],
            subtype: None,
            bot_name: None,
            provenance: Provenance::Api,
        }
    }

    fn rolodex() -> Rolodex {
        Rolodex::from_entries([("U111AAA", "Ada Lovelace"), ("U222BBB", "Grace Hopper")])
    }

    fn exported_at() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_render_is_deterministic() {
        let messages = vec![
            msg("1700000000.000100", Some("U111AAA"), "hello *world*"),
            msg("1700000060.000200", Some("U222BBB"), "hi <@U111AAA>"),
        ];
        let first = render("#general", "C123", &messages, &rolodex(), exported_at());
        let second = render("#general", "C123", &messages, &rolodex(), exported_at());
        assert_eq!(first, second);
    }

    #[test]
    fn test_header_fields() {
        let rendered = render("#general", "C123", &[], &rolodex(), exported_at());
        assert_eq!(rendered.header[0], "# #general");
        assert!(rendered.header.contains(&"**Channel ID:** C123".to_string()));
        assert!(rendered.header.contains(&"**Message Count:** 0".to_string()));
        assert!(rendered.header.contains(&"---".to_string()));
    }

    #[test]
    fn test_user_mention_resolved() {
        let line = markdown_line(&msg("100.000000", Some("U111AAA"), "ping <@U222BBB>"), &rolodex());
        assert!(line.contains("@Grace Hopper"), "line: {}", line);
        assert!(line.contains("*Ada Lovelace*"), "line: {}", line);
    }

    #[test]
    fn test_unresolved_mention_falls_back_to_raw_id() {
        let line = markdown_line(&msg("100.000000", Some("U999ZZZ"), "hi <@U888YYY>"), &rolodex());
        assert!(line.contains("@U888YYY"), "line: {}", line);
        assert!(line.contains("*U999ZZZ*"), "line: {}", line);
    }

    #[test]
    fn test_channel_mention() {
        let line = markdown_line(
            &msg("100.000000", None, "see <#C123ABCD|random> and <#C456EFGH>"),
            &rolodex(),
        );
        assert!(line.contains("#random"), "line: {}", line);
        assert!(line.contains("#C456EFGH"), "line: {}", line);
    }

    #[test]
    fn test_links() {
        let line = markdown_line(
            &msg("100.000000", None, "<https://example.com|docs> and <https://plain.dev>"),
            &rolodex(),
        );
        assert!(line.contains("[docs](https://example.com)"), "line: {}", line);
        assert!(line.contains("[https://plain.dev](https://plain.dev)"), "line: {}", line);
    }

    #[test]
    fn test_inline_styling() {
        let line = markdown_line(
            &msg("100.000000", None, "*bold* and _lean_ and ~gone~"),
            &rolodex(),
        );
        assert!(line.contains("**bold**"), "line: {}", line);
        assert!(line.contains("*lean*"), "line: {}", line);
        assert!(line.contains("~~gone~~"), "line: {}", line);
    }

    #[test]
    fn test_snake_case_survives_italic_rewrite() {
        let line = markdown_line(&msg("100.000000", None, "check thread_ts field"), &rolodex());
        assert!(line.contains("thread_ts"), "line: {}", line);
    }

    #[test]
    fn test_reactions_suffix() {
        let mut m = msg("100.000000", Some("U111AAA"), "shipped");
        m.reactions = vec![
            Reaction { name: "tada".into(), count: 4 },
            Reaction { name: "eyes".into(), count: 1 },
        ];
        let line = markdown_line(&m, &rolodex());
        assert!(line.ends_with("[:tada: 4, :eyes: 1]"), "line: {}", line);
    }

    #[test]
    fn test_file_attachment_link() {
        let mut m = msg("100.000000", Some("U111AAA"), "");
        m.files = vec![FileAttachment {
            name: "report.pdf".into(),
            url: Some("https://files.slack.com/report.pdf".into()),
        }];
        let line = markdown_line(&m, &rolodex());
        assert!(
            line.contains("[report.pdf](https://files.slack.com/report.pdf)"),
            "line: {}",
            line
        );
    }

    #[test]
    fn test_system_message() {
        let mut m = msg("100.000000", Some("U111AAA"), "ignored");
        m.subtype = Some("channel_join".into());
        let line = markdown_line(&m, &rolodex());
        assert!(line.ends_with("*Ada Lovelace* joined the channel"), "line: {}", line);
    }

    #[test]
    fn test_bot_message_author() {
        let mut m = msg("100.000000", None, "build passed");
        m.bot_name = Some("ci-bot".into());
        let line = markdown_line(&m, &rolodex());
        assert!(line.contains("*ci-bot*"), "line: {}", line);
    }

    #[test]
    fn test_thread_reply_indented_with_prefix() {
        let mut parent = msg("150.000000", Some("U111AAA"), "question?");
        parent.thread_ts = Some("150.000000".into());
        parent.reply_count = Some(1);
        let mut reply = msg("151.000000", Some("U222BBB"), "answer");
        reply.thread_ts = Some("150.000000".into());

        let rendered = render("#general", "C123", &[parent, reply], &rolodex(), exported_at());
        assert_eq!(rendered.lines.len(), 2);
        assert!(rendered.lines[0].contains("(1 reply)"), "parent: {}", rendered.lines[0]);
        assert!(rendered.lines[1].starts_with("    - "), "reply: {}", rendered.lines[1]);
        assert!(rendered.lines[1].contains("\u{21b3} answer"), "reply: {}", rendered.lines[1]);
    }

    #[test]
    fn test_newlines_become_hard_breaks() {
        let line = markdown_line(&msg("100.000000", None, "one\ntwo"), &rolodex());
        assert!(line.contains("one  \ntwo"), "line: {}", line);
    }

    #[test]
    fn test_provenance_does_not_affect_output() {
        let api = msg("100.000000", Some("U111AAA"), "same text");
        let mut dom = api.clone();
        dom.provenance = Provenance::Dom;
        assert_eq!(markdown_line(&api, &rolodex()), markdown_line(&dom, &rolodex()));
    }

    #[test]
    fn test_timestamp_rendered_utc() {
        // 1700000000 = 2023-11-14 22:13:20 UTC
        let line = markdown_line(&msg("1700000000.000100", None, "x"), &rolodex());
        assert!(line.contains("**2023-11-14 22:13**"), "line: {}", line);
    }
}
