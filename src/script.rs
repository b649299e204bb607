//! Conversation script parsing.
//!
//! A script is a line-oriented text file. Pass 1 strips global directives
//! (`<unread:N>`, `<radius:X>`); pass 2 classifies the remaining lines by the
//! first matching pattern: break, `say` intro, plug/rizz reply, thread header,
//! two-part message, single-part message. Unmatched lines are dropped.

use std::sync::OnceLock;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Serialize;

/// The renderer draws at 2x logical density, so directive radii are scaled.
pub const CORNER_RADIUS_SCALE: f32 = 2.0;

const IMAGE_EXTENSIONS: [&str; 5] = [".png", ".jpg", ".jpeg", ".gif", ".webp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Thread {
    pub contact_name: String,
    pub avatar_ref: Option<String>,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    Text(TextMessage),
    Image(TextMessage),
    Plug(CardMessage),
    Rizz(CardMessage),
    Break(BreakMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextMessage {
    pub sender: Side,
    pub speaker: String,
    pub recipient: Option<String>,
    pub display_text: String,
    pub speech_text: String,
    pub sfx_ref: Option<String>,
    pub audio_only: bool,
}

impl TextMessage {
    /// A bubble made only of dots is a typing indicator; it gets the
    /// notification sound instead of speech.
    pub fn is_dots_only(&self) -> bool {
        let trimmed = self.display_text.trim();
        !trimmed.is_empty() && trimmed.chars().all(|c| c == '.' || c == '…')
    }
}

/// One spoken line of a plug/rizz turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CardLine {
    pub speaker: String,
    pub display_text: String,
    pub speech_text: String,
    pub sfx_ref: Option<String>,
    pub silent: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CardMessage {
    pub intro: Option<CardLine>,
    pub reply: CardLine,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BreakMessage {
    pub duration_seconds: f64,
}

/// A `(speaker, text)` pair that needs synthesized speech.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpokenPart<'a> {
    pub speaker: &'a str,
    pub text: &'a str,
}

impl Message {
    pub fn spoken_parts(&self) -> Vec<SpokenPart<'_>> {
        match self {
            Message::Text(text) => {
                if text.audio_only || text.is_dots_only() || text.speech_text.trim().is_empty() {
                    Vec::new()
                } else {
                    vec![SpokenPart {
                        speaker: &text.speaker,
                        text: &text.speech_text,
                    }]
                }
            }
            Message::Image(_) | Message::Break(_) => Vec::new(),
            Message::Plug(card) | Message::Rizz(card) => card
                .intro
                .iter()
                .chain(std::iter::once(&card.reply))
                .filter(|line| !line.silent && !line.speech_text.trim().is_empty())
                .map(|line| SpokenPart {
                    speaker: &line.speaker,
                    text: &line.speech_text,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ScriptDirectives {
    pub unread_count: Option<u32>,
    pub corner_radius: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Script {
    pub threads: Vec<Thread>,
    pub directives: ScriptDirectives,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnrecognizedLine {
    pub line_number: usize,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ScriptStats {
    pub threads: usize,
    pub messages: usize,
    pub texts: usize,
    pub images: usize,
    pub cards: usize,
    pub breaks: usize,
    pub spoken_lines: usize,
    pub break_seconds: f64,
}

impl Script {
    pub fn stats(&self) -> ScriptStats {
        let mut stats = ScriptStats {
            threads: self.threads.len(),
            ..ScriptStats::default()
        };
        for message in self.threads.iter().flat_map(|thread| &thread.messages) {
            stats.messages += 1;
            stats.spoken_lines += message.spoken_parts().len();
            match message {
                Message::Text(_) => stats.texts += 1,
                Message::Image(_) => stats.images += 1,
                Message::Plug(_) | Message::Rizz(_) => stats.cards += 1,
                Message::Break(pause) => {
                    stats.breaks += 1;
                    stats.break_seconds += pause.duration_seconds;
                }
            }
        }
        stats
    }
}

pub fn parse_script(raw: &str) -> Script {
    parse_script_with_diagnostics(raw).0
}

pub fn parse_threads(raw: &str) -> Vec<Thread> {
    parse_script(raw).threads
}

/// Same as [`parse_script`], also reporting every line no pattern matched.
pub fn parse_script_with_diagnostics(raw: &str) -> (Script, Vec<UnrecognizedLine>) {
    let normalized = raw.replace("\r\n", "\n");
    let lines = normalized
        .lines()
        .enumerate()
        .map(|(idx, line)| (idx + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty())
        .collect::<Vec<_>>();

    let (directives, body) = extract_directives(&lines);

    let mut parser = ScriptParser::default();
    for (line_number, line) in body {
        if !parser.feed(line) {
            tracing::debug!(line = line_number, text = line, "dropping unrecognized script line");
            parser.unrecognized.push(UnrecognizedLine {
                line_number,
                text: line.to_owned(),
            });
        }
    }
    let (threads, unrecognized) = parser.finish();

    (
        Script {
            threads,
            directives,
        },
        unrecognized,
    )
}

fn extract_directives<'a>(
    lines: &[(usize, &'a str)],
) -> (ScriptDirectives, Vec<(usize, &'a str)>) {
    let mut directives = ScriptDirectives::default();
    let mut body = Vec::with_capacity(lines.len());

    for &(line_number, line) in lines {
        if let Some(captures) = unread_re().captures(line) {
            if let Ok(count) = captures[1].parse::<u32>() {
                directives.unread_count = Some(count);
                continue;
            }
        }
        if let Some(captures) = radius_re().captures(line) {
            if let Ok(radius) = captures[1].parse::<f32>() {
                directives.corner_radius = Some(radius * CORNER_RADIUS_SCALE);
                continue;
            }
        }
        body.push((line_number, line));
    }

    (directives, body)
}

/// Plug/rizz intro buffering. A `say` line moves to `PendingIntro`; the next
/// reply consumes it; a thread header clears it.
#[derive(Debug, Clone, Default, PartialEq)]
enum IntroState {
    #[default]
    Idle,
    PendingIntro(CardLine),
}

impl IntroState {
    fn buffer(&mut self, intro: CardLine) {
        if let IntroState::PendingIntro(previous) = self {
            tracing::debug!(
                speaker = previous.speaker.as_str(),
                "replacing unconsumed plug/rizz intro"
            );
        }
        *self = IntroState::PendingIntro(intro);
    }

    fn take(&mut self) -> Option<CardLine> {
        match std::mem::take(self) {
            IntroState::Idle => None,
            IntroState::PendingIntro(intro) => Some(intro),
        }
    }

    fn clear_on_thread_boundary(&mut self) {
        if let Some(dangling) = self.take() {
            tracing::debug!(
                speaker = dangling.speaker.as_str(),
                "discarding plug/rizz intro with no reply before thread boundary"
            );
        }
    }
}

#[derive(Debug, Default)]
struct ScriptParser {
    threads: Vec<Thread>,
    open: Option<Thread>,
    intro: IntroState,
    unrecognized: Vec<UnrecognizedLine>,
}

impl ScriptParser {
    /// Returns false when the line matched no pattern or had no open thread.
    fn feed(&mut self, line: &str) -> bool {
        if let Some(captures) = break_re().captures(line) {
            let duration_seconds = match parse_duration_seconds(&captures[1]) {
                Ok(seconds) if seconds > 0.0 => seconds,
                _ => {
                    tracing::debug!(line, "ignoring break without a positive duration");
                    return false;
                }
            };
            return self.push(Message::Break(BreakMessage { duration_seconds }));
        }

        if let Some(captures) = say_re().captures(line) {
            if self.open.is_none() {
                return false;
            }
            let intro = card_line(captures[1].trim(), &captures[2]);
            self.intro.buffer(intro);
            return true;
        }

        if let Some(captures) = card_re().captures(line) {
            let Some(thread) = self.open.as_ref() else {
                return false;
            };
            let speaker = captures
                .get(2)
                .map(|m| m.as_str().trim().to_owned())
                .filter(|speaker| !speaker.is_empty())
                .unwrap_or_else(|| thread.contact_name.clone());
            let card = CardMessage {
                intro: self.intro.take(),
                reply: card_line(&speaker, &captures[3]),
            };
            let message = if captures[1].eq_ignore_ascii_case("rizz") {
                Message::Rizz(card)
            } else {
                Message::Plug(card)
            };
            return self.push(message);
        }

        if let Some(captures) = header_re().captures(line) {
            self.flush_open();
            self.intro.clear_on_thread_boundary();
            self.open = Some(Thread {
                contact_name: captures[2].trim().to_owned(),
                avatar_ref: captures
                    .get(3)
                    .map(|m| m.as_str().trim().to_owned())
                    .filter(|avatar| !avatar.is_empty()),
                messages: Vec::new(),
            });
            return true;
        }

        if let Some(captures) = two_part_re().captures(line) {
            let recipient = captures[2].trim().to_owned();
            return self.push_text(captures[1].trim(), Some(recipient), &captures[3]);
        }

        if let Some(captures) = single_part_re().captures(line) {
            return self.push_text(captures[1].trim(), None, &captures[2]);
        }

        false
    }

    fn push_text(&mut self, speaker: &str, recipient: Option<String>, raw_text: &str) -> bool {
        let Some(thread) = self.open.as_ref() else {
            return false;
        };
        let parts = TextParts::parse(raw_text);
        let sender = side_for(speaker, &thread.contact_name);
        let is_image = is_image_reference(&parts.display);
        let message = TextMessage {
            sender,
            speaker: speaker.to_owned(),
            recipient,
            audio_only: parts.display.is_empty() || (!is_image && parts.speech.is_empty()),
            display_text: parts.display,
            speech_text: parts.speech,
            sfx_ref: parts.sfx_ref,
        };
        self.push(if is_image {
            Message::Image(message)
        } else {
            Message::Text(message)
        })
    }

    fn push(&mut self, message: Message) -> bool {
        match self.open.as_mut() {
            Some(thread) => {
                thread.messages.push(message);
                true
            }
            None => false,
        }
    }

    fn flush_open(&mut self) {
        if let Some(thread) = self.open.take() {
            if thread.messages.is_empty() {
                tracing::debug!(
                    contact = thread.contact_name.as_str(),
                    "discarding thread with no messages"
                );
            } else {
                self.threads.push(thread);
            }
        }
    }

    fn finish(mut self) -> (Vec<Thread>, Vec<UnrecognizedLine>) {
        self.flush_open();
        self.intro.clear_on_thread_boundary();
        (self.threads, self.unrecognized)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct TextParts {
    display: String,
    speech: String,
    sfx_ref: Option<String>,
}

impl TextParts {
    fn parse(raw: &str) -> Self {
        let (text, sfx_ref) = split_sfx(raw.trim());
        let (display, speech_override) = match text.split_once(" == ") {
            Some((display, speech)) => (display.trim(), Some(speech.trim())),
            None => (text.trim(), None),
        };
        let speech = speech_override
            .map(strip_redactions)
            .filter(|speech| !speech.is_empty())
            .unwrap_or_else(|| strip_redactions(display));
        Self {
            display: display.to_owned(),
            speech,
            sfx_ref,
        }
    }
}

fn card_line(speaker: &str, raw_text: &str) -> CardLine {
    let trimmed = raw_text.trim();
    let (silent, text) = match trimmed.strip_prefix('~') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    let parts = TextParts::parse(text);
    CardLine {
        speaker: speaker.to_owned(),
        silent: silent || parts.speech.is_empty(),
        display_text: parts.display,
        speech_text: parts.speech,
        sfx_ref: parts.sfx_ref,
    }
}

fn split_sfx(text: &str) -> (&str, Option<String>) {
    match sfx_re().captures(text) {
        Some(captures) => {
            let body = captures.get(1).map_or("", |m| m.as_str());
            let name = captures[2].trim();
            if name.is_empty() {
                (text, None)
            } else {
                (body.trim_end(), Some(name.to_owned()))
            }
        }
        None => (text, None),
    }
}

/// Removes `{...}` redaction markers, keeping the redacted words for speech.
pub fn strip_redactions(text: &str) -> String {
    text.chars()
        .filter(|c| *c != '{' && *c != '}')
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn side_for(speaker: &str, contact: &str) -> Side {
    if speaker.trim().eq_ignore_ascii_case(contact.trim()) {
        Side::Incoming
    } else {
        Side::Outgoing
    }
}

fn is_image_reference(display: &str) -> bool {
    if display.is_empty() || display.chars().any(char::is_whitespace) {
        return false;
    }
    let lowered = display.to_ascii_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| lowered.ends_with(ext))
}

/// Parses `2`, `2s`, `1.5s`, or `500ms` into seconds.
pub fn parse_duration_seconds(raw: &str) -> Result<f64> {
    let raw = raw.trim().to_ascii_lowercase();
    if raw.is_empty() {
        bail!("duration cannot be empty");
    }

    let (number, scale) = if let Some(ms) = raw.strip_suffix("ms") {
        (ms, 0.001)
    } else if let Some(seconds) = raw.strip_suffix('s') {
        (seconds, 1.0)
    } else {
        (raw.as_str(), 1.0)
    };
    let value: f64 = number.trim().parse().context("duration is not a number")?;
    if !value.is_finite() || value < 0.0 {
        bail!("duration must be a non-negative finite number");
    }
    Ok(value * scale)
}

fn unread_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^<\s*unread\s*:\s*(\d+)\s*>$").expect("unread regex should compile")
    })
}

fn radius_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^<\s*radius\s*:\s*(\d+(?:\.\d+)?)\s*>$")
            .expect("radius regex should compile")
    })
}

fn break_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^<\s*break\s*:\s*([^>]+?)\s*>$").expect("break regex should compile")
    })
}

fn say_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^say\s+([^:]+?)\s*:\s*(.*)$").expect("say regex should compile")
    })
}

fn card_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(plug|rizz)(?:\s+([^:]+?))?\s*:\s*(.*)$")
            .expect("plug/rizz regex should compile")
    })
}

fn header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^(imessage|messages|sms|whatsapp|instagram)\s*:\s*([^|]*[^|\s])\s*(?:\|\s*(.*))?$",
        )
        .expect("thread header regex should compile")
    })
}

fn two_part_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([^:>]+?)\s*>\s*([^:>]+?)\s*:\s*(.*)$")
            .expect("two-part message regex should compile")
    })
}

fn single_part_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([^:]+?)\s*:\s*(.*)$").expect("single-part message regex should compile")
    })
}

fn sfx_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(.*?)\s*\[([^\[\]]*)\]$").expect("sfx suffix regex should compile")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(message: &Message) -> &TextMessage {
        match message {
            Message::Text(text) | Message::Image(text) => text,
            other => panic!("expected text message, got {other:?}"),
        }
    }

    #[test]
    fn parses_scenario_thread() {
        let script = "iMessage: Bob\nBob > Alice: Hi\nAlice > Bob: Hey [knock]\n<break:2s>\nAlice > Bob: ...\n";
        let threads = parse_threads(script);
        assert_eq!(threads.len(), 1);
        let thread = &threads[0];
        assert_eq!(thread.contact_name, "Bob");
        assert_eq!(thread.messages.len(), 4);

        let hi = text(&thread.messages[0]);
        assert_eq!(hi.sender, Side::Incoming);
        assert_eq!(hi.speaker, "Bob");
        assert_eq!(hi.recipient.as_deref(), Some("Alice"));
        assert_eq!(hi.speech_text, "Hi");

        let hey = text(&thread.messages[1]);
        assert_eq!(hey.sender, Side::Outgoing);
        assert_eq!(hey.display_text, "Hey");
        assert_eq!(hey.sfx_ref.as_deref(), Some("knock"));

        assert_eq!(
            thread.messages[2],
            Message::Break(BreakMessage {
                duration_seconds: 2.0
            })
        );
        assert!(text(&thread.messages[3]).is_dots_only());
        assert!(thread.messages[3].spoken_parts().is_empty());
    }

    #[test]
    fn directives_are_removed_before_classification() {
        let script = parse_script("<unread:3>\niMessage: Dana\n<radius:9>\nDana: yo\n");
        assert_eq!(script.directives.unread_count, Some(3));
        assert_eq!(script.directives.corner_radius, Some(18.0));
        assert_eq!(script.threads[0].messages.len(), 1);
    }

    #[test]
    fn speech_override_and_redaction() {
        let threads = parse_threads(
            "sms: Sam\nme: meet at {the docks} == meet at the place\nme: call {Jess} now\n",
        );
        let first = text(&threads[0].messages[0]);
        assert_eq!(first.display_text, "meet at {the docks}");
        assert_eq!(first.speech_text, "meet at the place");
        let second = text(&threads[0].messages[1]);
        assert_eq!(second.display_text, "call {Jess} now");
        assert_eq!(second.speech_text, "call Jess now");
    }

    #[test]
    fn sfx_is_stripped_before_override_split() {
        let threads = parse_threads("sms: Sam\nSam: lol == laughing out loud [laugh]\n");
        let message = text(&threads[0].messages[0]);
        assert_eq!(message.display_text, "lol");
        assert_eq!(message.speech_text, "laughing out loud");
        assert_eq!(message.sfx_ref.as_deref(), Some("laugh"));
    }

    #[test]
    fn image_and_audio_only_messages() {
        let threads = parse_threads("sms: Sam\nSam: photos/cat.JPG\nme: [doorbell]\n");
        assert!(matches!(threads[0].messages[0], Message::Image(_)));
        let bell = text(&threads[0].messages[1]);
        assert!(bell.audio_only);
        assert_eq!(bell.sfx_ref.as_deref(), Some("doorbell"));
        assert!(threads[0].messages[1].spoken_parts().is_empty());
    }

    #[test]
    fn fully_redacted_lines_are_never_spoken() {
        let threads = parse_threads("sms: Sam\nSam: {}\nplug me: { }\n");
        let blank = text(&threads[0].messages[0]);
        assert!(blank.audio_only);
        assert!(threads[0].messages[0].spoken_parts().is_empty());
        let Message::Plug(plug) = &threads[0].messages[1] else {
            panic!("expected plug");
        };
        assert!(plug.reply.silent);
        assert!(threads[0].messages[1].spoken_parts().is_empty());
    }

    #[test]
    fn header_with_avatar() {
        let threads = parse_threads("WhatsApp: Mom | avatars/mom.png\nMom: dinner?\n");
        assert_eq!(threads[0].contact_name, "Mom");
        assert_eq!(threads[0].avatar_ref.as_deref(), Some("avatars/mom.png"));
    }

    #[test]
    fn plug_merges_pending_intro() {
        let threads = parse_threads(
            "iMessage: Kim\nsay Narrator: watch this [whoosh]\nplug me: you up?\nrizz: ~ not now\n",
        );
        let messages = &threads[0].messages;
        assert_eq!(messages.len(), 2);
        let Message::Plug(plug) = &messages[0] else {
            panic!("expected plug");
        };
        let intro = plug.intro.as_ref().expect("intro should merge");
        assert_eq!(intro.speaker, "Narrator");
        assert_eq!(intro.sfx_ref.as_deref(), Some("whoosh"));
        assert_eq!(plug.reply.speech_text, "you up?");
        assert_eq!(messages[0].spoken_parts().len(), 2);

        let Message::Rizz(rizz) = &messages[1] else {
            panic!("expected rizz");
        };
        assert!(rizz.intro.is_none(), "intro must be consumed by the first reply");
        assert_eq!(rizz.reply.speaker, "Kim");
        assert!(rizz.reply.silent);
        assert!(messages[1].spoken_parts().is_empty());
    }

    #[test]
    fn pending_intro_does_not_cross_thread_boundary() {
        let threads = parse_threads(
            "iMessage: A\nA: hi\nsay Narrator: dangling\niMessage: B\nplug me: hello\n",
        );
        assert_eq!(threads.len(), 2);
        let Message::Plug(plug) = &threads[1].messages[0] else {
            panic!("expected plug");
        };
        assert!(plug.intro.is_none());
    }

    #[test]
    fn empty_threads_and_orphan_lines_are_dropped() {
        let (script, unrecognized) = parse_script_with_diagnostics(
            "Bob: before any thread\niMessage: Empty\niMessage: Real\nReal: ok\n??? nothing here\n",
        );
        assert_eq!(script.threads.len(), 1);
        assert_eq!(script.threads[0].contact_name, "Real");
        let numbers = unrecognized
            .iter()
            .map(|line| line.line_number)
            .collect::<Vec<_>>();
        assert_eq!(numbers, vec![1, 5]);
    }

    #[test]
    fn parsing_is_deterministic() {
        let raw = "iMessage: Bob\nBob: a\n<break:500ms>\nsay X: y\nrizz: z\n";
        assert_eq!(parse_script(raw), parse_script(raw));
    }

    #[test]
    fn break_durations() {
        assert_eq!(parse_duration_seconds("2").unwrap(), 2.0);
        assert_eq!(parse_duration_seconds("1.5s").unwrap(), 1.5);
        assert!((parse_duration_seconds("250ms").unwrap() - 0.25).abs() < 1e-12);
        assert!(parse_duration_seconds("soon").is_err());
        let (_, unrecognized) = parse_script_with_diagnostics("iMessage: A\n<break:soon>\n");
        assert_eq!(unrecognized.len(), 1);
        let (script, unrecognized) =
            parse_script_with_diagnostics("iMessage: A\nA: hi\n<break:0s>\n<break:0ms>\n");
        assert_eq!(script.threads[0].messages.len(), 1);
        assert_eq!(unrecognized.len(), 2);
    }

    #[test]
    fn stats_count_kinds() {
        let script = parse_script(
            "iMessage: A\nA: hi\nme: pic.png\n<break:1s>\n<break:0.5s>\nplug: yo\n",
        );
        let stats = script.stats();
        assert_eq!(stats.threads, 1);
        assert_eq!(stats.messages, 5);
        assert_eq!(stats.images, 1);
        assert_eq!(stats.breaks, 2);
        assert_eq!(stats.cards, 1);
        assert_eq!(stats.spoken_lines, 2);
        assert!((stats.break_seconds - 1.5).abs() < 1e-12);
    }
}
