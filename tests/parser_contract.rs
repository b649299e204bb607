use chatreel::script::{
    parse_script, parse_script_with_diagnostics, parse_threads, Message, Side,
};

const SCENARIO: &str = "iMessage: Bob\nBob > Alice: Hi\nAlice > Bob: Hey [knock]\n<break:2s>\nAlice > Bob: ...\n";

#[test]
fn scenario_script_has_one_thread_with_four_messages() {
    let threads = parse_threads(SCENARIO);
    assert_eq!(threads.len(), 1);
    let thread = &threads[0];
    assert_eq!(thread.contact_name, "Bob");
    assert_eq!(thread.messages.len(), 4);

    let Message::Text(hi) = &thread.messages[0] else {
        panic!("first message should be text");
    };
    assert_eq!(hi.sender, Side::Incoming);
    assert_eq!(hi.recipient.as_deref(), Some("Alice"));
    assert_eq!(hi.speech_text, "Hi");

    let Message::Text(hey) = &thread.messages[1] else {
        panic!("second message should be text");
    };
    assert_eq!(hey.sender, Side::Outgoing);
    assert_eq!(hey.display_text, "Hey");
    assert_eq!(hey.sfx_ref.as_deref(), Some("knock"));

    let Message::Break(pause) = &thread.messages[2] else {
        panic!("third message should be a break");
    };
    assert!((pause.duration_seconds - 2.0).abs() < 1e-9);

    let Message::Text(dots) = &thread.messages[3] else {
        panic!("fourth message should be text");
    };
    assert!(dots.is_dots_only());
    assert!(thread.messages[3].spoken_parts().is_empty());
}

#[test]
fn parsing_twice_is_structurally_identical() {
    let raw = "<unread:4>\nWhatsApp: Mia | mia.png\nMia: look {at this}\nme: photo.jpg\nsay me: watch\nrizz: ~smooth [chime]\n";
    assert_eq!(parse_script(raw), parse_script(raw));
}

#[test]
fn crlf_and_blank_lines_are_ignored() {
    let unix = parse_script("SMS: Dad\n\nDad: call me\nme: ok\n");
    let windows = parse_script("SMS: Dad\r\n\r\n   \r\nDad: call me\r\nme: ok\r\n");
    assert_eq!(unix, windows);
}

#[test]
fn diagnostics_report_dropped_lines_with_numbers() {
    let raw = "orphan: before any thread\nInstagram: Zoe\nZoe: hi\n<break:soon>\n!!!\n";
    let (script, unrecognized) = parse_script_with_diagnostics(raw);
    assert_eq!(script.threads.len(), 1);
    assert_eq!(script.threads[0].messages.len(), 1);
    let numbers = unrecognized
        .iter()
        .map(|line| line.line_number)
        .collect::<Vec<_>>();
    assert_eq!(numbers, vec![1, 4, 5]);
    assert_eq!(unrecognized[1].text, "<break:soon>");
}

#[test]
fn card_reply_defaults_speaker_to_contact_and_marks_silence() {
    let threads = parse_threads("iMessage: Kai\nsay me: ~hold on\nplug: try the new app [ding]\n");
    let Message::Plug(card) = &threads[0].messages[0] else {
        panic!("expected plug card");
    };
    let intro = card.intro.as_ref().expect("intro should merge into the reply");
    assert!(intro.silent);
    assert_eq!(intro.display_text, "hold on");
    assert_eq!(card.reply.speaker, "Kai");
    assert!(!card.reply.silent);
    assert_eq!(card.reply.sfx_ref.as_deref(), Some("ding"));
    assert_eq!(threads[0].messages[0].spoken_parts().len(), 1);
}

#[test]
fn script_without_threads_parses_to_nothing() {
    assert!(parse_threads("").is_empty());
    assert!(parse_threads("me: hello\n<break:1s>\n").is_empty());
}
