//! Text-to-keystroke conversion for `/hid/print`: maps printable
//! characters onto the builtin US-layout table, wrapping shifted
//! characters into a ShiftLeft hold.

use kvmd_keymap::Key;

/// Key transition sequence reproducing `text` on the managed host.
/// Unknown characters are skipped; newlines map through the Enter key.
pub fn text_to_key_events(text: &str) -> Vec<(&'static Key, bool)> {
    let shift = kvmd_keymap::by_web("ShiftLeft").expect("ShiftLeft in keymap");
    let mut events = Vec::new();
    let mut shifted = false;
    for ch in text.chars() {
        let ch = if ch == '\r' { '\n' } else { ch };
        let Some((key, needs_shift)) = kvmd_keymap::by_char(ch) else {
            continue;
        };
        if needs_shift != shifted {
            events.push((shift, needs_shift));
            shifted = needs_shift;
        }
        events.push((key, true));
        events.push((key, false));
    }
    if shifted {
        events.push((shift, false));
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(events: &[(&Key, bool)]) -> Vec<(String, bool)> {
        events
            .iter()
            .map(|(key, state)| (key.web.to_owned(), *state))
            .collect()
    }

    #[test]
    fn plain_text() {
        let events = render(&text_to_key_events("ab"));
        assert_eq!(
            events,
            [
                ("KeyA".to_owned(), true),
                ("KeyA".to_owned(), false),
                ("KeyB".to_owned(), true),
                ("KeyB".to_owned(), false),
            ]
        );
    }

    #[test]
    fn shift_wraps_uppercase_runs() {
        let events = render(&text_to_key_events("aB!c"));
        assert_eq!(
            events,
            [
                ("KeyA".to_owned(), true),
                ("KeyA".to_owned(), false),
                ("ShiftLeft".to_owned(), true),
                ("KeyB".to_owned(), true),
                ("KeyB".to_owned(), false),
                ("Digit1".to_owned(), true),
                ("Digit1".to_owned(), false),
                ("ShiftLeft".to_owned(), false),
                ("KeyC".to_owned(), true),
                ("KeyC".to_owned(), false),
            ]
        );
    }

    #[test]
    fn trailing_shift_is_released() {
        let events = text_to_key_events("A");
        let (last_key, last_state) = events.last().unwrap();
        assert_eq!(last_key.web, "ShiftLeft");
        assert!(!last_state);
    }

    #[test]
    fn unknown_chars_are_skipped() {
        assert!(text_to_key_events("\u{1F600}").is_empty());
        let events = text_to_key_events("a\u{1F600}b");
        assert_eq!(events.len(), 4);
    }
}
