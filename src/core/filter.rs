//! Control sequence filter
//!
//! Strips terminal escape sequences from decoded output for plain-text
//! consumers. CSI and OSC sequences are consumed whole, carriage returns are
//! dropped, everything else passes through. State carries across calls so a
//! sequence split between two reads is still removed.

const ESC: char = '\x1b';
const BEL: char = '\x07';
const CR: char = '\r';
const C1_CSI: char = '\u{9b}';
const C1_ST: char = '\u{9c}';
const C1_OSC: char = '\u{9d}';

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum FilterState {
    #[default]
    Ground,
    Escape,
    EscapeIntermediate,
    Csi,
    OscString,
    /// ESC received within OSC, waiting for backslash
    EscapeInOsc,
}

/// Streaming escape-sequence stripper.
#[derive(Debug, Default)]
pub struct ControlSequenceFilter {
    state: FilterState,
}

impl ControlSequenceFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter one decoded fragment.
    pub fn filter(&mut self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for ch in text.chars() {
            self.feed(ch, &mut out);
        }
        out
    }

    /// End of stream. An unterminated sequence is dropped without output.
    pub fn finish(&mut self) {
        self.state = FilterState::Ground;
    }

    /// Whether the filter is inside an escape sequence.
    pub fn in_sequence(&self) -> bool {
        self.state != FilterState::Ground
    }

    fn feed(&mut self, ch: char, out: &mut String) {
        match self.state {
            FilterState::Ground => self.ground(ch, out),
            FilterState::Escape => self.escape(ch),
            FilterState::EscapeIntermediate => self.escape_intermediate(ch),
            FilterState::Csi => self.csi(ch),
            FilterState::OscString => self.osc_string(ch),
            FilterState::EscapeInOsc => self.escape_in_osc(ch, out),
        }
    }

    fn ground(&mut self, ch: char, out: &mut String) {
        match ch {
            ESC => self.state = FilterState::Escape,
            C1_CSI => self.state = FilterState::Csi,
            C1_OSC => self.state = FilterState::OscString,
            CR => {}
            _ => out.push(ch),
        }
    }

    fn escape(&mut self, ch: char) {
        self.state = match ch {
            '[' => FilterState::Csi,
            ']' => FilterState::OscString,
            // Charset designation and friends: ESC ( B
            '\x20'..='\x2f' => FilterState::EscapeIntermediate,
            // Any other two-character escape is dropped whole.
            _ => FilterState::Ground,
        };
    }

    fn escape_intermediate(&mut self, ch: char) {
        if !('\x20'..='\x2f').contains(&ch) {
            self.state = FilterState::Ground;
        }
    }

    fn csi(&mut self, ch: char) {
        match ch {
            // Final byte
            '\x40'..='\x7e' => self.state = FilterState::Ground,
            // Parameter and intermediate bytes
            '\x20'..='\x3f' => {}
            ESC => self.state = FilterState::Escape,
            // Stray C0 controls inside CSI are swallowed with it.
            _ => {}
        }
    }

    fn osc_string(&mut self, ch: char) {
        match ch {
            BEL | C1_ST => self.state = FilterState::Ground,
            ESC => self.state = FilterState::EscapeInOsc,
            _ => {}
        }
    }

    fn escape_in_osc(&mut self, ch: char, out: &mut String) {
        if ch == '\\' {
            // ST (ESC \)
            self.state = FilterState::Ground;
        } else {
            // Not ST: the OSC ended at the ESC, which starts a new escape.
            self.state = FilterState::Escape;
            self.feed(ch, out);
        }
    }
}
