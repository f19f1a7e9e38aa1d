//! Turns raw terminal output into clean display lines.
//!
//! Process output arrives decorated for a real terminal: colour codes, cursor
//! movement, clear-line sequences, OSC 8 hyperlinks, carriage-return redraws and
//! spinner frames. None of that renders in a plain line log, so [`normalize`]
//! strips it and splits what is left into lines.

use once_cell::sync::Lazy;
use regex::Regex;

/// A complete escape at the start of the text: OSC, DCS/SOS/PM/APC strings
/// (terminated by BEL or ST), CSI (7-bit and 8-bit), charset designation, then
/// any other two-byte escape.
static COMPLETE_ESCAPE_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"^(?:\x1b[\]P_^X][^\x07\x1b]*(?:\x07|\x1b\\)",
        r"|\x1b\[[0-?]*[ -/]*[@-~]",
        r"|\x{9b}[0-?]*[ -/]*[@-~]",
        r"|\x1b[()*+][0-~]",
        r"|\x1b[^\[\]()*+P_^X\n])",
    ))
    .expect("escape prefix pattern is valid")
});

/// An escape sequence longer than this is not waited on.
const MAX_ESCAPE_LEN: usize = 256;

const SPINNER_GLYPHS: &[char] = &[
    '|', '/', '-', '\\', // classic
    '⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏', // dots
    '⣾', '⣽', '⣻', '⢿', '⡿', '⣟', '⣯', '⣷', // dots2
    '⠁', '⠂', '⠄', '⡀', '⢀', '⠠', '⠐', '⠈', // dots3
    '◐', '◓', '◑', '◒', '◴', '◷', '◶', '◵', '◢', '◣', '◤', '◥', // shapes
    '·', '•',
];

/// Removes every ANSI escape sequence (CSI, OSC, DCS, APC and the rest) and
/// stray control character, keeping tabs and line breaks.
pub fn strip_ansi(text: &str) -> String {
    // 8-bit CSI is the same sequence as ESC [.
    let text = text.replace('\u{9b}', "\x1b[");
    text.split('\n')
        .map(|line| {
            line.split('\t')
                .map(strip_ansi_escapes::strip_str)
                .collect::<Vec<_>>()
                .join("\t")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Converts `\r\n` and bare `\r` to `\n`.
pub fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// A lone spinner glyph, or the same glyph repeated. Runs of three or more
/// dashes are table rules, not spinner frames.
pub fn is_spinner_artifact(line: &str) -> bool {
    let mut glyphs = line.chars().filter(|c| !c.is_whitespace());
    let Some(first) = glyphs.next() else {
        return false;
    };
    if !SPINNER_GLYPHS.contains(&first) {
        return false;
    }
    let mut count = 1;
    for c in glyphs {
        if c != first {
            return false;
        }
        count += 1;
    }
    !(first == '-' && count >= 3)
}

/// Normalizes a raw chunk into display lines.
///
/// Blank lines and spinner frames are dropped and trailing whitespace is
/// trimmed. Text after the final newline comes back as the last line; deciding
/// whether that tail is complete is up to the caller.
pub fn normalize(raw: &str) -> Vec<String> {
    strip_ansi(&normalize_line_endings(raw))
        .split('\n')
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty() && !is_spinner_artifact(line))
        .map(str::to_string)
        .collect()
}

/// Byte offset where an unfinished escape sequence starts at the end of `text`.
///
/// Used to hold back a split sequence such as `"\x1b[3"` until the rest of it
/// arrives instead of flushing it as garbage.
pub fn incomplete_escape_start(text: &str) -> Option<usize> {
    let start = text.rfind(['\x1b', '\u{9b}'])?;
    let tail = &text[start..];
    if tail.len() > MAX_ESCAPE_LEN || COMPLETE_ESCAPE_PREFIX.is_match(tail) {
        return None;
    }
    // A CSI whose parameter bytes were interrupted by something else is junk, not pending.
    let body = tail.trim_start_matches(['\x1b', '\u{9b}', '[']);
    if tail.starts_with("\x1b[") && body.chars().any(|c| !('\x20'..='\x3f').contains(&c)) {
        return None;
    }
    Some(start)
}
