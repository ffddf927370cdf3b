//
// utf16.rs
//
// UTF-16 position helpers
//

/// Length of `text` in UTF-16 code units, the unit of LSP
/// `Position.character`. External tools report byte or char columns;
/// everything sent to the client goes through here.
pub fn utf16_len(text: &str) -> u32 {
    text.chars().map(|ch| ch.len_utf16() as u32).sum()
}

/// Convert a UTF-16 column within `line_text` to a char offset, clamped to
/// the end of the line.
pub fn utf16_offset_to_char_offset(line_text: &str, utf16_offset: usize) -> usize {
    let mut utf16_count = 0;
    let mut char_count = 0;

    for ch in line_text.chars() {
        if utf16_count >= utf16_offset {
            return char_count;
        }
        utf16_count += ch.len_utf16();
        char_count += 1;
    }
    char_count
}
