/// Cursor position in an editor buffer, zero-based.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    pub line: usize,
    pub column: usize,
}

impl Cursor {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }

    /// Clamp to the bounds of `text` so the cursor stays valid after a
    /// remote replacement shortened the buffer.
    pub fn clamp_to(self, text: &str) -> Self {
        let lines: Vec<&str> = text.split('\n').collect();
        let line = self.line.min(lines.len().saturating_sub(1));
        let width = lines.get(line).map_or(0, |l| l.chars().count());
        Self {
            line,
            column: self.column.min(width),
        }
    }
}

/// The editor widget showing the open document.
pub trait EditorBuffer: Send + Sync {
    fn text(&self) -> String;
    fn set_text(&self, text: &str);
    fn cursor(&self) -> Cursor;
    fn set_cursor(&self, cursor: Cursor);
}

/// Replace the buffer contents while keeping the cursor where it was.
pub fn replace_preserving_cursor(buffer: &dyn EditorBuffer, text: &str) {
    let cursor = buffer.cursor();
    buffer.set_text(text);
    buffer.set_cursor(cursor.clamp_to(text));
}
