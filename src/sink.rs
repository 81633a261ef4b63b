//! Result sink: forwards worker output lines to the output stream.

use std::io::Write;

/// Writes each result line to the output stream, newline-terminated.
///
/// No transformation beyond guaranteeing the trailing `\n`; buffered data
/// is flushed when the sink is dropped.
pub struct ResultSink<W: Write> {
    out: W,
}

impl<W: Write> ResultSink<W> {
    pub fn new(out: W) -> Self {
        ResultSink { out }
    }

    /// Write one result line, appending `\n` when absent.
    pub fn write_result(&mut self, line: &str) -> std::io::Result<()> {
        self.out.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            self.out.write_all(b"\n")?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.out.flush()
    }
}

impl<W: Write> Drop for ResultSink<W> {
    fn drop(&mut self) {
        let _ = self.out.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_missing_newline() {
        let mut buf = Vec::new();
        let mut sink = ResultSink::new(&mut buf);
        sink.write_result("{\"a\":1}").unwrap();
        sink.write_result("{\"b\":2}\n").unwrap();
        drop(sink);
        assert_eq!(buf, b"{\"a\":1}\n{\"b\":2}\n");
    }

    #[test]
    fn lines_pass_through_unmodified() {
        let mut buf = Vec::new();
        let mut sink = ResultSink::new(&mut buf);
        sink.write_result("  spaced \t line \n").unwrap();
        drop(sink);
        assert_eq!(buf, b"  spaced \t line \n");
    }
}
