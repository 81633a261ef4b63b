//! The supervisor side of the worker wire protocol.
//!
//! Text, line-delimited, UTF-8. On startup the supervisor writes one line
//! (the JSON-serialized `exec_info`) to the worker's stdin and reads one
//! line back: `OK` (case-insensitive, trimmed) means the worker is ready.
//! Anything else is a setup failure; the rest of stdout and stderr is
//! drained and surfaced as a `SetupError`. In steady state each input line
//! written produces exactly one result line on the worker's stdout.

use std::io::{BufRead, Read, Write};

use serde::{Deserialize, Serialize};

/// One result line emitted by a worker per consumed record.
///
/// `exit` is `0` when the user handler returned a non-integer value, `1`
/// when it raised, otherwise the integer it returned. `stdout`/`stderr`
/// capture what the handler printed while it ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordResult {
    pub data: String,
    pub exit: i64,
    pub stdout: String,
    pub stderr: String,
}

/// A spec-resolution or worker-setup failure.
///
/// `when` names the phase that failed; `stack` carries the originating
/// error text (a worker-side traceback, or raw drained output).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupError {
    pub stack: String,
    pub when: String,
}

impl SetupError {
    pub fn new(when: impl Into<String>, stack: impl Into<String>) -> Self {
        SetupError {
            when: when.into(),
            stack: stack.into(),
        }
    }

    /// Wrap drained worker output: structured if it parses as a
    /// `{stack, when}` object, raw otherwise.
    pub fn from_payload(payload: &str) -> Self {
        match serde_json::from_str::<SetupError>(payload) {
            Ok(err) => err,
            Err(_) => SetupError {
                stack: payload.to_string(),
                when: "decoding error (raw provided)".to_string(),
            },
        }
    }
}

impl std::fmt::Display for SetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "error when {}: {}", self.when, self.stack)
    }
}

impl std::error::Error for SetupError {}

/// Write one record line, guaranteeing a single trailing `\n`, and flush.
pub fn write_line<W: Write>(w: &mut W, line: &str) -> std::io::Result<()> {
    w.write_all(line.as_bytes())?;
    if !line.ends_with('\n') {
        w.write_all(b"\n")?;
    }
    w.flush()
}

/// Perform the startup handshake against a freshly spawned worker.
///
/// The spec line is written from a scoped thread while this thread reads
/// the worker's first output line, so a spec larger than the pipe buffer
/// cannot deadlock against a worker that echoes before consuming.
pub fn handshake<W, R, E>(
    stdin: &mut W,
    stdout: &mut R,
    stderr: &mut E,
    spec_line: &str,
) -> Result<(), SetupError>
where
    W: Write + Send,
    R: BufRead,
    E: Read,
{
    let mut first = String::new();
    let (write_res, read_res) = std::thread::scope(|s| {
        let writer = s.spawn(|| write_line(stdin, spec_line));
        let read_res = stdout.read_line(&mut first);
        (writer.join(), read_res)
    });

    // A panic in the writer thread is unreachable (write_line does not
    // panic), but surface it rather than unwinding here.
    let write_res = match write_res {
        Ok(res) => res,
        Err(_) => {
            return Err(SetupError::new(
                "writing spec to worker",
                "spec writer thread panicked",
            ));
        }
    };

    if let Err(err) = write_res {
        // Worker went away before consuming the spec; report the write
        // failure together with whatever it managed to say.
        let mut payload = drain(stdout, stderr);
        payload.insert_str(0, &first);
        return Err(SetupError::new(
            "writing spec to worker",
            format!("{err}\n{payload}"),
        ));
    }

    match read_res {
        Ok(_) if first.trim().eq_ignore_ascii_case("OK") => Ok(()),
        Err(err) => Err(SetupError::new(
            "reading worker handshake",
            err.to_string(),
        )),
        // Worker answered something other than OK (or closed stdout): the
        // rest of stdout plus stderr is the error payload.
        Ok(_) => Err(SetupError::from_payload(&drain(stdout, stderr))),
    }
}

/// Read the remainder of stdout plus all of stderr, lossily decoded.
fn drain<R: Read, E: Read>(stdout: &mut R, stderr: &mut E) -> String {
    let mut buf = Vec::new();
    let _ = stdout.read_to_end(&mut buf);
    let _ = stderr.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn run_handshake(stdout: &str, stderr: &str) -> Result<(), SetupError> {
        let mut stdin = Vec::new();
        let mut out = Cursor::new(stdout.as_bytes().to_vec());
        let mut err = Cursor::new(stderr.as_bytes().to_vec());
        handshake(&mut stdin, &mut out, &mut err, "{\"code\":\"x\"}")
    }

    #[test]
    fn ok_line_means_ready() {
        assert!(run_handshake("OK\n", "").is_ok());
    }

    #[test]
    fn ok_is_case_insensitive_and_trimmed() {
        assert!(run_handshake("  ok \n", "").is_ok());
        assert!(run_handshake("Ok\n", "").is_ok());
    }

    #[test]
    fn structured_error_payload_is_parsed() {
        let payload = "ERROR\n{\"stack\": \"Traceback...\", \"when\": \"loading module\"}\n";
        let err = run_handshake(payload, "").unwrap_err();
        assert_eq!(err.when, "loading module");
        assert_eq!(err.stack, "Traceback...");
    }

    #[test]
    fn raw_error_payload_is_wrapped() {
        let err = run_handshake("garbage\nmore garbage\n", "boom\n").unwrap_err();
        assert_eq!(err.when, "decoding error (raw provided)");
        assert!(err.stack.contains("more garbage"));
        assert!(err.stack.contains("boom"));
    }

    #[test]
    fn empty_output_is_a_failure() {
        let err = run_handshake("", "").unwrap_err();
        assert!(!err.when.is_empty());
    }

    #[test]
    fn write_line_appends_exactly_one_newline() {
        let mut buf = Vec::new();
        write_line(&mut buf, "abc").unwrap();
        assert_eq!(buf, b"abc\n");
        buf.clear();
        write_line(&mut buf, "abc\n").unwrap();
        assert_eq!(buf, b"abc\n");
    }

    #[test]
    fn spec_line_reaches_the_worker_newline_terminated() {
        let mut stdin = Vec::new();
        let mut out = Cursor::new(b"OK\n".to_vec());
        let mut err = Cursor::new(Vec::new());
        handshake(&mut stdin, &mut out, &mut err, "{\"a\":1}").unwrap();
        assert_eq!(stdin, b"{\"a\":1}\n");
    }

    #[test]
    fn result_line_shape_round_trips() {
        let line = "{\"data\": \"{\\\"v\\\":1}\", \"exit\": 0, \"stdout\": \"1\\n\", \"stderr\": \"\"}";
        let res: RecordResult = serde_json::from_str(line).unwrap();
        assert_eq!(res.data, "{\"v\":1}");
        assert_eq!(res.exit, 0);
        assert_eq!(res.stdout, "1\n");
        assert_eq!(res.stderr, "");
    }

    #[test]
    fn result_line_carries_handler_exit_codes() {
        let line = "{\"data\": \"{\\\"code\\\":7}\", \"exit\": 7, \"stdout\": \"\", \"stderr\": \"\"}";
        let res: RecordResult = serde_json::from_str(line).unwrap();
        assert_eq!(res.exit, 7);
    }

    #[test]
    fn result_line_from_a_raising_handler_has_stderr() {
        let line =
            "{\"data\": \"{\\\"bad\\\":true}\", \"exit\": 1, \"stdout\": \"\", \"stderr\": \"Traceback (most recent call last)...\"}";
        let res: RecordResult = serde_json::from_str(line).unwrap();
        assert_eq!(res.exit, 1);
        assert!(!res.stderr.is_empty());
    }
}
