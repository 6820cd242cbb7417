//! Bounded capture of program output and the merged text returned to callers.

use crate::sandbox::{ExecutionResult, ExitStatus};

/// Appended to merged output when bytes were dropped.
pub const TRUNCATION_MARKER: &str = "\n... [output truncated]";

/// Returned in place of output when the wall-clock limit fires.
pub const TIMEOUT_MESSAGE: &str = "Error: Execution timed out";

/// Keeps at most `limit` bytes; everything past that is counted and dropped.
#[derive(Debug)]
pub struct BoundedBuffer {
    data: Vec<u8>,
    limit: usize,
    dropped: usize,
}

impl BoundedBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            data: Vec::with_capacity(limit.min(8192)),
            limit,
            dropped: 0,
        }
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.data.len());
        let keep = room.min(chunk.len());
        self.data.extend_from_slice(&chunk[..keep]);
        self.dropped += chunk.len() - keep;
    }

    pub fn truncated(&self) -> bool {
        self.dropped > 0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// stdout followed by stderr, cut to `limit` bytes on a char boundary.
pub fn merge_output(stdout: &[u8], stderr: &[u8], limit: usize, truncated: bool) -> String {
    let mut merged = String::from_utf8_lossy(stdout).into_owned();
    merged.push_str(&String::from_utf8_lossy(stderr));

    let mut cut = truncated;
    if merged.len() > limit {
        let mut end = limit;
        while !merged.is_char_boundary(end) {
            end -= 1;
        }
        merged.truncate(end);
        cut = true;
    }
    if cut {
        merged.push_str(TRUNCATION_MARKER);
    }
    merged
}

/// The single `output` string of the `/run` response, capped at the
/// request's own output ceiling.
pub fn legacy_output(result: &ExecutionResult) -> String {
    match result.status {
        ExitStatus::TimedOut => TIMEOUT_MESSAGE.to_string(),
        ExitStatus::SetupError => format!("Error: {}", String::from_utf8_lossy(&result.stderr)),
        ExitStatus::Completed | ExitStatus::Killed => {
            merge_output(&result.stdout, &result.stderr, result.output_limit, result.truncated)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_buffer_drops_overflow() {
        let mut buf = BoundedBuffer::new(5);
        buf.extend(b"abc");
        assert!(!buf.truncated());
        buf.extend(b"defgh");
        assert!(buf.truncated());
        buf.extend(b"ijk");
        assert_eq!(buf.into_bytes(), b"abcde");
    }

    #[test]
    fn merge_puts_stdout_before_stderr() {
        let merged = merge_output(b"out\n", b"err\n", 1024, false);
        assert_eq!(merged, "out\nerr\n");
    }

    #[test]
    fn merge_truncates_with_marker() {
        let merged = merge_output(b"0123456789", b"abcdef", 12, false);
        assert_eq!(merged, format!("0123456789ab{}", TRUNCATION_MARKER));
    }

    #[test]
    fn merge_respects_char_boundaries() {
        // "é" is two bytes; a limit of 4 must not split it
        let merged = merge_output("aéé".as_bytes(), b"", 4, false);
        assert_eq!(merged, format!("aé{}", TRUNCATION_MARKER));
    }

    #[test]
    fn merge_marks_capture_truncation() {
        let merged = merge_output(b"abc", b"", 100, true);
        assert!(merged.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn timed_out_result_uses_legacy_message() {
        let result = ExecutionResult {
            request_id: "r".to_string(),
            stdout: b"partial".to_vec(),
            stderr: Vec::new(),
            status: ExitStatus::TimedOut,
            exit_code: None,
            signal: Some(9),
            truncated: false,
            output_limit: 1024,
            duration_ms: 5000,
        };
        assert_eq!(legacy_output(&result), "Error: Execution timed out");
    }

    #[test]
    fn merged_output_uses_the_request_ceiling() {
        let result = ExecutionResult {
            request_id: "r".to_string(),
            stdout: vec![b'o'; 100],
            stderr: vec![b'e'; 100],
            status: ExitStatus::Completed,
            exit_code: Some(0),
            signal: None,
            truncated: false,
            output_limit: 100,
            duration_ms: 10,
        };
        let output = legacy_output(&result);
        assert_eq!(output, format!("{}{}", "o".repeat(100), TRUNCATION_MARKER));
    }
}
