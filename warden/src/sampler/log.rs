// warden/src/sampler/log.rs
//
// Log sampler: tails one log file and counts suspicious lines since the
// previous cycle. A single Aho-Corasick pass classifies each new line;
// a line counts at most once per group.
//
//   subject   the log file path
//   features  lines, auth_failures, privilege, errors
//
// A file that shrank was rotated or truncated, so reading restarts at 0.

use std::io::SeekFrom;
use std::path::PathBuf;

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::{Sampler, SamplerError};
use crate::events::Sample;

/// Upper bound on bytes consumed per cycle; the remainder waits for the next.
const MAX_READ_BYTES: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Group {
    AuthFailure,
    Privilege,
    Error,
}

impl Group {
    fn feature(self) -> &'static str {
        match self {
            Self::AuthFailure => "auth_failures",
            Self::Privilege   => "privilege",
            Self::Error       => "errors",
        }
    }
}

const PATTERNS: &[(&str, Group)] = &[
    ("failed password",          Group::AuthFailure),
    ("authentication failure",   Group::AuthFailure),
    ("invalid user",             Group::AuthFailure),
    ("failed login",             Group::AuthFailure),
    ("maximum authentication attempts", Group::AuthFailure),
    ("sudo:",                    Group::Privilege),
    ("session opened for user root", Group::Privilege),
    ("user not in sudoers",      Group::Privilege),
    ("su: ",                     Group::Privilege),
    ("segfault",                 Group::Error),
    ("error",                    Group::Error),
    ("critical",                 Group::Error),
    ("out of memory",            Group::Error),
];

pub struct LogSampler {
    path:    PathBuf,
    ac:      AhoCorasick,
    offset:  Mutex<u64>,
}

impl LogSampler {
    /// Starts at the current end of the file so history is not replayed.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, SamplerError> {
        let path = path.into();
        let start = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Self::from_offset(path, start)
    }

    pub fn from_offset(path: impl Into<PathBuf>, offset: u64) -> Result<Self, SamplerError> {
        let ac = AhoCorasickBuilder::new()
            .ascii_case_insensitive(true)
            .match_kind(MatchKind::Standard)
            .build(PATTERNS.iter().map(|(p, _)| *p))
            .map_err(|e| SamplerError::Unavailable(format!("log pattern build failed: {}", e)))?;
        Ok(Self { path: path.into(), ac, offset: Mutex::new(offset) })
    }

    fn classify(&self, chunk: &str) -> Sample {
        let mut lines = 0u64;
        let mut counts = [0u64; 3];
        for line in chunk.lines() {
            lines += 1;
            let mut hit = [false; 3];
            for m in self.ac.find_overlapping_iter(line) {
                hit[PATTERNS[m.pattern().as_usize()].1 as usize] = true;
            }
            for (c, h) in counts.iter_mut().zip(hit) {
                *c += h as u64;
            }
        }

        let mut sample = Sample::new(self.path.display().to_string()).with("lines", lines as f64);
        for group in [Group::AuthFailure, Group::Privilege, Group::Error] {
            sample = sample.with(group.feature(), counts[group as usize] as f64);
        }
        sample
    }
}

#[async_trait]
impl Sampler for LogSampler {
    fn name(&self) -> &str { "log" }

    async fn sample(&self) -> Result<Vec<Sample>, SamplerError> {
        let mut file = tokio::fs::File::open(&self.path).await.map_err(|e| {
            SamplerError::Unavailable(format!("{}: {}", self.path.display(), e))
        })?;
        let len = file.metadata().await?.len();

        let mut offset = *self.offset.lock();
        if len < offset {
            offset = 0;
        }
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = Vec::new();
        (&mut file).take(MAX_READ_BYTES).read_to_end(&mut buf).await?;

        // Only whole lines are consumed; a partial trailing line is re-read.
        let consumed = match buf.iter().rposition(|b| *b == b'\n') {
            Some(i) => i + 1,
            None if buf.len() as u64 >= MAX_READ_BYTES => buf.len(),
            None => 0,
        };
        *self.offset.lock() = offset + consumed as u64;

        let chunk = String::from_utf8_lossy(&buf[..consumed]);
        Ok(vec![self.classify(&chunk)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn counts_new_lines_by_group() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "old line with error").unwrap();
        let sampler = LogSampler::new(file.path()).unwrap();

        writeln!(file, "sshd[1]: Failed password for invalid user admin from 10.0.0.5").unwrap();
        writeln!(file, "sudo: alice : TTY=pts/0 ; COMMAND=/bin/sh").unwrap();
        writeln!(file, "kernel: ERROR something").unwrap();
        write!(file, "partial line with error").unwrap();
        file.flush().unwrap();

        let s = &sampler.sample().await.unwrap()[0];
        assert_eq!(s.feature("lines"), Some(3.0));
        assert_eq!(s.feature("auth_failures"), Some(1.0));
        assert_eq!(s.feature("privilege"), Some(1.0));
        assert_eq!(s.feature("errors"), Some(1.0));

        writeln!(file).unwrap();
        file.flush().unwrap();
        let s = &sampler.sample().await.unwrap()[0];
        assert_eq!(s.feature("lines"), Some(1.0));
        assert_eq!(s.feature("errors"), Some(1.0));
    }

    #[tokio::test]
    async fn truncation_restarts_from_the_top() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "line one\nline two\nline three").unwrap();
        let sampler = LogSampler::from_offset(file.path(), 0).unwrap();
        assert_eq!(sampler.sample().await.unwrap()[0].feature("lines"), Some(3.0));

        file.as_file().set_len(0).unwrap();
        std::fs::write(file.path(), "invalid user x\n").unwrap();
        let s = &sampler.sample().await.unwrap()[0];
        assert_eq!(s.feature("lines"), Some(1.0));
        assert_eq!(s.feature("auth_failures"), Some(1.0));
    }

    #[tokio::test]
    async fn missing_file_is_unavailable() {
        let sampler = LogSampler::from_offset("/nonexistent/warden.log", 0).unwrap();
        assert!(matches!(sampler.sample().await, Err(SamplerError::Unavailable(_))));
    }
}
