use regex::Regex;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncRead;
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{debug, warn};

/// Output patterns that mean the browser (or something inside it) crashed
pub const DEFAULT_CRASH_SIGNATURES: &[&str] = &[
    r"###!!! ABORT",
    r"Assertion failure:",
    r"Hit MOZ_CRASH\(",
    r"PROCESS-CRASH",
    r"Fatal signal \d+ \(SIG[A-Z]+\)",
    r"Segmentation fault",
];

/// Lines kept before the oldest ones are dropped
pub const DEFAULT_MAX_LINES: usize = 50_000;

#[derive(Debug, Clone, Default)]
pub struct CrashSignatures {
    patterns: Vec<Regex>,
}

impl CrashSignatures {
    pub fn new<S: AsRef<str>, I: IntoIterator<Item = S>>(patterns: I) -> Result<Self, regex::Error> {
        let patterns = patterns
            .into_iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, line: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(line))
    }
}

/// Accumulated process output shared between capture tasks, the monitor and callers
#[derive(Clone)]
pub struct OutputBuffer {
    inner: Arc<OutputInner>,
}

struct OutputInner {
    lines: Mutex<VecDeque<String>>,
    max_lines: usize,
    signatures: CrashSignatures,
    crash: watch::Sender<Option<String>>,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(CrashSignatures::none())
    }
}

impl OutputBuffer {
    pub fn new(signatures: CrashSignatures) -> Self {
        Self::with_max_lines(signatures, DEFAULT_MAX_LINES)
    }

    pub fn with_max_lines(signatures: CrashSignatures, max_lines: usize) -> Self {
        let (crash, _) = watch::channel(None);
        Self {
            inner: Arc::new(OutputInner {
                lines: Mutex::new(VecDeque::new()),
                max_lines: max_lines.max(1),
                signatures,
                crash,
            }),
        }
    }

    pub fn push_line(&self, line: impl Into<String>) {
        let line = line.into();
        if self.inner.signatures.matches(&line) {
            let first = self.inner.crash.send_if_modified(|slot| {
                if slot.is_none() {
                    *slot = Some(line.clone());
                    true
                } else {
                    false
                }
            });
            if first {
                warn!(%line, "Crash signature detected in output");
            }
        }

        if let Ok(mut lines) = self.inner.lines.lock() {
            while lines.len() >= self.inner.max_lines {
                lines.pop_front();
            }
            lines.push_back(line);
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.inner
            .lines
            .lock()
            .map(|lines| lines.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn text(&self) -> String {
        self.lines().join("\n")
    }

    pub fn len(&self) -> usize {
        self.inner.lines.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn any_line(&self, predicate: impl Fn(&str) -> bool) -> bool {
        self.inner
            .lines
            .lock()
            .map(|lines| lines.iter().any(|l| predicate(l)))
            .unwrap_or(false)
    }

    /// Forget captured output and any detected crash signature
    pub fn clear(&self) {
        if let Ok(mut lines) = self.inner.lines.lock() {
            lines.clear();
        }
        self.inner.crash.send_replace(None);
    }

    /// The first line that matched a crash signature, if any
    pub fn crash_signature(&self) -> Option<String> {
        self.inner.crash.borrow().clone()
    }

    /// Resolves once a crash signature has been seen
    pub async fn crash_detected(&self) -> String {
        let mut rx = self.inner.crash.subscribe();
        let seen = rx.wait_for(Option::is_some).await.map(|line| line.clone());
        match seen {
            Ok(line) => line.unwrap_or_default(),
            // the sender lives as long as the buffer, so this never resolves
            Err(_) => std::future::pending().await,
        }
    }
}

/// Newline framing that tolerates invalid UTF-8 in process output
#[derive(Debug, Default)]
pub struct LossyLines;

impl Decoder for LossyLines {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(newline) = src.iter().position(|b| *b == b'\n') else {
            return Ok(None);
        };
        let line = src.split_to(newline + 1);
        Ok(Some(decode_line(&line)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(line) => Ok(Some(line)),
            None if src.is_empty() => Ok(None),
            None => {
                let rest = src.split();
                Ok(Some(decode_line(&rest)))
            }
        }
    }
}

fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

/// Copy lines from `reader` into `output` until EOF
pub async fn capture_lines<R: AsyncRead + Unpin>(
    reader: R,
    output: OutputBuffer,
) -> std::io::Result<()> {
    let mut frames = FramedRead::with_capacity(reader, LossyLines, 1024);
    while let Some(frame) = frames.next().await {
        let line = frame?;
        debug!(target: "goanna_runner::output", "{line}");
        output.push_line(line);
    }
    Ok(())
}
