//! Chunked, direction-agnostic byte transfer with throttled progress
//!
//! `copy` pumps a `ByteSource` into a `ByteSink` in fixed-size chunks, in
//! order, and then always runs the exit sequence: flush sink, close sink,
//! close source. Only the first error is surfaced. After a failed pump the
//! sink is aborted rather than closed, so it is not finalised.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Cursor, Read, Write};

use lockbox_core::config::{TransferConfig, MIN_BUFFER_SIZE};
use lockbox_core::IoError;
use tracing::debug;
use zeroize::Zeroize;

/// A sequential byte stream that can be released explicitly.
pub trait ByteSource: Read + Send {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A sequential byte sink that can be finalised explicitly.
pub trait ByteSink: Write + Send {
    fn close(&mut self) -> io::Result<()> {
        self.flush()
    }

    /// Release the sink after a failed transfer without writing any trailer.
    fn abort(&mut self) -> io::Result<()> {
        self.close()
    }
}

impl ByteSource for File {}
impl<R: Read + Send> ByteSource for BufReader<R> {}
impl<T: AsRef<[u8]> + Send> ByteSource for Cursor<T> {}
impl ByteSource for &[u8] {}
impl<S: ByteSource + ?Sized> ByteSource for &mut S {
    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}
impl<S: ByteSource + ?Sized> ByteSource for Box<S> {
    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

impl ByteSink for File {
    fn close(&mut self) -> io::Result<()> {
        self.flush()?;
        self.sync_all()
    }
}
impl<W: Write + Send> ByteSink for BufWriter<W> {}
impl ByteSink for Vec<u8> {}
impl<S: ByteSink + ?Sized> ByteSink for &mut S {
    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }

    fn abort(&mut self) -> io::Result<()> {
        (**self).abort()
    }
}
impl<S: ByteSink + ?Sized> ByteSink for Box<S> {
    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }

    fn abort(&mut self) -> io::Result<()> {
        (**self).abort()
    }
}

/// Chunk size and progress granularity for one transfer
#[derive(Debug, Clone, Copy)]
pub struct TransferOptions {
    pub buffer_size: usize,
    pub step_percent: u8,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            buffer_size: MIN_BUFFER_SIZE,
            step_percent: 5,
        }
    }
}

impl From<&TransferConfig> for TransferOptions {
    fn from(config: &TransferConfig) -> Self {
        Self {
            buffer_size: config.effective_buffer_size(),
            step_percent: config.effective_step_percent(),
        }
    }
}

/// Decides when cumulative progress has crossed the next step of the total.
///
/// With an unknown or zero total it never fires; callers render an
/// indeterminate indicator instead.
#[derive(Debug)]
pub struct ProgressThrottle {
    step: u64,
    next: u64,
}

impl ProgressThrottle {
    pub fn new(expected_total: Option<u64>, step_percent: u8) -> Self {
        match expected_total {
            Some(total) if total > 0 => {
                let step = (total * u64::from(step_percent.clamp(1, 100)) / 100).max(1);
                Self { step, next: step }
            }
            _ => Self {
                step: 0,
                next: u64::MAX,
            },
        }
    }

    pub fn is_indeterminate(&self) -> bool {
        self.step == 0
    }

    /// Returns true when `transferred` reached a step boundary not yet reported.
    pub fn should_report(&mut self, transferred: u64) -> bool {
        if self.step == 0 || transferred < self.next {
            return false;
        }
        self.next = (transferred / self.step + 1).saturating_mul(self.step);
        true
    }
}

/// Copy `source` into `sink`, returning the number of bytes transferred.
///
/// `on_progress` receives the cumulative byte count each time another
/// `step_percent` of `expected_total` has been crossed. Chunks are written in
/// the order they are read. Whatever happens, the sink is flushed and closed
/// and then the source is closed; if the pump failed the sink is closed with
/// [`ByteSink::abort`].
pub fn copy<S, K, F>(
    mut source: S,
    mut sink: K,
    expected_total: Option<u64>,
    options: &TransferOptions,
    mut on_progress: F,
) -> Result<u64, IoError>
where
    S: ByteSource,
    K: ByteSink,
    F: FnMut(u64),
{
    let mut buf = vec![0u8; options.buffer_size.max(1)];
    let mut throttle = ProgressThrottle::new(expected_total, options.step_percent);
    let mut transferred = 0u64;

    let pumped = pump(
        &mut source,
        &mut sink,
        &mut buf,
        &mut transferred,
        &mut throttle,
        &mut on_progress,
    );
    buf.zeroize();

    let mut first_err = pumped.err();
    let failed = first_err.is_some();
    keep_first(&mut first_err, sink.flush(), "flush sink");
    let closed = if failed { sink.abort() } else { sink.close() };
    keep_first(&mut first_err, closed, "close sink");
    keep_first(&mut first_err, source.close(), "close source");

    match first_err {
        None => {
            debug!(bytes = transferred, "transfer complete");
            Ok(transferred)
        }
        Some(err) => Err(IoError::TransferFailed {
            bytes_transferred: transferred,
            source: err,
        }),
    }
}

fn pump<S, K, F>(
    source: &mut S,
    sink: &mut K,
    buf: &mut [u8],
    transferred: &mut u64,
    throttle: &mut ProgressThrottle,
    on_progress: &mut F,
) -> io::Result<()>
where
    S: ByteSource,
    K: ByteSink,
    F: FnMut(u64),
{
    loop {
        let n = match source.read(buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        sink.write_all(&buf[..n])?;
        *transferred += n as u64;
        if throttle.should_report(*transferred) {
            on_progress(*transferred);
        }
    }
}

fn keep_first(first: &mut Option<io::Error>, result: io::Result<()>, step: &str) {
    if let Err(e) = result {
        if first.is_none() {
            *first = Some(e);
        } else {
            debug!(step, error = %e, "suppressed secondary error during transfer cleanup");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<&'static str>>>;

    struct RecordingSource {
        data: Cursor<Vec<u8>>,
        fail_after: Option<u64>,
        read: u64,
        log: Log,
    }

    impl Read for RecordingSource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if let Some(limit) = self.fail_after {
                if self.read >= limit {
                    return Err(io::Error::new(io::ErrorKind::Other, "source exploded"));
                }
            }
            let n = self.data.read(buf)?;
            self.read += n as u64;
            Ok(n)
        }
    }

    impl ByteSource for RecordingSource {
        fn close(&mut self) -> io::Result<()> {
            self.log.lock().unwrap().push("close source");
            Ok(())
        }
    }

    struct RecordingSink {
        data: Vec<u8>,
        fail_close: bool,
        log: Log,
    }

    impl RecordingSink {
        fn close_logged(&mut self, step: &'static str) -> io::Result<()> {
            self.log.lock().unwrap().push(step);
            if self.fail_close {
                Err(io::Error::new(io::ErrorKind::Other, "close failed"))
            } else {
                Ok(())
            }
        }
    }

    impl Write for RecordingSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            self.log.lock().unwrap().push("flush sink");
            Ok(())
        }
    }

    impl ByteSink for RecordingSink {
        fn close(&mut self) -> io::Result<()> {
            self.close_logged("close sink")
        }

        fn abort(&mut self) -> io::Result<()> {
            self.close_logged("abort sink")
        }
    }

    fn source(len: usize, fail_after: Option<u64>, log: &Log) -> RecordingSource {
        RecordingSource {
            data: Cursor::new((0..len).map(|i| i as u8).collect()),
            fail_after,
            read: 0,
            log: log.clone(),
        }
    }

    fn sink(fail_close: bool, log: &Log) -> RecordingSink {
        RecordingSink {
            data: Vec::new(),
            fail_close,
            log: log.clone(),
        }
    }

    #[test]
    fn test_copy_transfers_everything_in_order() {
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 253) as u8).collect();
        let mut out = Vec::new();

        let n = copy(&data[..], &mut out, None, &TransferOptions::default(), |_| {}).unwrap();

        assert_eq!(n, data.len() as u64);
        assert_eq!(out, data);
    }

    #[test]
    fn test_progress_ten_mib_five_percent_steps() {
        let total = 10 * 1024 * 1024;
        let data = vec![0xA5u8; total];
        let mut out = Vec::with_capacity(total);
        let mut reports = Vec::new();

        copy(
            &data[..],
            &mut out,
            Some(total as u64),
            &TransferOptions::default(),
            |n| reports.push(n),
        )
        .unwrap();

        assert_eq!(reports.len(), 20);
        assert!(reports.windows(2).all(|w| w[0] < w[1]), "strictly increasing");
        assert_eq!(*reports.last().unwrap(), total as u64);
    }

    #[test]
    fn test_progress_never_exceeds_size() {
        let data = vec![1u8; 12_345];
        let mut reports = Vec::new();
        let options = TransferOptions {
            buffer_size: 4096,
            step_percent: 5,
        };

        copy(&data[..], Vec::new(), Some(12_345), &options, |n| reports.push(n)).unwrap();

        assert!(!reports.is_empty());
        assert!(reports.windows(2).all(|w| w[0] <= w[1]));
        assert!(reports.iter().all(|&n| n <= 12_345));
    }

    #[test]
    fn test_unknown_total_is_indeterminate() {
        let data = vec![1u8; 50_000];
        let mut calls = 0;
        copy(&data[..], Vec::new(), None, &TransferOptions::default(), |_| calls += 1).unwrap();
        assert_eq!(calls, 0);

        copy(&data[..], Vec::new(), Some(0), &TransferOptions::default(), |_| calls += 1).unwrap();
        assert_eq!(calls, 0);
        assert!(ProgressThrottle::new(Some(0), 5).is_indeterminate());
    }

    #[test]
    fn test_exit_sequence_order_on_success() {
        let log: Log = Arc::default();
        copy(
            source(9000, None, &log),
            sink(false, &log),
            Some(9000),
            &TransferOptions::default(),
            |_| {},
        )
        .unwrap();

        let log = log.lock().unwrap();
        let tail: Vec<_> = log.iter().rev().take(3).rev().copied().collect();
        assert_eq!(tail, ["flush sink", "close sink", "close source"]);
    }

    #[test]
    fn test_read_failure_reports_bytes_so_far_and_still_cleans_up() {
        let log: Log = Arc::default();
        let err = copy(
            source(100_000, Some(8192), &log),
            sink(true, &log),
            Some(100_000),
            &TransferOptions::default(),
            |_| {},
        )
        .unwrap_err();

        match err {
            IoError::TransferFailed {
                bytes_transferred,
                source,
            } => {
                assert_eq!(bytes_transferred, 8192);
                // first error wins over the failing close
                assert_eq!(source.to_string(), "source exploded");
            }
            other => panic!("unexpected error: {other}"),
        }

        let log = log.lock().unwrap();
        assert_eq!(*log, ["flush sink", "abort sink", "close source"]);
    }

    #[test]
    fn test_close_failure_surfaces() {
        let log: Log = Arc::default();
        let err = copy(
            source(10, None, &log),
            sink(true, &log),
            None,
            &TransferOptions::default(),
            |_| {},
        )
        .unwrap_err();
        assert!(matches!(
            err,
            IoError::TransferFailed {
                bytes_transferred: 10,
                ..
            }
        ));
    }

    #[test]
    fn test_options_from_config_clamps() {
        let config = TransferConfig {
            buffer_size: 64,
            progress_step_percent: 5,
        };
        let options = TransferOptions::from(&config);
        assert_eq!(options.buffer_size, MIN_BUFFER_SIZE);
    }
}
