//! Sample sources
//!
//! A source produces blocks of interleaved unsigned 8-bit I/Q bytes from a
//! blocking read loop on the sampler thread. Cancellation is cooperative:
//! the shared exit flag is checked between blocks.

use std::fs::File;
use std::io::{self, Read};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::{debug, info};

/// Bytes per sample block handed to the ring.
pub const BLOCK_BYTES: usize = 16 * 16384;

/// Startup failures. Nothing here is recoverable; the pipeline never starts.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("cannot loop when reading samples from stdin")]
    LoopOnStdin,
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        source: io::Error,
    },
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: &'static str,
        source: io::Error,
    },
    #[error("sample read failed: {0}")]
    Read(#[source] io::Error),
}

/// Blocking producer of I/Q byte blocks.
pub trait SampleSource: Send {
    /// Read blocks and hand each to `deliver` until the stream ends or
    /// `cancel` is set. Every delivered block has even length and at most
    /// [`BLOCK_BYTES`] bytes.
    fn run(
        &mut self,
        cancel: &AtomicBool,
        deliver: &mut dyn FnMut(&[u8]),
    ) -> Result<(), SourceError>;
}

/// Replays a capture file (or stdin with `-`), optionally several passes.
pub struct FileSource {
    path: String,
    passes: u32,
}

impl FileSource {
    pub fn new(path: String, passes: u32) -> Result<Self, SourceError> {
        if path == "-" && passes > 1 {
            return Err(SourceError::LoopOnStdin);
        }
        Ok(Self {
            path,
            passes: passes.max(1),
        })
    }

    fn open(&self) -> Result<Box<dyn Read>, SourceError> {
        if self.path == "-" {
            Ok(Box::new(io::stdin()))
        } else {
            let file = File::open(&self.path).map_err(|source| SourceError::Open {
                path: self.path.clone(),
                source,
            })?;
            Ok(Box::new(file))
        }
    }
}

impl SampleSource for FileSource {
    fn run(
        &mut self,
        cancel: &AtomicBool,
        deliver: &mut dyn FnMut(&[u8]),
    ) -> Result<(), SourceError> {
        let mut block = vec![0u8; BLOCK_BYTES];

        for pass in 0..self.passes {
            if pass > 0 {
                debug!(pass, "looping sample file");
            }
            let mut reader = self.open()?;

            loop {
                if cancel.load(Ordering::Relaxed) {
                    return Ok(());
                }

                let n = read_block(&mut reader, &mut block).map_err(SourceError::Read)?;
                if n == 0 {
                    break;
                }
                // Trim a trailing half pair at EOF.
                deliver(&block[..n & !1]);
            }
        }
        Ok(())
    }
}

/// Samples from an `rtl_sdr` child process tuned to 1090 MHz.
pub struct RtlSdrSource {
    child: Child,
}

impl RtlSdrSource {
    pub fn new(freq: u32, gain: i32, dev_index: u32, agc: bool) -> Result<Self, SourceError> {
        // Gain 0 asks the tuner for automatic gain.
        let gain_arg = if agc || gain < 0 {
            "0".to_string()
        } else {
            (gain / 10).to_string()
        };

        let child = Command::new("rtl_sdr")
            .arg("-d")
            .arg(dev_index.to_string())
            .arg("-f")
            .arg(freq.to_string())
            .arg("-s")
            .arg("2000000")
            .arg("-g")
            .arg(gain_arg)
            .arg("-")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| SourceError::Spawn {
                command: "rtl_sdr",
                source,
            })?;

        info!("rtl_sdr started");
        Ok(Self { child })
    }
}

impl SampleSource for RtlSdrSource {
    fn run(
        &mut self,
        cancel: &AtomicBool,
        deliver: &mut dyn FnMut(&[u8]),
    ) -> Result<(), SourceError> {
        let mut stdout = self
            .child
            .stdout
            .take()
            .ok_or_else(|| SourceError::Spawn {
                command: "rtl_sdr",
                source: io::Error::other("no stdout pipe"),
            })?;

        let mut block = vec![0u8; BLOCK_BYTES];
        loop {
            if cancel.load(Ordering::Relaxed) {
                let _ = self.child.kill();
                return Ok(());
            }

            let n = read_block(&mut stdout, &mut block).map_err(SourceError::Read)?;
            if n == 0 {
                return Ok(());
            }
            deliver(&block[..n & !1]);
        }
    }
}

impl Drop for RtlSdrSource {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Fill `block` as far as the stream allows; returns bytes read, 0 at EOF.
fn read_block(reader: &mut dyn Read, block: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < block.len() {
        match reader.read(&mut block[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SliceSource {
        data: Vec<u8>,
        passes: u32,
    }

    impl SampleSource for SliceSource {
        fn run(
            &mut self,
            cancel: &AtomicBool,
            deliver: &mut dyn FnMut(&[u8]),
        ) -> Result<(), SourceError> {
            for _ in 0..self.passes {
                if cancel.load(Ordering::Relaxed) {
                    break;
                }
                deliver(&self.data);
            }
            Ok(())
        }
    }

    #[test]
    fn stdin_refuses_looping() {
        assert!(matches!(
            FileSource::new("-".into(), 2),
            Err(SourceError::LoopOnStdin)
        ));
        assert!(FileSource::new("-".into(), 1).is_ok());
    }

    #[test]
    fn missing_file_is_a_startup_error() {
        let mut src = FileSource::new("/nonexistent/capture.bin".into(), 1).unwrap();
        let cancel = AtomicBool::new(false);
        let result = src.run(&cancel, &mut |_| {});
        assert!(matches!(result, Err(SourceError::Open { .. })));
    }

    #[test]
    fn cancel_stops_delivery() {
        let cancel = AtomicBool::new(true);
        let mut src = SliceSource {
            data: vec![127; 64],
            passes: 10,
        };
        let mut blocks = 0;
        src.run(&cancel, &mut |_| blocks += 1).unwrap();
        assert_eq!(blocks, 0);
    }

    #[test]
    fn read_block_fills_across_short_reads() {
        // A reader that trickles 3 bytes at a time.
        struct Trickle(usize);
        impl Read for Trickle {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                if self.0 == 0 {
                    return Ok(0);
                }
                let n = self.0.min(3).min(buf.len());
                buf[..n].fill(42);
                self.0 -= n;
                Ok(n)
            }
        }

        let mut block = vec![0u8; 16];
        let n = read_block(&mut Trickle(10), &mut block).unwrap();
        assert_eq!(n, 10);
        assert!(block[..10].iter().all(|&b| b == 42));
    }
}
