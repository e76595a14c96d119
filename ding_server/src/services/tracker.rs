//! Output tracker: captures stdout and stderr of a step into log files and
//! live `output` events.
//!
//! Files per step under `<build>/output/`: `<step>.output` (both streams
//! merged), `<step>.stdout`, `<step>.stderr` and `<step>.nsec` (elapsed
//! nanoseconds).

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::{Result, ServerContext};
use crate::events::{DingEvent, EventHub, OutputStream};

/// Segments are flushed at a newline or when this many bytes are pending.
pub const LINE_BUFFER: usize = 1024;

struct Segment {
    stream: OutputStream,
    bytes: Vec<u8>,
}

pub struct Tracker<'a> {
    pub events: &'a EventHub,
    pub build_id: i64,
    pub step: &'a str,
    pub output_dir: &'a Path,
}

impl Tracker<'_> {
    fn path(&self, ext: &str) -> PathBuf {
        self.output_dir.join(format!("{}.{ext}", self.step))
    }

    /// Consume both streams until EOF, then wait for the command. Returns
    /// the command's failure, if any. Errors are local write failures.
    pub async fn track<O, E, W>(&self, stdout: O, stderr: E, wait: W) -> Result<Option<String>>
    where
        O: AsyncRead + Unpin,
        E: AsyncRead + Unpin,
        W: Future<Output = Option<String>>,
    {
        let t0 = Instant::now();
        let mut merged = open_append(&self.path("output")).await?;
        let mut out = open_append(&self.path("stdout")).await?;
        let mut err = open_append(&self.path("stderr")).await?;

        self.publish(OutputStream::Stdout, String::new());

        let (tx, mut rx) = mpsc::channel::<Segment>(16);
        let read_out = read_segments(stdout, OutputStream::Stdout, tx.clone());
        let read_err = read_segments(stderr, OutputStream::Stderr, tx);
        let write = async {
            while let Some(seg) = rx.recv().await {
                merged
                    .write_all(&seg.bytes)
                    .await
                    .server_context("writing to output")?;
                let file = match seg.stream {
                    OutputStream::Stdout => &mut out,
                    OutputStream::Stderr => &mut err,
                };
                file.write_all(&seg.bytes)
                    .await
                    .server_context(&format!("writing to {}", seg.stream.as_str()))?;
                self.publish(seg.stream, String::from_utf8_lossy(&seg.bytes).into_owned());
            }
            Ok::<_, crate::error::DingError>(())
        };
        let ((), (), written) = tokio::join!(read_out, read_err, write);
        written?;
        for f in [&mut merged, &mut out, &mut err] {
            f.flush().await.server_context("flushing step output")?;
        }

        let failure = wait.await;

        let elapsed = t0.elapsed();
        tokio::fs::write(self.path("nsec"), elapsed.as_nanos().to_string())
            .await
            .server_context("writing nsec file")?;
        crate::metrics::step_duration(self.step, elapsed.as_millis() as u64);
        Ok(failure)
    }

    fn publish(&self, stream: OutputStream, text: String) {
        self.events.publish(DingEvent::Output {
            build_id: self.build_id,
            step: self.step.to_string(),
            stream,
            text,
        });
    }
}

async fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .server_context(&format!("opening {}", path.display()))
}

/// Read a stream, sending newline-terminated segments. Partial data is
/// flushed when the buffer fills and at EOF. Read errors end the stream.
async fn read_segments<R>(mut r: R, stream: OutputStream, tx: mpsc::Sender<Segment>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; LINE_BUFFER];
    let mut have = 0;
    loop {
        let n = match r.read(&mut buf[have..]).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(stream = stream.as_str(), error = %e, "reading command output");
                0
            }
        };
        if n == 0 {
            if have > 0 {
                let _ = tx.send(Segment { stream, bytes: buf[..have].to_vec() }).await;
            }
            return;
        }
        have += n;
        let end = match buf[..have].iter().rposition(|&b| b == b'\n') {
            Some(i) => i + 1,
            None if have == buf.len() => have,
            None => continue,
        };
        if tx
            .send(Segment { stream, bytes: buf[..end].to_vec() })
            .await
            .is_err()
        {
            return;
        }
        buf.copy_within(end..have, 0);
        have -= end;
    }
}
