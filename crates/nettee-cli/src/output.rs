//! Opening the send/receive sinks named on the command line.
//!
//! No log file: both directions go to stdout. One log file: both directions
//! share it. Two log files: client→remote goes to the first, remote→client to
//! the second.

use anyhow::{bail, Context, Result};
use nettee_core::{JsonLinesSink, SharedWriter, Sink, WriterSink};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;

/// How teed bytes are framed in the logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Bytes verbatim.
    #[default]
    Raw,
    /// One JSON record per chunk with the payload hex-encoded.
    Json,
}

/// The pair of sinks handed to the engine.
pub struct Sinks {
    pub send: Arc<dyn Sink>,
    pub recv: Arc<dyn Sink>,
}

pub async fn open_sinks(logs: &[PathBuf], append: bool, format: OutputFormat) -> Result<Sinks> {
    match logs {
        [] => Ok(shared(tokio::io::stdout(), format)),
        [both] => Ok(shared(open_log(both, append).await?, format)),
        [send, recv] => Ok(Sinks {
            send: single(open_log(send, append).await?, "send", format),
            recv: single(open_log(recv, append).await?, "recv", format),
        }),
        _ => bail!("at most two log files may be given"),
    }
}

async fn open_log(path: &Path, append: bool) -> Result<File> {
    let mut opts = OpenOptions::new();
    opts.create(true);
    if append {
        opts.append(true);
    } else {
        opts.write(true).truncate(true);
    }
    opts.open(path)
        .await
        .with_context(|| format!("failed to open log file {}", path.display()))
}

fn shared<W>(writer: W, format: OutputFormat) -> Sinks
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer: SharedWriter<W> = Arc::new(Mutex::new(writer));
    match format {
        OutputFormat::Raw => Sinks {
            send: Arc::new(WriterSink::shared(writer.clone())),
            recv: Arc::new(WriterSink::shared(writer)),
        },
        OutputFormat::Json => Sinks {
            send: Arc::new(JsonLinesSink::shared(writer.clone(), "send")),
            recv: Arc::new(JsonLinesSink::shared(writer, "recv")),
        },
    }
}

fn single<W>(writer: W, label: &str, format: OutputFormat) -> Arc<dyn Sink>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    match format {
        OutputFormat::Raw => Arc::new(WriterSink::new(writer)),
        OutputFormat::Json => Arc::new(JsonLinesSink::new(writer, label)),
    }
}
