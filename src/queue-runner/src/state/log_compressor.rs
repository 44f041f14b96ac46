use std::path::PathBuf;

/// FIFO queue of finished step logs awaiting compression, drained by a
/// single worker. Entries queued when the process dies are lost; the log
/// file itself stays readable uncompressed.
pub struct LogCompressor {
    tx: tokio::sync::mpsc::UnboundedSender<PathBuf>,
    rx: tokio::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<PathBuf>>,
}

impl Default for LogCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl LogCompressor {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    #[tracing::instrument(skip(self), err)]
    pub fn schedule(&self, log_file: PathBuf) -> anyhow::Result<()> {
        self.tx.send(log_file)?;
        Ok(())
    }

    pub async fn compress_once(&self) -> bool {
        let Some(log_file) = ({
            let mut rx = self.rx.lock().await;
            rx.recv().await
        }) else {
            return false;
        };

        if let Err(e) = compress_log_file(&log_file).await {
            tracing::error!("Failed to compress log file {}: {e}", log_file.display());
        }
        true
    }
}

#[tracing::instrument(err)]
async fn compress_log_file(log_file: &std::path::Path) -> anyhow::Result<()> {
    let target = {
        let mut os = log_file.as_os_str().to_owned();
        os.push(".zst");
        PathBuf::from(os)
    };

    let input = fs_err::tokio::File::open(log_file).await?;
    let mut reader = async_compression::tokio::bufread::ZstdEncoder::new(
        tokio::io::BufReader::new(input),
    );
    let mut output = fs_err::tokio::File::create(&target).await?;
    tokio::io::copy(&mut reader, &mut output).await?;

    fs_err::tokio::remove_file(log_file).await?;
    tracing::debug!("compressed log {} -> {}", log_file.display(), target.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn test_compress_replaces_log_with_zst() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("step.log");
        std::fs::write(&log, "building...\ndone\n").unwrap();

        compress_log_file(&log).await.unwrap();

        assert!(!log.exists());
        assert!(dir.path().join("step.log.zst").exists());
    }

    #[tokio::test]
    async fn test_queue_is_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let compressor = LogCompressor::new();

        for name in ["a.log", "b.log"] {
            let path = dir.path().join(name);
            std::fs::write(&path, "log").unwrap();
            compressor.schedule(path).unwrap();
        }

        assert!(compressor.compress_once().await);
        assert!(!dir.path().join("a.log").exists());
        assert!(dir.path().join("b.log").exists());

        assert!(compressor.compress_once().await);
        assert!(!dir.path().join("b.log").exists());
    }
}
