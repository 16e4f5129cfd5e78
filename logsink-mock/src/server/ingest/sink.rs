use std::{
    fmt,
    io::{self, Write as _},
};

/// Append-only destination of the received logs.
///
/// Each call to [`LogSink::emit`] is atomic with respect to other calls:
/// concurrent emissions never interleave their bytes.
pub trait LogSink: fmt::Debug + Send + Sync + 'static {
    fn emit(&self, line: &[u8]) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
/// Writes every emission to the process' standard output.
pub struct StdoutSink;

impl StdoutSink {
    pub fn new() -> Self {
        Self
    }
}

impl LogSink for StdoutSink {
    fn emit(&self, line: &[u8]) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        stdout.write_all(line)?;
        stdout.flush()
    }
}

#[cfg(test)]
pub(crate) use self::memory::MemorySink;


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_stdout_sink_emit() {
        let sink = StdoutSink::new();
        sink.emit(b"{\"msg\":\"stdout sink\"}\n").unwrap();
        sink.emit(b"").unwrap();
    }

    #[test]
    fn test_stdout_sink_concurrent_emit() {
        let sink: Arc<dyn LogSink> = Arc::new(StdoutSink::new());

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let sink = sink.clone();
                std::thread::spawn(move || sink.emit(format!("{{\"thread\":{i}}}\n").as_bytes()))
            })
            .collect();

        for handle in handles {
            handle.join().unwrap().unwrap();
        }
    }
}
