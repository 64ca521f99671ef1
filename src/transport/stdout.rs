use std::io;

use tokio::{
    io::{AsyncWrite, AsyncWriteExt, Stdout},
    sync::Mutex,
};

use super::{Message, PublishError, Transport};

/// Writes every payload as one line. Attributes and topic are not printed.
///
/// Generic over the writer so it can be pointed at anything async-writable;
/// [`StdoutTransport::new`] targets the process's stdout.
pub struct StdoutTransport<W = Stdout> {
    out: Mutex<W>,
}

impl StdoutTransport {
    pub fn new() -> Self {
        Self::with_writer(tokio::io::stdout())
    }
}

impl Default for StdoutTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> StdoutTransport<W> {
    pub fn with_writer(writer: W) -> Self {
        Self {
            out: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

/// A closed pipe will not reopen; anything else may clear up.
fn classify(err: io::Error) -> PublishError {
    match err.kind() {
        io::ErrorKind::BrokenPipe | io::ErrorKind::WriteZero => {
            PublishError::Fatal(err.to_string())
        }
        _ => PublishError::Retryable(err.to_string()),
    }
}

impl<W> Transport for StdoutTransport<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn publish(&self, _topic: &str, message: &Message) -> Result<(), PublishError> {
        let mut out = self.out.lock().await;
        out.write_all(&message.data).await.map_err(classify)?;
        out.write_all(b"\n").await.map_err(classify)?;
        out.flush().await.map_err(classify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn one_line_per_message() {
        let transport = StdoutTransport::with_writer(Vec::<u8>::new());
        for body in ["{\"a\": 1}", "{\"b\": 2}"] {
            let message = Message {
                data: body.as_bytes().to_vec(),
                ..Message::default()
            };
            transport.publish("ignored", &message).await.unwrap();
        }
        assert_eq!(transport.into_inner(), b"{\"a\": 1}\n{\"b\": 2}\n");
    }

    #[test]
    fn broken_pipe_is_fatal() {
        let err = classify(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(!err.is_retryable());
        let err = classify(io::Error::from(io::ErrorKind::Interrupted));
        assert!(err.is_retryable());
    }
}
