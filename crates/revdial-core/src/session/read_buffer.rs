//! Bounded per-connection read buffer
//!
//! Sits between the session's demux loop (the only producer) and the
//! connection's reader. The producer waits while the buffer is full, which
//! is how a slow reader pushes back on the whole session.

use std::future::{poll_fn, Future};
use std::io;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use bytes::{Buf, BytesMut};
use tokio::io::ReadBuf;
use tokio::time::{Instant, Sleep};

use crate::error::CloseReason;

/// Bounded byte queue with a read deadline and a once-only terminal error.
///
/// The buffered length never exceeds the capacity: an offer copies only as
/// much as fits and waits for the reader to make room for the rest.
#[derive(Debug)]
pub struct ReadBuffer {
    capacity: usize,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    buf: BytesMut,
    err: Option<CloseReason>,
    deadline: Option<Instant>,
    readers: Vec<Waker>,
    writers: Vec<Waker>,
}

fn register(wakers: &mut Vec<Waker>, waker: &Waker) {
    if !wakers.iter().any(|w| w.will_wake(waker)) {
        wakers.push(waker.clone());
    }
}

fn wake_all(wakers: &mut Vec<Waker>) {
    for waker in wakers.drain(..) {
        waker.wake();
    }
}

fn deadline_exceeded() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded")
}

impl ReadBuffer {
    /// Create an empty buffer holding at most `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Maximum number of buffered bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffered bytes
    pub fn len(&self) -> usize {
        self.lock().buf.len()
    }

    /// Whether no bytes are buffered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The terminal error, once set
    pub fn terminal_error(&self) -> Option<CloseReason> {
        self.lock().err.clone()
    }

    /// Append `data`, waiting while the buffer is full.
    ///
    /// Fails immediately with the terminal error if one is set, including
    /// one set while this offer was waiting.
    pub async fn offer(&self, data: &[u8]) -> Result<(), CloseReason> {
        let mut written = 0;
        poll_fn(|cx| self.poll_offer(cx, data, &mut written)).await
    }

    fn poll_offer(
        &self,
        cx: &mut Context<'_>,
        data: &[u8],
        written: &mut usize,
    ) -> Poll<Result<(), CloseReason>> {
        let mut inner = self.lock();

        if let Some(reason) = &inner.err {
            return Poll::Ready(Err(reason.clone()));
        }

        let free = self.capacity.saturating_sub(inner.buf.len());
        let n = free.min(data.len() - *written);
        if n > 0 {
            inner.buf.extend_from_slice(&data[*written..*written + n]);
            *written += n;
            wake_all(&mut inner.readers);
        }

        if *written == data.len() {
            return Poll::Ready(Ok(()));
        }

        register(&mut inner.writers, cx.waker());
        Poll::Pending
    }

    /// Poll for buffered bytes.
    ///
    /// Buffered bytes are always returned first. With the buffer empty, an
    /// orderly close reads as EOF and any other terminal error is returned.
    /// An expired read deadline fails with `TimedOut`; `timer` holds the
    /// caller's deadline timer between polls.
    pub fn poll_read(
        &self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
        timer: &mut Option<Pin<Box<Sleep>>>,
    ) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let mut inner = self.lock();

        if !inner.buf.is_empty() {
            let n = inner.buf.len().min(buf.remaining());
            buf.put_slice(&inner.buf[..n]);
            inner.buf.advance(n);
            wake_all(&mut inner.writers);
            return Poll::Ready(Ok(()));
        }

        if let Some(reason) = &inner.err {
            return Poll::Ready(if reason.is_eof() {
                Ok(())
            } else {
                Err(reason.to_io_error())
            });
        }

        let Some(deadline) = inner.deadline else {
            *timer = None;
            register(&mut inner.readers, cx.waker());
            return Poll::Pending;
        };

        if Instant::now() >= deadline {
            return Poll::Ready(Err(deadline_exceeded()));
        }

        register(&mut inner.readers, cx.waker());
        drop(inner);

        let sleep = timer.get_or_insert_with(|| Box::pin(tokio::time::sleep_until(deadline)));
        if sleep.deadline() != deadline {
            sleep.as_mut().reset(deadline);
        }
        match sleep.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(deadline_exceeded())),
            Poll::Pending => Poll::Pending,
        }
    }

    /// Read into `buf`, returning 0 at orderly close
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut timer = None;
        poll_fn(|cx| {
            let mut read_buf = ReadBuf::new(&mut *buf);
            match self.poll_read(cx, &mut read_buf, &mut timer) {
                Poll::Ready(Ok(())) => Poll::Ready(Ok(read_buf.filled().len())),
                Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                Poll::Pending => Poll::Pending,
            }
        })
        .await
    }

    /// Set or clear the read deadline. A waiting reader re-checks at once.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        let mut inner = self.lock();
        inner.deadline = deadline;
        wake_all(&mut inner.readers);
    }

    /// Set the terminal error and wake everyone.
    ///
    /// Only the first call has an effect; returns whether it was this one.
    pub fn close(&self, reason: CloseReason) -> bool {
        let mut inner = self.lock();
        if inner.err.is_some() {
            return false;
        }
        inner.err = Some(reason);
        wake_all(&mut inner.readers);
        wake_all(&mut inner.writers);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_offer_then_read_in_order() {
        let buffer = ReadBuffer::new(64);
        buffer.offer(b"hello ").await.unwrap();
        buffer.offer(b"world").await.unwrap();

        let mut out = [0u8; 32];
        let n = buffer.read(&mut out).await.unwrap();
        assert_eq!(&out[..n], b"hello world");
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_full_buffer_blocks_offer_until_read() {
        let buffer = Arc::new(ReadBuffer::new(16));
        let payload: Vec<u8> = (0..40u8).collect();

        let writer = {
            let buffer = Arc::clone(&buffer);
            let payload = payload.clone();
            tokio::spawn(async move { buffer.offer(&payload).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished(), "offer should wait for room");
        assert_eq!(buffer.len(), 16);

        let mut received = Vec::new();
        let mut chunk = [0u8; 7];
        while received.len() < payload.len() {
            let n = timeout(Duration::from_secs(1), buffer.read(&mut chunk))
                .await
                .expect("read stalled")
                .unwrap();
            assert!(buffer.len() <= buffer.capacity());
            received.extend_from_slice(&chunk[..n]);
        }

        writer.await.unwrap().unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_past_deadline_fails_immediately() {
        let buffer = ReadBuffer::new(16);
        buffer.set_read_deadline(Some(Instant::now() - Duration::from_millis(1)));

        let mut out = [0u8; 4];
        let err = timeout(Duration::from_millis(100), buffer.read(&mut out))
            .await
            .expect("read should not block")
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_future_deadline_expires() {
        let buffer = ReadBuffer::new(16);
        buffer.set_read_deadline(Some(Instant::now() + Duration::from_millis(50)));

        let mut out = [0u8; 4];
        let err = timeout(Duration::from_secs(1), buffer.read(&mut out))
            .await
            .expect("deadline should fire")
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_deadline_set_while_waiting() {
        let buffer = Arc::new(ReadBuffer::new(16));
        let reader = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move {
                let mut out = [0u8; 4];
                buffer.read(&mut out).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.set_read_deadline(Some(Instant::now()));

        let err = timeout(Duration::from_secs(1), reader)
            .await
            .expect("reader should wake")
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_eof_drains_buffer_first() {
        let buffer = ReadBuffer::new(16);
        buffer.offer(b"tail").await.unwrap();
        assert!(buffer.close(CloseReason::Eof));

        let mut out = [0u8; 16];
        assert_eq!(buffer.read(&mut out).await.unwrap(), 4);
        assert_eq!(buffer.read(&mut out).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_is_once_only() {
        let buffer = ReadBuffer::new(16);
        assert!(buffer.close(CloseReason::Remote("first".into())));
        assert!(!buffer.close(CloseReason::Eof));
        assert_eq!(
            buffer.terminal_error(),
            Some(CloseReason::Remote("first".into()))
        );

        let err = buffer.offer(b"late").await.unwrap_err();
        assert_eq!(err, CloseReason::Remote("first".into()));
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_reader_and_writer() {
        let buffer = Arc::new(ReadBuffer::new(4));
        buffer.offer(b"full").await.unwrap();

        let writer = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.offer(b"more").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.close(CloseReason::ClosedPipe);

        let result = timeout(Duration::from_secs(1), writer).await.unwrap().unwrap();
        assert_eq!(result, Err(CloseReason::ClosedPipe));

        let mut out = [0u8; 8];
        assert_eq!(buffer.read(&mut out).await.unwrap(), 4);
        let err = buffer.read(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
