use crate::cancel::CancellationToken;
use crate::error::{PipelineError, Result};
use crate::message::Message;
use crossbeam::channel::{self, Receiver};
use crossbeam::select;
use std::thread::{self, JoinHandle};
use tracing::debug;

/// Feed `items` into a new bounded stream from a producer thread.
///
/// Messages get ids `1..=n` in iteration order. The stream is closed when
/// the iterator is exhausted. The join handle yields how many messages were
/// sent.
pub fn source<T, It>(items: It, buffer: usize) -> Result<(Receiver<Message<T>>, JoinHandle<usize>)>
where
    T: Send + 'static,
    It: IntoIterator<Item = T>,
    It::IntoIter: Send + 'static,
{
    source_with_cancel(items, buffer, &CancellationToken::new())
}

/// Like [`source`], but stops producing once `token` fires or every
/// receiver is gone. The stream is closed either way.
pub fn source_with_cancel<T, It>(
    items: It,
    buffer: usize,
    token: &CancellationToken,
) -> Result<(Receiver<Message<T>>, JoinHandle<usize>)>
where
    T: Send + 'static,
    It: IntoIterator<Item = T>,
    It::IntoIter: Send + 'static,
{
    let (tx, rx) = channel::bounded(buffer);
    let items = items.into_iter();
    let token = token.clone();

    let handle = thread::Builder::new()
        .name("source".into())
        .spawn(move || {
            let done = token.done();
            let mut sent = 0;
            for (id, payload) in (1..).zip(items) {
                if token.is_cancelled() {
                    break;
                }
                select! {
                    send(tx, Message::new(id, payload)) -> res => {
                        if res.is_err() {
                            break;
                        }
                        sent += 1;
                    }
                    recv(done) -> _ => break,
                }
            }
            debug!(sent, "source exhausted, closing stream");
            sent
        })
        .map_err(|e| PipelineError::ThreadError(format!("failed to spawn source: {e}")))?;

    Ok((rx, handle))
}
