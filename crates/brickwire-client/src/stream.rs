//! Multi-packet values.
//!
//! Values longer than one payload are transferred as a series of chunks,
//! each tagged with the offset of its first element and, for variable
//! length values, the total length. [`StreamReader`] reassembles such a
//! value from repeated low-level getter calls; [`StreamWriter`] splits a
//! value into chunks for a low-level setter.
//!
//! Both assume exclusive use of the low-level function for the duration of
//! the transfer; [`crate::Device`] serializes streams with a lock.

use std::future::Future;

use tracing::{debug, warn};

use crate::error::{ClientError, ClientResult};

/// Offset reported by a device whose stream currently has no data.
pub const EMPTY_STREAM_OFFSET: usize = u16::MAX as usize;

/// One chunk of a streamed value.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk<T> {
    /// Total element count, if the chunk carries it.
    pub total_length: Option<usize>,
    /// Index of the first element of `data` within the value.
    pub offset: usize,
    /// Chunk elements; the last chunk may be padded past the total.
    pub data: Vec<T>,
}

impl<T> Chunk<T> {
    pub fn new(total_length: Option<usize>, offset: usize, data: Vec<T>) -> Self {
        Self {
            total_length,
            offset,
            data,
        }
    }
}

/// Reassembles a value from chunked getter responses.
#[derive(Debug, Clone)]
pub struct StreamReader {
    name: String,
    chunk_size: usize,
    fixed_length: Option<usize>,
    empty_offset: Option<usize>,
}

impl StreamReader {
    /// Creates a reader for a stream whose chunks carry the total length.
    pub fn new(name: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            name: name.into(),
            chunk_size,
            fixed_length: None,
            empty_offset: Some(EMPTY_STREAM_OFFSET),
        }
    }

    /// Uses a constant total length instead of the one in each chunk.
    #[must_use]
    pub fn with_fixed_length(mut self, length: usize) -> Self {
        self.fixed_length = Some(length);
        self
    }

    /// Changes (or disables) the offset that marks an empty stream.
    #[must_use]
    pub fn with_empty_offset(mut self, offset: Option<usize>) -> Self {
        self.empty_offset = offset;
        self
    }

    /// Reads a complete value by calling `fetch` until all chunks arrived.
    ///
    /// If a chunk offset does not match the amount of data collected so
    /// far, the rest of the stream is drained so the next read starts in
    /// sync, and [`ClientError::StreamOutOfSync`] is returned.
    pub async fn read<T, F, Fut>(&self, mut fetch: F) -> ClientResult<Vec<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ClientResult<Chunk<T>>>,
    {
        let mut chunk = fetch().await?;

        if self.empty_offset == Some(chunk.offset) {
            debug!(stream = %self.name, "stream has no data");
            return Ok(Vec::new());
        }

        let mut total = self.total_length(&chunk)?;
        let mut out_of_sync = chunk.offset != 0;
        let mut data = Vec::with_capacity(total);
        data.append(&mut chunk.data);

        while !out_of_sync && data.len() < total {
            chunk = fetch().await?;
            total = self.total_length(&chunk)?;
            out_of_sync = chunk.offset != data.len() || chunk.data.is_empty();
            data.append(&mut chunk.data);
        }

        if out_of_sync {
            warn!(
                stream = %self.name,
                offset = chunk.offset,
                expected = data.len(),
                total,
                "stream out of sync, draining"
            );
            while chunk.offset + self.chunk_size < total {
                chunk = fetch().await?;
                total = self.total_length(&chunk)?;
            }
            return Err(ClientError::stream_out_of_sync(&self.name));
        }

        data.truncate(total);
        Ok(data)
    }

    fn total_length<T>(&self, chunk: &Chunk<T>) -> ClientResult<usize> {
        self.fixed_length.or(chunk.total_length).ok_or_else(|| {
            ClientError::invalid_argument(format!(
                "stream `{}` chunk carries no total length",
                self.name
            ))
        })
    }
}

/// Splits a value into chunks for a low-level setter.
#[derive(Debug, Clone)]
pub struct StreamWriter {
    name: String,
    chunk_size: usize,
    max_length: usize,
}

impl StreamWriter {
    /// Creates a writer; `max_length` is the largest value the length
    /// field of the setter can express.
    pub fn new(name: impl Into<String>, chunk_size: usize, max_length: usize) -> Self {
        Self {
            name: name.into(),
            chunk_size,
            max_length,
        }
    }

    /// Sends `data` chunk by chunk, padding the last chunk with `padding`.
    ///
    /// An empty value is sent as a single padded chunk. Returns the result
    /// of the last `send`.
    pub async fn write<T, R, F, Fut>(&self, data: &[T], padding: T, mut send: F) -> ClientResult<R>
    where
        T: Clone,
        F: FnMut(Chunk<T>) -> Fut,
        Fut: Future<Output = ClientResult<R>>,
    {
        if data.len() > self.max_length {
            return Err(ClientError::invalid_argument(format!(
                "{} can be at most {} items long",
                self.name, self.max_length
            )));
        }

        if self.chunk_size == 0 {
            return Err(ClientError::invalid_argument(format!(
                "{} has a zero chunk size",
                self.name
            )));
        }

        if data.is_empty() {
            let chunk = Chunk::new(Some(0), 0, vec![padding; self.chunk_size]);
            return send(chunk).await;
        }

        let mut offset = 0;
        loop {
            let end = (offset + self.chunk_size).min(data.len());
            let mut chunk_data = data[offset..end].to_vec();
            chunk_data.resize(self.chunk_size, padding.clone());

            let result = send(Chunk::new(Some(data.len()), offset, chunk_data)).await?;
            offset += self.chunk_size;
            if offset >= data.len() {
                return Ok(result);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use super::*;

    /// Hands out pre-scripted chunks and counts fetches.
    struct Script {
        chunks: RefCell<VecDeque<Chunk<u16>>>,
        fetches: RefCell<usize>,
    }

    impl Script {
        fn new(total: usize, chunk_size: usize, offsets: &[usize]) -> Self {
            let chunks = offsets
                .iter()
                .map(|&offset| {
                    let data = (offset..offset + chunk_size).map(|v| v as u16).collect();
                    Chunk::new(Some(total), offset, data)
                })
                .collect();
            Self {
                chunks: RefCell::new(chunks),
                fetches: RefCell::new(0),
            }
        }

        async fn fetch(&self) -> ClientResult<Chunk<u16>> {
            *self.fetches.borrow_mut() += 1;
            self.chunks
                .borrow_mut()
                .pop_front()
                .ok_or(ClientError::ConnectionLost)
        }

        fn fetches(&self) -> usize {
            *self.fetches.borrow()
        }
    }

    #[tokio::test]
    async fn reassembles_contiguous_chunks() {
        let script = Script::new(72, 30, &[0, 30, 60]);
        let reader = StreamReader::new("spectrum", 30);

        let value = reader.read(|| script.fetch()).await.unwrap();

        assert_eq!(value.len(), 72);
        assert_eq!(value, (0..72).collect::<Vec<u16>>());
        assert_eq!(script.fetches(), 3);
    }

    #[tokio::test]
    async fn gap_in_offsets_is_out_of_sync() {
        let script = Script::new(72, 30, &[0, 45]);
        let reader = StreamReader::new("spectrum", 30);

        let result = reader.read(|| script.fetch()).await;

        assert!(matches!(
            result,
            Err(ClientError::StreamOutOfSync { ref stream }) if stream == "spectrum"
        ));
        assert_eq!(script.fetches(), 2);
    }

    #[tokio::test]
    async fn out_of_sync_drains_remaining_chunks() {
        let script = Script::new(120, 30, &[0, 45, 75, 105, 0]);
        let reader = StreamReader::new("waveform", 30);

        let result = reader.read(|| script.fetch()).await;

        assert!(matches!(result, Err(ClientError::StreamOutOfSync { .. })));
        assert_eq!(script.fetches(), 4);
    }

    #[tokio::test]
    async fn first_chunk_not_at_zero_is_out_of_sync() {
        let script = Script::new(60, 30, &[30]);
        let reader = StreamReader::new("spectrum", 30);

        let result = reader.read(|| script.fetch()).await;
        assert!(matches!(result, Err(ClientError::StreamOutOfSync { .. })));
    }

    #[tokio::test]
    async fn empty_offset_yields_empty_value() {
        let script = Script::new(0, 30, &[EMPTY_STREAM_OFFSET]);
        let reader = StreamReader::new("waveform", 30).with_fixed_length(1536);

        let value = reader.read(|| script.fetch()).await.unwrap();
        assert!(value.is_empty());
        assert_eq!(script.fetches(), 1);
    }

    #[tokio::test]
    async fn fixed_length_ignores_chunk_total() {
        let script = Script::new(999, 30, &[0, 30]);
        let reader = StreamReader::new("waveform", 30).with_fixed_length(45);

        let value = reader.read(|| script.fetch()).await.unwrap();
        assert_eq!(value.len(), 45);
    }

    #[tokio::test]
    async fn fetch_error_abandons_the_stream() {
        let script = Script::new(90, 30, &[0]);
        let reader = StreamReader::new("spectrum", 30);

        let result = reader.read(|| script.fetch()).await;
        assert!(matches!(result, Err(ClientError::ConnectionLost)));
    }

    #[tokio::test]
    async fn writer_pads_last_chunk() {
        let writer = StreamWriter::new("pixels", 4, 100);
        let sent = RefCell::new(Vec::new());
        let data: Vec<u8> = (1..=10).collect();

        let last = writer
            .write(&data, 0, |chunk| {
                sent.borrow_mut().push(chunk.clone());
                async move { Ok(chunk.offset) }
            })
            .await
            .unwrap();

        let sent = sent.into_inner();
        assert_eq!(last, 8);
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0], Chunk::new(Some(10), 0, vec![1, 2, 3, 4]));
        assert_eq!(sent[2], Chunk::new(Some(10), 8, vec![9, 10, 0, 0]));
    }

    #[tokio::test]
    async fn writer_sends_one_chunk_for_empty_value() {
        let writer = StreamWriter::new("pixels", 4, 100);
        let sent = RefCell::new(Vec::new());

        writer
            .write(&[], false, |chunk| {
                sent.borrow_mut().push(chunk);
                async { Ok(()) }
            })
            .await
            .unwrap();

        assert_eq!(sent.into_inner(), vec![Chunk::new(Some(0), 0, vec![false; 4])]);
    }

    #[tokio::test]
    async fn writer_rejects_oversized_value() {
        let writer = StreamWriter::new("pixels", 4, 8);
        let result = writer
            .write(&[0u8; 9], 0, |_| async { Ok(()) })
            .await;
        assert!(matches!(result, Err(ClientError::InvalidArgument(_))));
    }
}
