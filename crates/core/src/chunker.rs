//! Splitting a byte source into fixed-size, content-addressed chunks.
//!
//! A [`Chunker`] is a lazy, finite, non-restartable sequence of [`Chunk`]s. It
//! knows the declared size of its source up front and fails with
//! [`Error::BadInput`](crate::Error::BadInput) if the source turns out shorter
//! or longer. Both blocking ([`std::io::Read`]) and async
//! ([`tokio::io::AsyncRead`]) sources are supported.

use crate::chunk::{Chunk, ChunkPlan};
use crate::hash::{ContentHash, ContentHasher};
use crate::{Error, Result};
use bytes::Bytes;
use futures::Stream;
use std::io::{self, Read};
use tokio::io::{AsyncRead, AsyncReadExt};

pub struct Chunker<R> {
    reader: R,
    plan: ChunkPlan,
    next_index: u64,
    file_hasher: Option<ContentHasher>,
    file_hash: Option<ContentHash>,
    done: bool,
}

impl<R> Chunker<R> {
    /// Create a chunker over `reader`, which must yield exactly `total_size` bytes.
    pub fn new(reader: R, total_size: u64, chunk_size: u64) -> Result<Self> {
        Ok(Self {
            reader,
            plan: ChunkPlan::new(total_size, chunk_size)?,
            next_index: 0,
            file_hasher: Some(ContentHash::hasher()),
            file_hash: None,
            done: false,
        })
    }

    pub fn plan(&self) -> ChunkPlan {
        self.plan
    }

    /// Hash of the whole source. Available once every chunk has been produced.
    pub fn file_hash(&self) -> Option<ContentHash> {
        self.file_hash
    }

    fn emit(&mut self, buf: Vec<u8>) -> Chunk {
        if let Some(hasher) = self.file_hasher.as_mut() {
            hasher.update(&buf);
        }
        let chunk = Chunk::new(self.next_index, Bytes::from(buf));
        self.next_index += 1;
        chunk
    }

    fn finish(&mut self, trailing: usize) -> Result<Option<Chunk>> {
        self.done = true;
        if trailing > 0 {
            return Err(Error::BadInput(format!(
                "source is longer than the declared {} bytes",
                self.plan.total_size
            )));
        }
        self.file_hash = self.file_hasher.take().map(ContentHasher::finalize);
        Ok(None)
    }

    fn short_read(&mut self, filled: usize) -> Error {
        self.done = true;
        let got = self.plan.offset(self.next_index) + filled as u64;
        Error::BadInput(format!(
            "source ended after {got} bytes, declared {}",
            self.plan.total_size
        ))
    }
}

impl<R: Read> Chunker<R> {
    /// Produce the next chunk, or `None` once the source is exhausted.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.done {
            return Ok(None);
        }
        let Some(len) = self.plan.expected_len(self.next_index) else {
            let mut peek = [0u8; 1];
            let trailing = fill_blocking(&mut self.reader, &mut peek)?;
            return self.finish(trailing);
        };

        let mut buf = vec![0u8; len as usize];
        let filled = fill_blocking(&mut self.reader, &mut buf)?;
        if filled < buf.len() {
            return Err(self.short_read(filled));
        }
        Ok(Some(self.emit(buf)))
    }
}

impl<R: Read> Iterator for Chunker<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk().transpose()
    }
}

impl<R: AsyncRead + Unpin> Chunker<R> {
    /// Async counterpart of [`Chunker::next_chunk`].
    pub async fn next_chunk_async(&mut self) -> Result<Option<Chunk>> {
        if self.done {
            return Ok(None);
        }
        let Some(len) = self.plan.expected_len(self.next_index) else {
            let mut peek = [0u8; 1];
            let trailing = fill_async(&mut self.reader, &mut peek).await?;
            return self.finish(trailing);
        };

        let mut buf = vec![0u8; len as usize];
        let filled = fill_async(&mut self.reader, &mut buf).await?;
        if filled < buf.len() {
            return Err(self.short_read(filled));
        }
        Ok(Some(self.emit(buf)))
    }

    /// Consume the chunker as a stream of chunks.
    pub fn into_stream(self) -> impl Stream<Item = Result<Chunk>> {
        futures::stream::try_unfold(self, |mut chunker| async move {
            Ok(chunker
                .next_chunk_async()
                .await?
                .map(|chunk| (chunk, chunker)))
        })
    }
}

/// Read until `buf` is full or the source hits EOF. Returns bytes read.
fn fill_blocking<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

async fn fill_async<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use futures::TryStreamExt;
    use std::io::Cursor;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_chunks_cover_source_in_order() {
        let data = pattern(100);
        let chunks: Vec<Chunk> = Chunker::new(Cursor::new(data.clone()), 100, 30)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(chunks.len(), 4);
        assert_eq!(
            chunks.iter().map(|c| c.index).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
        assert_eq!(chunks[3].size(), 10);
        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.data.to_vec()).collect();
        assert_eq!(joined, data);
        for chunk in &chunks {
            assert!(Chunk::verify(&chunk.data, &chunk.hash).is_ok());
        }
    }

    #[test]
    fn test_file_hash_available_after_exhaustion() {
        let data = pattern(70);
        let mut chunker = Chunker::new(Cursor::new(data.clone()), 70, 32).unwrap();
        assert!(chunker.file_hash().is_none());
        while chunker.next_chunk().unwrap().is_some() {}
        assert_eq!(chunker.file_hash(), Some(ContentHash::compute(&data)));
    }

    #[test]
    fn test_short_source_is_bad_input() {
        let mut chunker = Chunker::new(Cursor::new(pattern(50)), 64, 32).unwrap();
        assert!(chunker.next_chunk().unwrap().is_some());
        let err = chunker.next_chunk().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadInput);
        // Non-restartable: nothing more after a failure.
        assert!(chunker.next_chunk().unwrap().is_none());
    }

    #[test]
    fn test_long_source_is_bad_input() {
        let mut chunker = Chunker::new(Cursor::new(pattern(65)), 64, 32).unwrap();
        assert!(chunker.next_chunk().unwrap().is_some());
        assert!(chunker.next_chunk().unwrap().is_some());
        let err = chunker.next_chunk().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadInput);
        assert!(chunker.file_hash().is_none());
    }

    #[test]
    fn test_empty_source_has_no_chunks() {
        let mut chunker = Chunker::new(Cursor::new(Vec::new()), 0, 32).unwrap();
        assert!(chunker.next_chunk().unwrap().is_none());
        assert_eq!(chunker.file_hash(), Some(ContentHash::compute(b"")));
    }

    #[tokio::test]
    async fn test_async_stream_matches_blocking() {
        let data = pattern(1000);
        let blocking: Vec<Chunk> = Chunker::new(Cursor::new(data.clone()), 1000, 128)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        let streamed: Vec<Chunk> = Chunker::new(Cursor::new(data), 1000, 128)
            .unwrap()
            .into_stream()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(blocking.len(), streamed.len());
        for (a, b) in blocking.iter().zip(&streamed) {
            assert_eq!(a.index, b.index);
            assert_eq!(a.hash, b.hash);
        }
    }

    #[tokio::test]
    async fn test_async_short_source_is_bad_input() {
        let result: Result<Vec<Chunk>> = Chunker::new(Cursor::new(pattern(10)), 20, 8)
            .unwrap()
            .into_stream()
            .try_collect()
            .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::BadInput);
    }
}
