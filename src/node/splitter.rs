use crate::error::{Result, SwarmError};
use crate::models::Chunk;
use bytes::Bytes;
use futures::Stream;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Number of chunks a file of `file_size` bytes splits into.
pub fn chunk_count(file_size: u64, chunk_size: usize) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    file_size.div_ceil(chunk_size as u64)
}

/// Reads a source once, front to back, handing out one chunk at a time.
pub struct ChunkReader<R> {
    reader: R,
    chunk_size: usize,
    next_index: u32,
    exhausted: bool,
}

impl<R: AsyncRead + Unpin> ChunkReader<R> {
    pub fn new(reader: R, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(SwarmError::invalid("chunk_size must be greater than zero"));
        }
        Ok(Self {
            reader,
            chunk_size,
            next_index: 0,
            exhausted: false,
        })
    }

    /// Next chunk, or `None` once the source is drained. Only the last chunk
    /// can be shorter than `chunk_size`.
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.exhausted {
            return Ok(None);
        }

        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < self.chunk_size {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                self.exhausted = true;
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);

        let chunk = Chunk::new(self.next_index, Bytes::from(buf));
        self.next_index += 1;
        Ok(Some(chunk))
    }
}

/// Lazily splits `reader` into ordered chunks.
pub fn split<R>(reader: R, chunk_size: usize) -> Result<impl Stream<Item = Result<Chunk>>>
where
    R: AsyncRead + Unpin,
{
    let reader = ChunkReader::new(reader, chunk_size)?;
    Ok(futures::stream::try_unfold(reader, |mut reader| async move {
        Ok::<_, SwarmError>(reader.next_chunk().await?.map(|chunk| (chunk, reader)))
    }))
}
