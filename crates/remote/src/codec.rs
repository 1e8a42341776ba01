//! 流上的长度前缀分帧：`[u32 len][envelope bytes]`

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use scheduler_core::{SchedulerError, SchedulerResult};

use crate::message::Message;

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// 读取一帧原始字节；对端正常关闭时返回 `Ok(None)`
    pub async fn read_frame<R>(&self, reader: &mut R) -> SchedulerResult<Option<Vec<u8>>>
    where
        R: AsyncRead + Unpin,
    {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let size = u32::from_be_bytes(len_buf) as usize;
        if size > self.max_frame_size {
            return Err(SchedulerError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }

        let mut frame = vec![0u8; size];
        reader.read_exact(&mut frame).await?;
        Ok(Some(frame))
    }

    pub async fn write_frame<W>(&self, writer: &mut W, frame: &[u8]) -> SchedulerResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        if frame.len() > self.max_frame_size {
            return Err(SchedulerError::FrameTooLarge {
                size: frame.len(),
                max: self.max_frame_size,
            });
        }
        writer.write_all(&(frame.len() as u32).to_be_bytes()).await?;
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn write_message<W>(&self, writer: &mut W, message: &Message) -> SchedulerResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        self.write_frame(writer, &message.encode()?).await
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(16 * 1024 * 1024)
    }
}
