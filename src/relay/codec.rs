use tokio::io::{self, AsyncWrite, AsyncWriteExt};

/// The codec used for transparency
#[derive(Clone, Copy, Debug)]
pub struct ClientCodec {
    escape_count: u8,
}

impl Default for ClientCodec {
    /// Starts at the beginning of a line, so a leading dot gets escaped too
    fn default() -> Self {
        ClientCodec { escape_count: 2 }
    }
}

impl ClientCodec {
    /// Creates a new client codec
    pub fn new() -> Self {
        ClientCodec::default()
    }
}

impl ClientCodec {
    /// Adds transparency. An empty frame writes nothing.
    pub async fn encode<W: AsyncWrite + Unpin>(
        &mut self,
        frame: &[u8],
        mut buf: W,
    ) -> io::Result<()> {
        match frame.len() {
            0 => Ok(()),
            _ => {
                let mut start = 0;
                for (idx, byte) in frame.iter().enumerate() {
                    match self.escape_count {
                        0 => self.escape_count = if *byte == b'\r' { 1 } else { 0 },
                        1 => self.escape_count = if *byte == b'\n' { 2 } else { 0 },
                        2 => {
                            self.escape_count = if *byte == b'.' {
                                3
                            } else if *byte == b'\r' {
                                1
                            } else {
                                0
                            }
                        }
                        _ => unreachable!(),
                    }
                    if self.escape_count == 3 {
                        self.escape_count = 0;
                        buf.write_all(&frame[start..idx]).await?;
                        buf.write_all(b".").await?;
                        start = idx;
                    }
                }
                buf.write_all(&frame[start..]).await?;
                Ok(())
            }
        }
    }

    /// Writes the terminating `.` line, closing an unterminated last line first
    pub async fn finish<W: AsyncWrite + Unpin>(&mut self, mut buf: W) -> io::Result<()> {
        match self.escape_count {
            0 => buf.write_all(b"\r\n.\r\n").await?,
            1 => buf.write_all(b"\n.\r\n").await?,
            _ => buf.write_all(b".\r\n").await?,
        }
        self.escape_count = 2;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_codec() {
        let mut codec = ClientCodec::new();
        let mut buf: Vec<u8> = vec![];

        assert!(codec.encode(b"test\r\n", &mut buf).await.is_ok());
        assert!(codec.encode(b".\r\n", &mut buf).await.is_ok());
        assert!(codec.encode(b"\r\ntest", &mut buf).await.is_ok());
        assert!(codec.encode(b"te\r\n.\r\nst", &mut buf).await.is_ok());
        assert!(codec.encode(b"test", &mut buf).await.is_ok());
        assert!(codec.encode(b"test.", &mut buf).await.is_ok());
        assert!(codec.encode(b"test\n", &mut buf).await.is_ok());
        assert!(codec.encode(b".test\n", &mut buf).await.is_ok());
        assert!(codec.encode(b"test", &mut buf).await.is_ok());
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "test\r\n..\r\n\r\ntestte\r\n..\r\nsttesttest.test\n.test\ntest"
        );
    }

    #[tokio::test]
    async fn test_terminator_after_crlf() {
        let mut codec = ClientCodec::new();
        let mut buf: Vec<u8> = vec![];

        codec.encode(b"hello\r\n", &mut buf).await.unwrap();
        codec.finish(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello\r\n.\r\n");
    }

    #[tokio::test]
    async fn test_terminator_without_crlf() {
        let mut codec = ClientCodec::new();
        let mut buf: Vec<u8> = vec![];

        codec.encode(b"hello", &mut buf).await.unwrap();
        codec.finish(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello\r\n.\r\n");
    }

    #[tokio::test]
    async fn test_empty_body() {
        let mut codec = ClientCodec::new();
        let mut buf: Vec<u8> = vec![];

        codec.encode(b"", &mut buf).await.unwrap();
        codec.finish(&mut buf).await.unwrap();
        assert_eq!(buf, b".\r\n");
    }

    #[tokio::test]
    async fn test_leading_dot() {
        let mut codec = ClientCodec::new();
        let mut buf: Vec<u8> = vec![];

        codec.encode(b".leading-dot\r\n", &mut buf).await.unwrap();
        codec.finish(&mut buf).await.unwrap();
        assert_eq!(buf, b"..leading-dot\r\n.\r\n");
    }
}
