use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ErrorKind, Result};

/// The wire protocol op codes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OpCode {
    Reply = 1,
    Query = 2004,
    Compressed = 2012,
    Message = 2013,
}

impl OpCode {
    /// Attempt to infer the op code based on the numeric value.
    pub(crate) fn from_i32(i: i32) -> Result<Self> {
        match i {
            1 => Ok(OpCode::Reply),
            2004 => Ok(OpCode::Query),
            2012 => Ok(OpCode::Compressed),
            2013 => Ok(OpCode::Message),
            other => Err(ErrorKind::InvalidResponse {
                message: format!("Invalid wire protocol opcode: {}", other),
            }
            .into()),
        }
    }
}

/// The header for any wire protocol message.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Header {
    pub(crate) length: i32,
    pub(crate) request_id: i32,
    pub(crate) response_to: i32,
    pub(crate) op_code: OpCode,
}

impl Header {
    pub(crate) const LENGTH: usize = 4 * std::mem::size_of::<i32>();

    pub(crate) async fn write_to<W: AsyncWrite + Unpin>(&self, stream: &mut W) -> Result<()> {
        stream.write_all(&self.length.to_le_bytes()).await?;
        stream.write_all(&self.request_id.to_le_bytes()).await?;
        stream.write_all(&self.response_to.to_le_bytes()).await?;
        stream
            .write_all(&(self.op_code as i32).to_le_bytes())
            .await?;

        Ok(())
    }

    pub(crate) async fn read_from<R: AsyncRead + Unpin + Send>(reader: &mut R) -> Result<Self> {
        let length = reader.read_i32_le().await?;
        let request_id = reader.read_i32_le().await?;
        let response_to = reader.read_i32_le().await?;
        let op_code = OpCode::from_i32(reader.read_i32_le().await?)?;

        Ok(Self {
            length,
            request_id,
            response_to,
            op_code,
        })
    }
}

#[cfg(test)]
mod test {
    use super::{Header, OpCode};

    #[test]
    fn unknown_opcodes_are_protocol_errors() {
        assert!(OpCode::from_i32(2010).is_err());
        assert!(OpCode::from_i32(0).is_err());
        assert_eq!(OpCode::from_i32(2013).unwrap(), OpCode::Message);
        assert_eq!(OpCode::from_i32(2012).unwrap(), OpCode::Compressed);
        assert_eq!(OpCode::from_i32(1).unwrap(), OpCode::Reply);
        assert_eq!(OpCode::from_i32(2004).unwrap(), OpCode::Query);
    }

    #[tokio::test]
    async fn header_round_trips_little_endian() {
        let header = Header {
            length: 1234,
            request_id: 7,
            response_to: 3,
            op_code: OpCode::Message,
        };

        let mut buf = Vec::new();
        header.write_to(&mut buf).await.unwrap();
        assert_eq!(buf.len(), Header::LENGTH);
        assert_eq!(&buf[0..4], &1234_i32.to_le_bytes());
        assert_eq!(&buf[12..16], &2013_i32.to_le_bytes());

        let parsed = Header::read_from(&mut buf.as_slice()).await.unwrap();
        assert_eq!(parsed.length, 1234);
        assert_eq!(parsed.request_id, 7);
        assert_eq!(parsed.response_to, 3);
        assert_eq!(parsed.op_code, OpCode::Message);
    }
}
