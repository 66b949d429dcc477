//! Async encode/decode over any `AsyncRead` / `AsyncWrite`
//!
//! Frames are built into a single buffer and written with one `write_all`, so a
//! request never reaches the server half-written because of our own buffering.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::messages::{
    AppAssignment, ControlRequest, NewAppRequest, NewAppResponse, Opcode, ProtoError,
    ProviderHello, TunnelSignal,
};
use crate::HEARTBEAT_ACK;

const MAX_TOKEN_LEN: usize = u16::MAX as usize;
const MAX_APPS: usize = u8::MAX as usize;

impl NewAppRequest {
    fn encode_into(&self, buf: &mut BytesMut) -> Result<(), ProtoError> {
        let token = self.token.as_bytes();
        if token.len() > MAX_TOKEN_LEN {
            return Err(ProtoError::FieldTooLarge {
                field: "token",
                len: token.len(),
                max: MAX_TOKEN_LEN,
            });
        }
        if self.port_hints.len() > MAX_APPS {
            return Err(ProtoError::FieldTooLarge {
                field: "app count",
                len: self.port_hints.len(),
                max: MAX_APPS,
            });
        }

        buf.reserve(2 + token.len() + 1 + self.port_hints.len() * 2);
        buf.put_u16(token.len() as u16);
        buf.put_slice(token);
        buf.put_u8(self.port_hints.len() as u8);
        for hint in &self.port_hints {
            buf.put_u16(*hint);
        }
        Ok(())
    }

    async fn decode<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, ProtoError> {
        let token_len = reader.read_u16().await? as usize;
        let mut token = vec![0u8; token_len];
        reader.read_exact(&mut token).await?;
        let token = String::from_utf8(token).map_err(|_| ProtoError::InvalidToken)?;

        let app_count = reader.read_u8().await? as usize;
        let mut port_hints = Vec::with_capacity(app_count);
        for _ in 0..app_count {
            port_hints.push(reader.read_u16().await?);
        }

        Ok(Self { token, port_hints })
    }
}

impl ControlRequest {
    /// Encode opcode and payload into one frame.
    pub fn encode(&self) -> Result<BytesMut, ProtoError> {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u8(self.opcode().as_byte());
        match self {
            ControlRequest::NewApp { request, .. } => request.encode_into(&mut buf)?,
            ControlRequest::Heartbeat { client_id } | ControlRequest::CloseClient { client_id } => {
                buf.put_u16(*client_id)
            }
        }
        Ok(buf)
    }
}

impl NewAppResponse {
    pub fn encode(&self) -> Result<BytesMut, ProtoError> {
        if self.assignments.len() > MAX_APPS {
            return Err(ProtoError::FieldTooLarge {
                field: "app count",
                len: self.assignments.len(),
                max: MAX_APPS,
            });
        }
        let mut buf = BytesMut::with_capacity(2 + self.assignments.len() * 3);
        buf.put_u16(self.client_id);
        for a in &self.assignments {
            buf.put_u8(a.app_id);
            buf.put_u16(a.port);
        }
        Ok(buf)
    }
}

/// Read the leading opcode byte of a control connection.
pub async fn read_opcode<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Opcode, ProtoError> {
    let byte = reader.read_u8().await?;
    Opcode::try_from(byte)
}

/// Read the payload that follows an already-consumed opcode.
pub async fn read_request_body<R: AsyncRead + Unpin>(
    reader: &mut R,
    opcode: Opcode,
) -> Result<ControlRequest, ProtoError> {
    Ok(match opcode {
        Opcode::NewAppRequest | Opcode::Reconnect => ControlRequest::NewApp {
            reconnect: opcode == Opcode::Reconnect,
            request: NewAppRequest::decode(reader).await?,
        },
        Opcode::Heartbeat => ControlRequest::Heartbeat {
            client_id: reader.read_u16().await?,
        },
        Opcode::CloseClient => ControlRequest::CloseClient {
            client_id: reader.read_u16().await?,
        },
    })
}

/// Read one full control request (opcode and payload).
pub async fn read_control_request<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<ControlRequest, ProtoError> {
    let opcode = read_opcode(reader).await?;
    read_request_body(reader, opcode).await
}

pub async fn write_control_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    request: &ControlRequest,
) -> Result<(), ProtoError> {
    let frame = request.encode()?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_new_app_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &NewAppResponse,
) -> Result<(), ProtoError> {
    let frame = response.encode()?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the reply to a `NewAppRequest`.
///
/// The reply carries no count; the caller knows how many apps it asked for.
pub async fn read_new_app_response<R: AsyncRead + Unpin>(
    reader: &mut R,
    app_count: usize,
) -> Result<NewAppResponse, ProtoError> {
    let client_id = reader.read_u16().await?;
    let mut assignments = Vec::with_capacity(app_count);
    for _ in 0..app_count {
        let app_id = reader.read_u8().await?;
        let port = reader.read_u16().await?;
        assignments.push(AppAssignment { app_id, port });
    }
    Ok(NewAppResponse {
        client_id,
        assignments,
    })
}

pub async fn write_heartbeat_ack<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<(), ProtoError> {
    writer.write_u8(HEARTBEAT_ACK).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_heartbeat_ack<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(), ProtoError> {
    match reader.read_u8().await? {
        HEARTBEAT_ACK => Ok(()),
        other => Err(ProtoError::UnexpectedAck(other)),
    }
}

pub async fn write_provider_hello<W: AsyncWrite + Unpin>(
    writer: &mut W,
    hello: ProviderHello,
) -> Result<(), ProtoError> {
    writer.write_all(&hello.to_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_provider_hello<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<ProviderHello, ProtoError> {
    let mut bytes = [0u8; ProviderHello::LEN];
    reader.read_exact(&mut bytes).await?;
    Ok(ProviderHello::from_bytes(bytes))
}

pub async fn write_tunnel_signal<W: AsyncWrite + Unpin>(
    writer: &mut W,
    signal: TunnelSignal,
) -> Result<(), ProtoError> {
    writer.write_u8(signal.as_byte()).await?;
    writer.flush().await?;
    Ok(())
}

/// Wait for the server's signal on a pooled reverse connection.
///
/// EOF is reported as [`TunnelSignal::Close`], not as an error.
pub async fn read_tunnel_signal<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<TunnelSignal, ProtoError> {
    let mut byte = [0u8; 1];
    let n = reader.read(&mut byte).await?;
    if n == 0 {
        return Ok(TunnelSignal::Close);
    }
    TunnelSignal::try_from(byte[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_new_app_request_wire_layout() {
        let req = ControlRequest::NewApp {
            reconnect: false,
            request: NewAppRequest::new("ab", vec![0, 8080]),
        };
        let frame = req.encode().unwrap();
        assert_eq!(
            &frame[..],
            &[0x01, 0x00, 0x02, b'a', b'b', 0x02, 0x00, 0x00, 0x1f, 0x90]
        );

        let decoded = read_control_request(&mut &frame[..]).await.unwrap();
        assert_eq!(decoded, req);
    }

    #[tokio::test]
    async fn test_reconnect_decodes_with_flag() {
        let req = ControlRequest::NewApp {
            reconnect: true,
            request: NewAppRequest::new("token", vec![]),
        };
        let frame = req.encode().unwrap();
        assert_eq!(frame[0], 0x04);
        match read_control_request(&mut &frame[..]).await.unwrap() {
            ControlRequest::NewApp { reconnect, request } => {
                assert!(reconnect);
                assert!(request.port_hints.is_empty());
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_heartbeat_and_close_layout() {
        let hb = ControlRequest::Heartbeat { client_id: 513 }.encode().unwrap();
        assert_eq!(&hb[..], &[0x02, 0x02, 0x01]);
        let close = ControlRequest::CloseClient { client_id: 7 }.encode().unwrap();
        assert_eq!(&close[..], &[0x03, 0x00, 0x07]);
    }

    #[tokio::test]
    async fn test_truncated_request_is_connection_closed() {
        // Token length says 5, only 2 bytes follow
        let bytes = [0x01u8, 0x00, 0x05, b'a', b'b'];
        let err = read_control_request(&mut &bytes[..]).await.unwrap_err();
        assert!(matches!(err, ProtoError::ConnectionClosed));

        let empty: [u8; 0] = [];
        let err = read_control_request(&mut &empty[..]).await.unwrap_err();
        assert!(matches!(err, ProtoError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_unknown_opcode() {
        let bytes = [0x9au8, 0x00, 0x01];
        let err = read_control_request(&mut &bytes[..]).await.unwrap_err();
        assert!(matches!(err, ProtoError::UnknownOpcode(0x9a)));
    }

    #[tokio::test]
    async fn test_oversized_fields_rejected() {
        let long = "x".repeat(u16::MAX as usize + 1);
        let req = ControlRequest::NewApp {
            reconnect: false,
            request: NewAppRequest::new(long, vec![0]),
        };
        assert!(matches!(
            req.encode(),
            Err(ProtoError::FieldTooLarge { field: "token", .. })
        ));

        let req = ControlRequest::NewApp {
            reconnect: false,
            request: NewAppRequest::new("t", vec![0; 256]),
        };
        assert!(matches!(
            req.encode(),
            Err(ProtoError::FieldTooLarge {
                field: "app count",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_response_over_duplex() {
        let (mut server, mut client) = duplex(64);
        let response = NewAppResponse {
            client_id: 42,
            assignments: vec![
                AppAssignment {
                    app_id: 1,
                    port: 20001,
                },
                AppAssignment {
                    app_id: 2,
                    port: 20002,
                },
            ],
        };
        write_new_app_response(&mut server, &response).await.unwrap();
        let read = read_new_app_response(&mut client, 2).await.unwrap();
        assert_eq!(read, response);
    }

    #[tokio::test]
    async fn test_response_with_zero_apps() {
        let response = NewAppResponse {
            client_id: 9,
            assignments: vec![],
        };
        let frame = response.encode().unwrap();
        assert_eq!(&frame[..], &[0x00, 0x09]);
        let read = read_new_app_response(&mut &frame[..], 0).await.unwrap();
        assert_eq!(read, response);
    }

    #[tokio::test]
    async fn test_tunnel_signal_eof_is_close() {
        let (server, mut client) = duplex(8);
        drop(server);
        assert_eq!(
            read_tunnel_signal(&mut client).await.unwrap(),
            TunnelSignal::Close
        );
    }

    #[tokio::test]
    async fn test_tunnel_signal_bytes() {
        let (mut server, mut client) = duplex(8);
        write_tunnel_signal(&mut server, TunnelSignal::Open)
            .await
            .unwrap();
        write_tunnel_signal(&mut server, TunnelSignal::Close)
            .await
            .unwrap();
        server.write_u8(0x55).await.unwrap();

        assert_eq!(
            read_tunnel_signal(&mut client).await.unwrap(),
            TunnelSignal::Open
        );
        assert_eq!(
            read_tunnel_signal(&mut client).await.unwrap(),
            TunnelSignal::Close
        );
        assert!(matches!(
            read_tunnel_signal(&mut client).await,
            Err(ProtoError::UnknownSignal(0x55))
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_ack() {
        let (mut server, mut client) = duplex(8);
        write_heartbeat_ack(&mut server).await.unwrap();
        server.write_u8(0x00).await.unwrap();
        read_heartbeat_ack(&mut client).await.unwrap();
        assert!(matches!(
            read_heartbeat_ack(&mut client).await,
            Err(ProtoError::UnexpectedAck(0x00))
        ));
        drop(server);
        assert!(matches!(
            read_heartbeat_ack(&mut client).await,
            Err(ProtoError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_provider_hello_over_duplex() {
        let (mut a, mut b) = duplex(8);
        write_provider_hello(&mut a, ProviderHello::new(300, 4))
            .await
            .unwrap();
        let hello = read_provider_hello(&mut b).await.unwrap();
        assert_eq!(hello, ProviderHello::new(300, 4));
    }
}
