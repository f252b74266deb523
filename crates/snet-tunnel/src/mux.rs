//! 子流复用协议：把 §4.9 的 Open/OpenSuccess/ShutdownWrite/Close/Data 五种消息
//! 打包/解包成隧道记录的明文负载。
//!
//! 布局：`type(u8) || id(u64 big-endian) || type-specific`。`OpenSuccess` 的
//! `ip`/`port` 字段在本模块里以主机字节序保存；`pack`/`unpack` 在协议边界上
//! 做一次网络字节序转换，修正原始实现里 unpack 侧遗漏 `ntohl` 的不一致。

const HEAD_SIZE: usize = 1 + 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Open { id: u64, host: String, port: u16 },
    OpenSuccess { id: u64, ip: u32, port: u16 },
    ShutdownWrite { id: u64 },
    Close { id: u64 },
    Data { id: u64, payload: Vec<u8> },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MuxError {
    #[error("record too short for a sub-stream message head ({len} bytes)")]
    Truncated { len: usize },
    #[error("unknown sub-stream message type byte {0:#x}")]
    UnknownType(u8),
}

impl Message {
    pub fn id(&self) -> u64 {
        match self {
            Message::Open { id, .. }
            | Message::OpenSuccess { id, .. }
            | Message::ShutdownWrite { id }
            | Message::Close { id }
            | Message::Data { id, .. } => *id,
        }
    }

    pub fn pack(&self) -> Vec<u8> {
        match self {
            Message::Open { id, host, port } => {
                let mut buf = Vec::with_capacity(HEAD_SIZE + host.len() + 2);
                pack_head(&mut buf, 1, *id);
                buf.extend_from_slice(host.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
                buf
            }
            Message::OpenSuccess { id, ip, port } => {
                let mut buf = Vec::with_capacity(HEAD_SIZE + 4 + 2);
                pack_head(&mut buf, 2, *id);
                buf.extend_from_slice(&ip.to_be_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
                buf
            }
            Message::ShutdownWrite { id } => {
                let mut buf = Vec::with_capacity(HEAD_SIZE);
                pack_head(&mut buf, 3, *id);
                buf
            }
            Message::Close { id } => {
                let mut buf = Vec::with_capacity(HEAD_SIZE);
                pack_head(&mut buf, 4, *id);
                buf
            }
            Message::Data { id, payload } => {
                let mut buf = Vec::with_capacity(HEAD_SIZE + payload.len());
                pack_head(&mut buf, 5, *id);
                buf.extend_from_slice(payload);
                buf
            }
        }
    }

    pub fn unpack(record: &[u8]) -> Result<Message, MuxError> {
        if record.len() < HEAD_SIZE {
            return Err(MuxError::Truncated { len: record.len() });
        }
        let type_byte = record[0];
        let id = u64::from_be_bytes(record[1..HEAD_SIZE].try_into().unwrap());
        let tail = &record[HEAD_SIZE..];

        match type_byte {
            1 => {
                if tail.len() <= 2 {
                    return Err(MuxError::Truncated { len: record.len() });
                }
                let host_len = tail.len() - 2;
                let host = String::from_utf8_lossy(&tail[..host_len]).into_owned();
                let port = u16::from_be_bytes(tail[host_len..].try_into().unwrap());
                Ok(Message::Open { id, host, port })
            }
            2 => {
                if tail.len() != 6 {
                    return Err(MuxError::Truncated { len: record.len() });
                }
                let ip = u32::from_be_bytes(tail[0..4].try_into().unwrap());
                let port = u16::from_be_bytes(tail[4..6].try_into().unwrap());
                Ok(Message::OpenSuccess { id, ip, port })
            }
            3 => {
                if !tail.is_empty() {
                    return Err(MuxError::Truncated { len: record.len() });
                }
                Ok(Message::ShutdownWrite { id })
            }
            4 => {
                if !tail.is_empty() {
                    return Err(MuxError::Truncated { len: record.len() });
                }
                Ok(Message::Close { id })
            }
            5 => Ok(Message::Data {
                id,
                payload: tail.to_vec(),
            }),
            other => Err(MuxError::UnknownType(other)),
        }
    }
}

fn pack_head(buf: &mut Vec<u8>, type_byte: u8, id: u64) {
    buf.push(type_byte);
    buf.extend_from_slice(&id.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_round_trips() {
        let msg = Message::Open {
            id: 42,
            host: "example.com".to_string(),
            port: 80,
        };
        let packed = msg.pack();
        assert_eq!(Message::unpack(&packed).unwrap(), msg);
    }

    #[test]
    fn open_with_empty_host_is_rejected() {
        // A record must fit exactly; an empty host leaves nothing to
        // distinguish it from a record with no host field at all.
        let msg = Message::Open {
            id: 1,
            host: String::new(),
            port: 443,
        };
        let packed = msg.pack();
        assert_eq!(packed.len(), HEAD_SIZE + 2);
        assert_eq!(
            Message::unpack(&packed),
            Err(MuxError::Truncated { len: packed.len() })
        );
    }

    #[test]
    fn open_success_round_trips_in_host_byte_order() {
        let msg = Message::OpenSuccess {
            id: 7,
            ip: u32::from(std::net::Ipv4Addr::new(93, 184, 216, 34)),
            port: 443,
        };
        let packed = msg.pack();
        assert_eq!(Message::unpack(&packed).unwrap(), msg);
    }

    #[test]
    fn close_and_shutdown_write_round_trip() {
        assert_eq!(
            Message::unpack(&Message::Close { id: 9 }.pack()).unwrap(),
            Message::Close { id: 9 }
        );
        assert_eq!(
            Message::unpack(&Message::ShutdownWrite { id: 9 }.pack()).unwrap(),
            Message::ShutdownWrite { id: 9 }
        );
    }

    #[test]
    fn data_round_trips_arbitrary_bytes() {
        let msg = Message::Data {
            id: 3,
            payload: b"hello world".to_vec(),
        };
        let packed = msg.pack();
        assert_eq!(Message::unpack(&packed).unwrap(), msg);
    }

    #[test]
    fn data_round_trips_empty_payload() {
        let msg = Message::Data {
            id: 3,
            payload: Vec::new(),
        };
        assert_eq!(Message::unpack(&msg.pack()).unwrap(), msg);
    }

    #[test]
    fn rejects_truncated_head() {
        assert_eq!(
            Message::unpack(&[1, 2, 3]),
            Err(MuxError::Truncated { len: 3 })
        );
    }

    #[test]
    fn rejects_close_with_trailing_bytes() {
        let mut packed = Message::Close { id: 1 }.pack();
        packed.push(0xAA);
        assert!(matches!(
            Message::unpack(&packed),
            Err(MuxError::Truncated { .. })
        ));
    }

    #[test]
    fn rejects_unknown_type_byte() {
        let mut packed = Message::Close { id: 1 }.pack();
        packed[0] = 0x7F;
        assert_eq!(Message::unpack(&packed), Err(MuxError::UnknownType(0x7F)));
    }

    #[test]
    fn rejects_open_without_room_for_port() {
        // Head only, no trailing bytes for the mandatory u16 port field.
        let mut packed = Vec::new();
        pack_head(&mut packed, 1, 5);
        assert_eq!(
            Message::unpack(&packed),
            Err(MuxError::Truncated { len: packed.len() })
        );
    }
}
