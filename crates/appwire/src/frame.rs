//! # Protocol Frames
//!
//! Defines the control-channel envelope: one `Hello` from the application,
//! then any number of `Call`s answered by `Reply`s with the same `seq`.
//!
//! ## Wire Shape
//!
//! ```text
//! Variant("Hello", String(key))
//! Variant("Call", Map { seq: U64, request: Variant(method, Map { .. }) })
//! Variant("Reply", ResultOk(Map { seq: U64, response: Variant(kind, ..) }))
//! Variant("Reply", ResultErr(Map { seq: U64, reason: Variant(reason, ..) }))
//! ```
//!
//! ## Invariants
//! - **Panic Safety**: All decoding paths return `Result`, never panicking on unknown data.
//! - **Exactness**: A frame must consume its whole payload.
//! - **Evolution**: Unknown map keys are skipped.

use neopack::Decoder;
use neopack::Encoder;
use overlay::Addr;

use crate::error::Error;
use crate::error::FailureReason;
use crate::error::Result;

/// Operations an application may invoke on its host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Dial { net: String, remote: Addr },
    Listen { net: String, port: u16 },
    Accept { lis_id: u16 },
    Read { conn_id: u16, max: u32 },
    Write { conn_id: u16, data: Vec<u8> },
    CloseConn { conn_id: u16 },
    CloseListener { lis_id: u16 },
}

impl Request {
    /// Method name, as carried on the wire and in logs.
    pub fn method(&self) -> &'static str {
        match self {
            Self::Dial { .. } => "Dial",
            Self::Listen { .. } => "Listen",
            Self::Accept { .. } => "Accept",
            Self::Read { .. } => "Read",
            Self::Write { .. } => "Write",
            Self::CloseConn { .. } => "CloseConn",
            Self::CloseListener { .. } => "CloseListener",
        }
    }

    fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.variant_begin(self.method())?;
        enc.map_begin()?;
        match self {
            Self::Dial { net, remote } => {
                write_map_str(enc, "net", net)?;
                write_map_addr(enc, "remote", remote)?;
            }
            Self::Listen { net, port } => {
                write_map_str(enc, "net", net)?;
                write_map_u16(enc, "port", *port)?;
            }
            Self::Accept { lis_id } | Self::CloseListener { lis_id } => {
                write_map_u16(enc, "lis_id", *lis_id)?;
            }
            Self::Read { conn_id, max } => {
                write_map_u16(enc, "conn_id", *conn_id)?;
                enc.variant_begin("max")?;
                enc.u32(*max)?;
                enc.variant_end()?;
            }
            Self::Write { conn_id, data } => {
                write_map_u16(enc, "conn_id", *conn_id)?;
                enc.variant_begin("data")?;
                enc.bytes(data)?;
                enc.variant_end()?;
            }
            Self::CloseConn { conn_id } => {
                write_map_u16(enc, "conn_id", *conn_id)?;
            }
        }
        enc.map_end()?;
        enc.variant_end()?;
        Ok(())
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let (method, mut body) = dec.variant()?;
        let fields = Fields::decode(&mut body)?;
        Ok(match method {
            "Dial" => Self::Dial {
                net: fields.str("net")?,
                remote: fields.addr("remote")?,
            },
            "Listen" => Self::Listen {
                net: fields.str("net")?,
                port: fields.u16("port")?,
            },
            "Accept" => Self::Accept { lis_id: fields.u16("lis_id")? },
            "Read" => Self::Read {
                conn_id: fields.u16("conn_id")?,
                max: fields.field("max")?.u32()?,
            },
            "Write" => Self::Write {
                conn_id: fields.u16("conn_id")?,
                data: fields.field("data")?.bytes()?.to_vec(),
            },
            "CloseConn" => Self::CloseConn { conn_id: fields.u16("conn_id")? },
            "CloseListener" => Self::CloseListener { lis_id: fields.u16("lis_id")? },
            other => return Err(Error::UnknownVariant(format!("method {}", other))),
        })
    }
}

/// Successful results, one shape per request kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Dialed { conn_id: u16, local: Addr },
    Listening { lis_id: u16, local: Addr },
    Accepted { conn_id: u16, local: Addr, remote: Addr },
    /// Bytes read; empty means end of stream.
    Data(Vec<u8>),
    Written(u32),
    Closed,
}

impl Response {
    fn encode(&self, enc: &mut Encoder) -> Result<()> {
        match self {
            Self::Dialed { conn_id, local } => {
                enc.variant_begin("Dialed")?;
                enc.map_begin()?;
                write_map_u16(enc, "conn_id", *conn_id)?;
                write_map_addr(enc, "local", local)?;
                enc.map_end()?;
            }
            Self::Listening { lis_id, local } => {
                enc.variant_begin("Listening")?;
                enc.map_begin()?;
                write_map_u16(enc, "lis_id", *lis_id)?;
                write_map_addr(enc, "local", local)?;
                enc.map_end()?;
            }
            Self::Accepted { conn_id, local, remote } => {
                enc.variant_begin("Accepted")?;
                enc.map_begin()?;
                write_map_u16(enc, "conn_id", *conn_id)?;
                write_map_addr(enc, "local", local)?;
                write_map_addr(enc, "remote", remote)?;
                enc.map_end()?;
            }
            Self::Data(data) => {
                enc.variant_begin("Data")?;
                enc.bytes(data)?;
            }
            Self::Written(n) => {
                enc.variant_begin("Written")?;
                enc.u32(*n)?;
            }
            Self::Closed => {
                enc.variant_begin("Closed")?;
                enc.unit()?;
            }
        }
        enc.variant_end()?;
        Ok(())
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let (kind, mut body) = dec.variant()?;
        Ok(match kind {
            "Dialed" => {
                let fields = Fields::decode(&mut body)?;
                Self::Dialed {
                    conn_id: fields.u16("conn_id")?,
                    local: fields.addr("local")?,
                }
            }
            "Listening" => {
                let fields = Fields::decode(&mut body)?;
                Self::Listening {
                    lis_id: fields.u16("lis_id")?,
                    local: fields.addr("local")?,
                }
            }
            "Accepted" => {
                let fields = Fields::decode(&mut body)?;
                Self::Accepted {
                    conn_id: fields.u16("conn_id")?,
                    local: fields.addr("local")?,
                    remote: fields.addr("remote")?,
                }
            }
            "Data" => Self::Data(body.bytes()?.to_vec()),
            "Written" => Self::Written(body.u32()?),
            "Closed" => {
                body.unit()?;
                Self::Closed
            }
            other => return Err(Error::UnknownVariant(format!("response {}", other))),
        })
    }
}

impl FailureReason {
    fn encode(&self, enc: &mut Encoder) -> Result<()> {
        let name = match self {
            Self::NoSuchConnection => "NoSuchConnection",
            Self::NoSuchListener => "NoSuchListener",
            Self::UnknownNetwork(_) => "UnknownNetwork",
            Self::Transport(_) => "Transport",
            Self::Io(_) => "Io",
            Self::Closed => "Closed",
            Self::NoFreeIds => "NoFreeIds",
            Self::BadRequest(_) => "BadRequest",
        };
        enc.variant_begin(name)?;
        match self {
            Self::UnknownNetwork(s) | Self::Transport(s) | Self::Io(s) | Self::BadRequest(s) => {
                enc.str(s)?
            }
            _ => enc.unit()?,
        }
        enc.variant_end()?;
        Ok(())
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let (name, mut body) = dec.variant()?;
        Ok(match name {
            "NoSuchConnection" => Self::NoSuchConnection,
            "NoSuchListener" => Self::NoSuchListener,
            "UnknownNetwork" => Self::UnknownNetwork(body.str()?.to_string()),
            "Transport" => Self::Transport(body.str()?.to_string()),
            "Io" => Self::Io(body.str()?.to_string()),
            "Closed" => Self::Closed,
            "NoFreeIds" => Self::NoFreeIds,
            "BadRequest" => Self::BadRequest(body.str()?.to_string()),
            other => return Err(Error::UnknownVariant(format!("failure reason {}", other))),
        })
    }
}

/// A control-channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// First frame of a session: the application's instance key.
    Hello { key: String },
    Call { seq: u64, request: Request },
    Reply { seq: u64, status: std::result::Result<Response, FailureReason> },
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        match self {
            Self::Hello { key } => {
                enc.variant_begin("Hello")?;
                enc.str(key)?;
                enc.variant_end()?;
            }
            Self::Call { seq, request } => {
                enc.variant_begin("Call")?;
                enc.map_begin()?;
                write_map_u64(&mut enc, "seq", *seq)?;
                enc.variant_begin("request")?;
                request.encode(&mut enc)?;
                enc.variant_end()?;
                enc.map_end()?;
                enc.variant_end()?;
            }
            Self::Reply { seq, status: Ok(response) } => {
                enc.variant_begin("Reply")?;
                enc.result_ok_begin()?;
                enc.map_begin()?;
                write_map_u64(&mut enc, "seq", *seq)?;
                enc.variant_begin("response")?;
                response.encode(&mut enc)?;
                enc.variant_end()?;
                enc.map_end()?;
                enc.result_ok_end()?;
                enc.variant_end()?;
            }
            Self::Reply { seq, status: Err(reason) } => {
                enc.variant_begin("Reply")?;
                enc.result_err_begin()?;
                enc.map_begin()?;
                write_map_u64(&mut enc, "seq", *seq)?;
                enc.variant_begin("reason")?;
                reason.encode(&mut enc)?;
                enc.variant_end()?;
                enc.map_end()?;
                enc.result_err_end()?;
                enc.variant_end()?;
            }
        }
        Ok(enc.into_bytes()?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(bytes);
        let (kind, mut body) = dec.variant()?;
        if dec.remaining() > 0 {
            return Err(Error::TrailingBytes(dec.remaining()));
        }

        match kind {
            "Hello" => Ok(Self::Hello { key: body.str()?.to_string() }),
            "Call" => {
                let fields = Fields::decode(&mut body)?;
                Ok(Self::Call {
                    seq: fields.u64("seq")?,
                    request: Request::decode(&mut fields.field("request")?)?,
                })
            }
            "Reply" => match body.result()? {
                Ok(mut ok_body) => {
                    let fields = Fields::decode(&mut ok_body)?;
                    Ok(Self::Reply {
                        seq: fields.u64("seq")?,
                        status: Ok(Response::decode(&mut fields.field("response")?)?),
                    })
                }
                Err(mut err_body) => {
                    let fields = Fields::decode(&mut err_body)?;
                    Ok(Self::Reply {
                        seq: fields.u64("seq")?,
                        status: Err(FailureReason::decode(&mut fields.field("reason")?)?),
                    })
                }
            },
            other => Err(Error::UnknownVariant(format!("frame kind {}", other))),
        }
    }
}

/// The entries of a decoded map, looked up by key.
struct Fields<'a> {
    entries: Vec<(&'a str, Decoder<'a>)>,
}

impl<'a> Fields<'a> {
    fn decode(dec: &mut Decoder<'a>) -> Result<Self> {
        let mut map = dec.map()?;
        let mut entries = Vec::new();
        while let Some(entry) = map.next()? {
            entries.push(entry);
        }
        Ok(Self { entries })
    }

    /// A fresh decoder over the value stored under `key`.
    fn field(&self, key: &'static str) -> Result<Decoder<'a>> {
        self.entries
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, val)| val.clone())
            .ok_or(Error::MissingField(key))
    }

    fn u16(&self, key: &'static str) -> Result<u16> {
        Ok(self.field(key)?.u16()?)
    }

    fn u64(&self, key: &'static str) -> Result<u64> {
        Ok(self.field(key)?.u64()?)
    }

    fn str(&self, key: &'static str) -> Result<String> {
        Ok(self.field(key)?.str()?.to_string())
    }

    fn addr(&self, key: &'static str) -> Result<Addr> {
        Ok(self.field(key)?.str()?.parse::<Addr>()?)
    }
}

// Helpers for Map construction
fn write_map_u16(enc: &mut Encoder, key: &str, val: u16) -> Result<()> {
    enc.variant_begin(key)?;
    enc.u16(val)?;
    enc.variant_end()?;
    Ok(())
}

fn write_map_u64(enc: &mut Encoder, key: &str, val: u64) -> Result<()> {
    enc.variant_begin(key)?;
    enc.u64(val)?;
    enc.variant_end()?;
    Ok(())
}

fn write_map_str(enc: &mut Encoder, key: &str, val: &str) -> Result<()> {
    enc.variant_begin(key)?;
    enc.str(val)?;
    enc.variant_end()?;
    Ok(())
}

fn write_map_addr(enc: &mut Encoder, key: &str, addr: &Addr) -> Result<()> {
    write_map_str(enc, key, &addr.to_string())
}
