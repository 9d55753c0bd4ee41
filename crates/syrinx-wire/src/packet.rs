// The packet sum type and its XDR body codec. Every body starts with a
// u32 tag from the Elvin 4.x registry; request variants carry a non-zero
// transaction id echoed by their reply.
use bytes::{BufMut, Bytes, BytesMut};

use crate::subast::SubAst;
use crate::value::{
    get_keysets, get_name_value, get_values, put_keysets, put_name_value, put_values, Keyset,
    NameValue, Value,
};
use crate::xdr;
use crate::{Error, Result};

pub const PROTOCOL_VERSION_MAJOR: u32 = 4;
pub const PROTOCOL_VERSION_MINOR: u32 = 1;

const TAG_NACK: u32 = 48;
const TAG_CONN_RQST: u32 = 49;
const TAG_CONN_RPLY: u32 = 50;
const TAG_DISCONN_RQST: u32 = 51;
const TAG_DISCONN_RPLY: u32 = 52;
const TAG_DISCONN: u32 = 53;
const TAG_NOTIFY_EMIT: u32 = 56;
const TAG_NOTIFY_DELIVER: u32 = 57;
const TAG_SUB_ADD_RQST: u32 = 58;
const TAG_SUB_MOD_RQST: u32 = 59;
const TAG_SUB_DEL_RQST: u32 = 60;
const TAG_SUB_RPLY: u32 = 61;
const TAG_TEST_CONN: u32 = 63;
const TAG_CONF_CONN: u32 = 64;
const TAG_QUENCH_ADD_RQST: u32 = 80;
const TAG_QUENCH_MOD_RQST: u32 = 81;
const TAG_QUENCH_DEL_RQST: u32 = 82;
const TAG_QUENCH_RPLY: u32 = 83;
const TAG_SUB_ADD_NOTIFY: u32 = 84;
const TAG_SUB_MOD_NOTIFY: u32 = 85;
const TAG_SUB_DEL_NOTIFY: u32 = 86;

/// Nack error codes reported by the router.
pub mod nack {
    pub const VERSION_INCOMPATIBLE: u32 = 1;
    pub const NOT_CONNECTED: u32 = 2;
    pub const PROTOCOL_ERROR: u32 = 3;
    pub const PARSE_ERROR: u32 = 2101;
    pub const UNKNOWN_SUBSCRIPTION: u32 = 2102;
    pub const UNKNOWN_QUENCH: u32 = 2103;
}

/// Reasons carried by a server-initiated Disconn.
pub mod disconn {
    /// Synthetic reason used client-side when the transport drops without a
    /// Disconn packet.
    pub const REASON_LOCAL: u32 = 0;
    pub const REASON_SHUTDOWN: u32 = 1;
    pub const REASON_REDIRECT: u32 = 2;
    pub const REASON_PROTOCOL_VIOLATION: u32 = 4;
    pub const REASON_TOO_MANY_CONNECTIONS: u32 = 5;
    pub const REASON_IDLE_TIMEOUT: u32 = 6;
}

/// Every message that can appear on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    ConnRequest {
        xid: u32,
        version_major: u32,
        version_minor: u32,
        options: NameValue,
        keys_nfn: Vec<Keyset>,
        keys_sub: Vec<Keyset>,
    },
    ConnReply {
        xid: u32,
        options: NameValue,
    },
    DisconnRequest {
        xid: u32,
    },
    DisconnReply {
        xid: u32,
    },
    Disconn {
        reason: u32,
        args: String,
    },
    Nack {
        xid: u32,
        code: u32,
        message: String,
        args: Vec<Value>,
    },
    NotifyEmit {
        name_value: NameValue,
        deliver_insecure: bool,
        keys: Vec<Keyset>,
    },
    NotifyDeliver {
        sub_ids_secure: Vec<u64>,
        sub_ids_insecure: Vec<u64>,
        name_value: NameValue,
    },
    SubAddRequest {
        xid: u32,
        expression: String,
        accept_insecure: bool,
        keys: Vec<Keyset>,
    },
    SubModRequest {
        xid: u32,
        sub_id: u64,
        expression: String,
        accept_insecure: bool,
        add_keys: Vec<Keyset>,
        del_keys: Vec<Keyset>,
    },
    SubDelRequest {
        xid: u32,
        sub_id: u64,
    },
    SubReply {
        xid: u32,
        sub_id: u64,
    },
    QuenchAddRequest {
        xid: u32,
        names: Vec<String>,
        deliver_insecure: bool,
        keys: Vec<Keyset>,
    },
    QuenchModRequest {
        xid: u32,
        quench_id: u64,
        add_names: Vec<String>,
        del_names: Vec<String>,
        deliver_insecure: bool,
        add_keys: Vec<Keyset>,
        del_keys: Vec<Keyset>,
    },
    QuenchDelRequest {
        xid: u32,
        quench_id: u64,
    },
    QuenchReply {
        xid: u32,
        quench_id: u64,
    },
    SubAddNotify {
        quench_id: u64,
        term_id: u64,
        sub_expr: SubAst,
    },
    SubModNotify {
        quench_id: u64,
        term_id: u64,
        sub_expr: SubAst,
    },
    SubDelNotify {
        quench_id: u64,
        term_id: u64,
    },
    TestConn,
    ConfConn,
}

fn put_id_list(buf: &mut BytesMut, ids: &[u64]) {
    buf.put_u32(ids.len() as u32);
    for id in ids {
        buf.put_u64(*id);
    }
}

fn get_id_list(buf: &mut Bytes) -> Result<Vec<u64>> {
    let count = xdr::get_u32(buf)?;
    let mut ids = Vec::new();
    for _ in 0..count {
        ids.push(xdr::get_u64(buf)?);
    }
    Ok(ids)
}

fn put_string_list(buf: &mut BytesMut, names: &[String]) {
    buf.put_u32(names.len() as u32);
    for name in names {
        xdr::put_string(buf, name);
    }
}

fn get_string_list(buf: &mut Bytes) -> Result<Vec<String>> {
    let count = xdr::get_u32(buf)?;
    let mut names = Vec::new();
    for _ in 0..count {
        names.push(xdr::get_string(buf)?);
    }
    Ok(names)
}

impl Packet {
    /// Transaction id for request and reply variants; None for asynchronous
    /// deliveries and the keep-alive pair.
    pub fn xid(&self) -> Option<u32> {
        match self {
            Packet::ConnRequest { xid, .. }
            | Packet::ConnReply { xid, .. }
            | Packet::DisconnRequest { xid }
            | Packet::DisconnReply { xid }
            | Packet::Nack { xid, .. }
            | Packet::SubAddRequest { xid, .. }
            | Packet::SubModRequest { xid, .. }
            | Packet::SubDelRequest { xid, .. }
            | Packet::SubReply { xid, .. }
            | Packet::QuenchAddRequest { xid, .. }
            | Packet::QuenchModRequest { xid, .. }
            | Packet::QuenchDelRequest { xid, .. }
            | Packet::QuenchReply { xid, .. } => Some(*xid),
            _ => None,
        }
    }

    /// Encode into a frame body (tag plus XDR payload, no length prefix).
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        match self {
            Packet::ConnRequest {
                xid,
                version_major,
                version_minor,
                options,
                keys_nfn,
                keys_sub,
            } => {
                buf.put_u32(TAG_CONN_RQST);
                buf.put_u32(*xid);
                buf.put_u32(*version_major);
                buf.put_u32(*version_minor);
                put_name_value(&mut buf, options);
                put_keysets(&mut buf, keys_nfn);
                put_keysets(&mut buf, keys_sub);
            }
            Packet::ConnReply { xid, options } => {
                buf.put_u32(TAG_CONN_RPLY);
                buf.put_u32(*xid);
                put_name_value(&mut buf, options);
            }
            Packet::DisconnRequest { xid } => {
                buf.put_u32(TAG_DISCONN_RQST);
                buf.put_u32(*xid);
            }
            Packet::DisconnReply { xid } => {
                buf.put_u32(TAG_DISCONN_RPLY);
                buf.put_u32(*xid);
            }
            Packet::Disconn { reason, args } => {
                buf.put_u32(TAG_DISCONN);
                buf.put_u32(*reason);
                xdr::put_string(&mut buf, args);
            }
            Packet::Nack {
                xid,
                code,
                message,
                args,
            } => {
                buf.put_u32(TAG_NACK);
                buf.put_u32(*xid);
                buf.put_u32(*code);
                xdr::put_string(&mut buf, message);
                put_values(&mut buf, args);
            }
            Packet::NotifyEmit {
                name_value,
                deliver_insecure,
                keys,
            } => {
                buf.put_u32(TAG_NOTIFY_EMIT);
                put_name_value(&mut buf, name_value);
                xdr::put_bool(&mut buf, *deliver_insecure);
                put_keysets(&mut buf, keys);
            }
            Packet::NotifyDeliver {
                sub_ids_secure,
                sub_ids_insecure,
                name_value,
            } => {
                buf.put_u32(TAG_NOTIFY_DELIVER);
                put_id_list(&mut buf, sub_ids_secure);
                put_id_list(&mut buf, sub_ids_insecure);
                put_name_value(&mut buf, name_value);
            }
            Packet::SubAddRequest {
                xid,
                expression,
                accept_insecure,
                keys,
            } => {
                buf.put_u32(TAG_SUB_ADD_RQST);
                buf.put_u32(*xid);
                xdr::put_string(&mut buf, expression);
                xdr::put_bool(&mut buf, *accept_insecure);
                put_keysets(&mut buf, keys);
            }
            Packet::SubModRequest {
                xid,
                sub_id,
                expression,
                accept_insecure,
                add_keys,
                del_keys,
            } => {
                buf.put_u32(TAG_SUB_MOD_RQST);
                buf.put_u32(*xid);
                buf.put_u64(*sub_id);
                xdr::put_string(&mut buf, expression);
                xdr::put_bool(&mut buf, *accept_insecure);
                put_keysets(&mut buf, add_keys);
                put_keysets(&mut buf, del_keys);
            }
            Packet::SubDelRequest { xid, sub_id } => {
                buf.put_u32(TAG_SUB_DEL_RQST);
                buf.put_u32(*xid);
                buf.put_u64(*sub_id);
            }
            Packet::SubReply { xid, sub_id } => {
                buf.put_u32(TAG_SUB_RPLY);
                buf.put_u32(*xid);
                buf.put_u64(*sub_id);
            }
            Packet::QuenchAddRequest {
                xid,
                names,
                deliver_insecure,
                keys,
            } => {
                buf.put_u32(TAG_QUENCH_ADD_RQST);
                buf.put_u32(*xid);
                put_string_list(&mut buf, names);
                xdr::put_bool(&mut buf, *deliver_insecure);
                put_keysets(&mut buf, keys);
            }
            Packet::QuenchModRequest {
                xid,
                quench_id,
                add_names,
                del_names,
                deliver_insecure,
                add_keys,
                del_keys,
            } => {
                buf.put_u32(TAG_QUENCH_MOD_RQST);
                buf.put_u32(*xid);
                buf.put_u64(*quench_id);
                put_string_list(&mut buf, add_names);
                put_string_list(&mut buf, del_names);
                xdr::put_bool(&mut buf, *deliver_insecure);
                put_keysets(&mut buf, add_keys);
                put_keysets(&mut buf, del_keys);
            }
            Packet::QuenchDelRequest { xid, quench_id } => {
                buf.put_u32(TAG_QUENCH_DEL_RQST);
                buf.put_u32(*xid);
                buf.put_u64(*quench_id);
            }
            Packet::QuenchReply { xid, quench_id } => {
                buf.put_u32(TAG_QUENCH_RPLY);
                buf.put_u32(*xid);
                buf.put_u64(*quench_id);
            }
            Packet::SubAddNotify {
                quench_id,
                term_id,
                sub_expr,
            } => {
                buf.put_u32(TAG_SUB_ADD_NOTIFY);
                buf.put_u64(*quench_id);
                buf.put_u64(*term_id);
                sub_expr.encode(&mut buf);
            }
            Packet::SubModNotify {
                quench_id,
                term_id,
                sub_expr,
            } => {
                buf.put_u32(TAG_SUB_MOD_NOTIFY);
                buf.put_u64(*quench_id);
                buf.put_u64(*term_id);
                sub_expr.encode(&mut buf);
            }
            Packet::SubDelNotify { quench_id, term_id } => {
                buf.put_u32(TAG_SUB_DEL_NOTIFY);
                buf.put_u64(*quench_id);
                buf.put_u64(*term_id);
            }
            Packet::TestConn => {
                buf.put_u32(TAG_TEST_CONN);
            }
            Packet::ConfConn => {
                buf.put_u32(TAG_CONF_CONN);
            }
        }
        buf.freeze()
    }

    /// Decode a frame body. The whole body must be consumed.
    pub fn decode(mut body: Bytes) -> Result<Packet> {
        let tag = xdr::get_u32(&mut body)?;
        let packet = match tag {
            TAG_CONN_RQST => Packet::ConnRequest {
                xid: xdr::get_u32(&mut body)?,
                version_major: xdr::get_u32(&mut body)?,
                version_minor: xdr::get_u32(&mut body)?,
                options: get_name_value(&mut body)?,
                keys_nfn: get_keysets(&mut body)?,
                keys_sub: get_keysets(&mut body)?,
            },
            TAG_CONN_RPLY => Packet::ConnReply {
                xid: xdr::get_u32(&mut body)?,
                options: get_name_value(&mut body)?,
            },
            TAG_DISCONN_RQST => Packet::DisconnRequest {
                xid: xdr::get_u32(&mut body)?,
            },
            TAG_DISCONN_RPLY => Packet::DisconnReply {
                xid: xdr::get_u32(&mut body)?,
            },
            TAG_DISCONN => Packet::Disconn {
                reason: xdr::get_u32(&mut body)?,
                args: xdr::get_string(&mut body)?,
            },
            TAG_NACK => Packet::Nack {
                xid: xdr::get_u32(&mut body)?,
                code: xdr::get_u32(&mut body)?,
                message: xdr::get_string(&mut body)?,
                args: get_values(&mut body)?,
            },
            TAG_NOTIFY_EMIT => Packet::NotifyEmit {
                name_value: get_name_value(&mut body)?,
                deliver_insecure: xdr::get_bool(&mut body)?,
                keys: get_keysets(&mut body)?,
            },
            TAG_NOTIFY_DELIVER => Packet::NotifyDeliver {
                sub_ids_secure: get_id_list(&mut body)?,
                sub_ids_insecure: get_id_list(&mut body)?,
                name_value: get_name_value(&mut body)?,
            },
            TAG_SUB_ADD_RQST => Packet::SubAddRequest {
                xid: xdr::get_u32(&mut body)?,
                expression: xdr::get_string(&mut body)?,
                accept_insecure: xdr::get_bool(&mut body)?,
                keys: get_keysets(&mut body)?,
            },
            TAG_SUB_MOD_RQST => Packet::SubModRequest {
                xid: xdr::get_u32(&mut body)?,
                sub_id: xdr::get_u64(&mut body)?,
                expression: xdr::get_string(&mut body)?,
                accept_insecure: xdr::get_bool(&mut body)?,
                add_keys: get_keysets(&mut body)?,
                del_keys: get_keysets(&mut body)?,
            },
            TAG_SUB_DEL_RQST => Packet::SubDelRequest {
                xid: xdr::get_u32(&mut body)?,
                sub_id: xdr::get_u64(&mut body)?,
            },
            TAG_SUB_RPLY => Packet::SubReply {
                xid: xdr::get_u32(&mut body)?,
                sub_id: xdr::get_u64(&mut body)?,
            },
            TAG_QUENCH_ADD_RQST => Packet::QuenchAddRequest {
                xid: xdr::get_u32(&mut body)?,
                names: get_string_list(&mut body)?,
                deliver_insecure: xdr::get_bool(&mut body)?,
                keys: get_keysets(&mut body)?,
            },
            TAG_QUENCH_MOD_RQST => Packet::QuenchModRequest {
                xid: xdr::get_u32(&mut body)?,
                quench_id: xdr::get_u64(&mut body)?,
                add_names: get_string_list(&mut body)?,
                del_names: get_string_list(&mut body)?,
                deliver_insecure: xdr::get_bool(&mut body)?,
                add_keys: get_keysets(&mut body)?,
                del_keys: get_keysets(&mut body)?,
            },
            TAG_QUENCH_DEL_RQST => Packet::QuenchDelRequest {
                xid: xdr::get_u32(&mut body)?,
                quench_id: xdr::get_u64(&mut body)?,
            },
            TAG_QUENCH_RPLY => Packet::QuenchReply {
                xid: xdr::get_u32(&mut body)?,
                quench_id: xdr::get_u64(&mut body)?,
            },
            TAG_SUB_ADD_NOTIFY => Packet::SubAddNotify {
                quench_id: xdr::get_u64(&mut body)?,
                term_id: xdr::get_u64(&mut body)?,
                sub_expr: SubAst::decode(&mut body)?,
            },
            TAG_SUB_MOD_NOTIFY => Packet::SubModNotify {
                quench_id: xdr::get_u64(&mut body)?,
                term_id: xdr::get_u64(&mut body)?,
                sub_expr: SubAst::decode(&mut body)?,
            },
            TAG_SUB_DEL_NOTIFY => Packet::SubDelNotify {
                quench_id: xdr::get_u64(&mut body)?,
                term_id: xdr::get_u64(&mut body)?,
            },
            TAG_TEST_CONN => Packet::TestConn,
            TAG_CONF_CONN => Packet::ConfConn,
            other => return Err(Error::UnknownPacket(other)),
        };
        if !body.is_empty() {
            return Err(Error::TrailingBytes);
        }
        Ok(packet)
    }
}
