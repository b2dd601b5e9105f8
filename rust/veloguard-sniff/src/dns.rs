//! DNS message detection on relayed datagrams

use crate::error::{Result, SniffError};
use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record};
use std::fmt;
use std::net::Ipv4Addr;
use tracing::trace;

const DNS_HEADER_LEN: usize = 12;

/// Parsed DNS wire message
///
/// A message decoded from the wire keeps its original bytes so that an
/// unmodified message is forwarded byte for byte, independent of how the
/// encoder would lay out name compression or EDNS.
#[derive(Clone)]
pub struct DnsMessage {
    message: Message,
    wire: Option<Bytes>,
}

impl DnsMessage {
    /// Decode a DNS message from wire bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < DNS_HEADER_LEN {
            return Err(SniffError::Truncated {
                expected: DNS_HEADER_LEN,
                actual: data.len(),
            });
        }
        let message = Message::from_vec(data)?;
        Ok(Self {
            message,
            wire: Some(Bytes::copy_from_slice(data)),
        })
    }

    /// Wrap a message built in memory, e.g. a synthetic response
    pub fn from_message(message: Message) -> Self {
        Self { message, wire: None }
    }

    /// Wire encoding; identical to the parsed bytes if never modified
    pub fn to_wire(&self) -> Result<Bytes> {
        match &self.wire {
            Some(wire) => Ok(wire.clone()),
            None => Ok(Bytes::from(self.message.to_vec()?)),
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Mutable access; drops the retained wire bytes
    pub fn message_mut(&mut self) -> &mut Message {
        self.wire = None;
        &mut self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    pub fn id(&self) -> u16 {
        self.message.id()
    }

    pub fn is_response(&self) -> bool {
        self.message.message_type() == MessageType::Response
    }

    pub fn queries(&self) -> &[Query] {
        self.message.queries()
    }

    pub fn response_code(&self) -> ResponseCode {
        self.message.response_code()
    }

    /// Name of the first question, without the trailing dot
    pub fn first_query_name(&self) -> Option<String> {
        self.message.queries().first().map(|q| {
            let name = q.name().to_utf8();
            name.trim_end_matches('.').to_string()
        })
    }

    /// Build a response skeleton echoing the query's id, opcode and questions
    fn response_to(query: &DnsMessage, code: ResponseCode) -> Message {
        let q = query.message();
        let mut msg = Message::new();
        msg.set_id(q.id())
            .set_message_type(MessageType::Response)
            .set_op_code(q.op_code())
            .set_recursion_desired(q.recursion_desired())
            .set_recursion_available(true)
            .set_response_code(code);
        msg.add_queries(q.queries().iter().cloned());
        msg
    }

    /// Synthetic NXDOMAIN answer for `query`
    pub fn nxdomain(query: &DnsMessage) -> Self {
        Self::from_message(Self::response_to(query, ResponseCode::NXDomain))
    }

    /// Synthetic A-record answer for the first question of `query`
    pub fn answer_a(query: &DnsMessage, addrs: &[Ipv4Addr], ttl: u32) -> Self {
        let mut msg = Self::response_to(query, ResponseCode::NoError);
        if let Some(name) = query.queries().first().map(|q| q.name().clone()) {
            for addr in addrs {
                msg.add_answer(Record::from_rdata(name.clone(), ttl, RData::A(A(*addr))));
            }
        }
        Self::from_message(msg)
    }
}

impl fmt::Debug for DnsMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsMessage")
            .field("id", &self.id())
            .field("response", &self.is_response())
            .field("code", &self.response_code())
            .field("name", &self.first_query_name())
            .finish()
    }
}

/// Recognize a DNS query: a well-formed message with at least one
/// question. The QR bit is not consulted. Anything else is "not detected".
pub fn detect_dns_query(datagram: &[u8]) -> Option<DnsMessage> {
    match DnsMessage::parse(datagram) {
        Ok(msg) if !msg.queries().is_empty() => Some(msg),
        Ok(_) => {
            trace!("DNS message without a question, ignoring");
            None
        }
        Err(e) => {
            trace!("not a DNS query: {}", e);
            None
        }
    }
}
