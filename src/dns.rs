//! Authoritative DNS responder for challenge validation: it answers every A
//! query with the configured advertisement address, and every TXT query from
//! whatever the client most recently provisioned in the challenge store. It
//! never talks to an upstream resolver - it's the whole answer, standing in
//! for the zone's real nameserver for the duration of a run.

use std::net::{Ipv4Addr, UdpSocket};
use std::thread;

use log::{debug, info, warn};
use trust_dns_proto::op::{Header, Message, MessageType, OpCode, ResponseCode};
use trust_dns_proto::rr::rdata::TXT;
use trust_dns_proto::rr::{DNSClass, RData, Record, RecordType};
use trust_dns_proto::serialize::binary::{BinDecodable, BinEncodable};

use crate::error::Result;
use crate::store::{KVStore, Tripwire};

/// Binds a UDP socket and answers A/TXT queries on a dedicated thread. The
/// store is exposed so the challenge layer can provision/deprovision TXT
/// records without going through the responder itself.
pub struct DnsResponder {
    store: KVStore,
}

impl DnsResponder {
    /// Binds `0.0.0.0:<port>` and spawns the serving thread. `a_record` is
    /// the fixed IPv4 address every A query gets answered with.
    pub fn start(port: u16, a_record: Ipv4Addr) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        let store = KVStore::new();
        let worker_store = store.clone();

        thread::spawn(move || {
            if let Err(e) = serve(socket, worker_store, a_record) {
                warn!("dns responder stopped: {}", e);
            }
        });

        info!("dns responder listening on udp/{}", port);
        Ok(DnsResponder { store })
    }

    pub fn add_txt_record(&self, name: impl Into<String>, value: impl Into<String>) -> Result<Tripwire> {
        self.store.set(name, value)
    }

    pub fn del_txt_record(&self, name: impl Into<String>) -> Result<()> {
        self.store.del(name)
    }
}

fn serve(socket: UdpSocket, store: KVStore, a_record: Ipv4Addr) -> Result<()> {
    let mut buf = [0u8; 512];
    loop {
        let (len, src) = socket.recv_from(&mut buf)?;
        let request = match Message::from_bytes(&buf[..len]) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("dropping malformed dns query from {}: {}", src, e);
                continue;
            }
        };

        let response = build_response(&request, &store, a_record);
        match response.to_bytes() {
            Ok(bytes) => {
                let _ = socket.send_to(&bytes, src);
            }
            Err(e) => warn!("failed to encode dns response for {}: {}", src, e),
        }
    }
}

fn build_response(request: &Message, store: &KVStore, a_record: Ipv4Addr) -> Message {
    let mut header = Header::new();
    header.set_id(request.header().id());
    header.set_message_type(MessageType::Response);
    header.set_op_code(OpCode::Query);
    header.set_recursion_desired(request.header().recursion_desired());
    header.set_recursion_available(false);
    header.set_response_code(ResponseCode::NoError);

    let mut response = Message::new();
    *response.header_mut() = header;

    if let Some(query) = request.queries().first() {
        response.add_query(query.clone());

        let name = query.name().clone();
        debug!("dns query: {} {:?}", name, query.query_type());

        match query.query_type() {
            RecordType::A => {
                let mut record = Record::with(name, RecordType::A, 300);
                record.set_dns_class(DNSClass::ANY);
                record.set_data(Some(RData::A(a_record)));
                response.add_answer(record);
            }
            RecordType::TXT => {
                let value = store.get(name.to_string()).unwrap_or_default();
                if !value.is_empty() {
                    let mut record = Record::with(name, RecordType::TXT, 300);
                    record.set_dns_class(DNSClass::ANY);
                    record.set_data(Some(RData::TXT(TXT::new(vec![value]))));
                    response.add_answer(record);
                }
            }
            _ => {}
        }
    }

    response
}
