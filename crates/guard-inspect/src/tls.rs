//! TLS ClientHello walking for the TCP/443 fast path: find the SNI
//! extension and return the first host name.

use crate::wire::Reader;

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const SNI_NAME_TYPE_HOST: u8 = 0x00;

pub(crate) fn client_hello_sni(payload: &[u8]) -> Option<String> {
    let mut record = Reader::new(payload);
    if record.read_u8()? != CONTENT_TYPE_HANDSHAKE {
        return None;
    }
    if record.read_u8()? != 0x03 {
        return None;
    }
    let _version_minor = record.read_u8()?;
    let record_len = usize::from(record.read_u16()?);
    // Tolerate a short segment: walk what arrived in this packet.
    let body_len = record_len.min(record.remaining());
    let mut handshake = Reader::new(record.take(body_len)?);

    if handshake.read_u8()? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    let _handshake_len = handshake.take(3)?;

    let _client_version = handshake.read_u16()?;
    let _random = handshake.take(32)?;
    let session_id_len = usize::from(handshake.read_u8()?);
    let _session_id = handshake.take(session_id_len)?;
    let cipher_suites_len = usize::from(handshake.read_u16()?);
    let _cipher_suites = handshake.take(cipher_suites_len)?;
    let compression_len = usize::from(handshake.read_u8()?);
    let _compression = handshake.take(compression_len)?;

    let extensions_len = usize::from(handshake.read_u16()?);
    let mut extensions = Reader::new(handshake.take(extensions_len)?);

    while extensions.remaining() >= 4 {
        let extension_type = extensions.read_u16()?;
        let extension_len = usize::from(extensions.read_u16()?);
        let extension_body = extensions.take(extension_len)?;
        if extension_type == EXTENSION_SERVER_NAME {
            return server_name_from_extension(extension_body);
        }
    }
    None
}

fn server_name_from_extension(body: &[u8]) -> Option<String> {
    let mut list = Reader::new(body);
    let list_len = usize::from(list.read_u16()?);
    let mut entries = Reader::new(list.take(list_len)?);

    while entries.remaining() >= 3 {
        let name_type = entries.read_u8()?;
        let name_len = usize::from(entries.read_u16()?);
        let name = entries.take(name_len)?;
        if name_type != SNI_NAME_TYPE_HOST {
            continue;
        }
        if name.is_empty() || !name.is_ascii() {
            return None;
        }
        let mut host = String::with_capacity(name.len());
        for &byte in name {
            host.push(byte.to_ascii_lowercase() as char);
        }
        return Some(host);
    }
    None
}
